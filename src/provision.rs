//! Interactive provisioning of a host for rootless Podman.
//!
//! The wizard is a single-pass state machine. Every prompting state can move to
//! [`WizardState::Cancelled`], after which nothing else runs. Host mutations that
//! fail are reported together with the command to run by hand, and the wizard
//! moves on; only terminal I/O errors escape as `Err`.

use anyhow::Result;
use console::style;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::cmd::{Cmd, MUTATE_TIMEOUT, Shell, privileged};
use crate::host::subid::{self, SubIdAction, SubIdEntry, SubIdFile, SubIdRange};
use crate::host::unit::{self, UnitCommands};
use crate::host::{self, HostEnv, HostSnapshot, probe_subid};
use crate::prompt::Prompter;

pub const CANCELLED_NOTICE: &str = "Setup cancelled. No further changes were made.";

const UNIT_CHOICES: [&str; 2] = [
    "Skip (keep any existing unit, or don't install one)",
    "Install the systemd unit",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardState {
    Start,
    UserPrompt,
    UserCreationConfirm,
    SubUidPrompt,
    SubGidPrompt,
    ApplySubIdRanges,
    UnitInstallPrompt,
    InstallUnit,
    Done,
    Cancelled,
}

impl WizardState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WizardState::Done | WizardState::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WizardOutcome {
    Completed,
    Cancelled,
}

pub struct Wizard<'a> {
    snapshot: &'a HostSnapshot,
    env: &'a HostEnv,
    shell: &'a dyn Shell,
    prompter: &'a mut dyn Prompter,
    out: &'a mut dyn Write,
    user: String,
    user_exists: bool,
    existing_subuid: Option<SubIdEntry>,
    existing_subgid: Option<SubIdEntry>,
    subuid: SubIdRange,
    subgid: SubIdRange,
}

impl<'a> Wizard<'a> {
    pub fn new(
        snapshot: &'a HostSnapshot,
        env: &'a HostEnv,
        shell: &'a dyn Shell,
        prompter: &'a mut dyn Prompter,
        out: &'a mut dyn Write,
    ) -> Self {
        Self {
            snapshot,
            env,
            shell,
            prompter,
            out,
            user: snapshot.candidate_user.clone(),
            user_exists: snapshot.candidate_user_exists,
            existing_subuid: snapshot.subuid.clone(),
            existing_subgid: snapshot.subgid.clone(),
            subuid: SubIdRange::default(),
            subgid: SubIdRange::default(),
        }
    }

    /// Drive the state machine from `Start` to a terminal state.
    pub fn run(mut self) -> Result<WizardOutcome> {
        let mut state = WizardState::Start;
        while !state.is_terminal() {
            state = self.step(state)?;
        }
        Ok(match state {
            WizardState::Cancelled => WizardOutcome::Cancelled,
            _ => WizardOutcome::Completed,
        })
    }

    /// Execute one state and return the next.
    pub fn step(&mut self, state: WizardState) -> Result<WizardState> {
        let next = match state {
            WizardState::Start => self.start()?,
            WizardState::UserPrompt => self.user_prompt()?,
            WizardState::UserCreationConfirm => self.user_creation_confirm()?,
            WizardState::SubUidPrompt => self.subid_prompt(SubIdFile::Uid)?,
            WizardState::SubGidPrompt => self.subid_prompt(SubIdFile::Gid)?,
            WizardState::ApplySubIdRanges => self.apply_subid_ranges()?,
            WizardState::UnitInstallPrompt => self.unit_install_prompt()?,
            WizardState::InstallUnit => self.install_unit()?,
            WizardState::Done | WizardState::Cancelled => state,
        };

        if next == WizardState::Cancelled && state != WizardState::Cancelled {
            info!(?state, "provision:cancelled");
            writeln!(self.out)?;
            writeln!(self.out, "{}", style(CANCELLED_NOTICE).yellow())?;
        } else if next == WizardState::Done && state != WizardState::Done {
            writeln!(self.out)?;
            writeln!(self.out, "{}", style("Rootless Podman setup finished.").green())?;
        }
        Ok(next)
    }

    #[cfg(test)]
    pub fn user(&self) -> &str {
        &self.user
    }

    fn is_linux(&self) -> bool {
        self.snapshot.platform.is_linux()
    }

    fn start(&mut self) -> Result<WizardState> {
        writeln!(self.out, "{}", style("Rootless Podman setup").bold())?;
        writeln!(self.out)?;
        for line in self.snapshot.summary_lines() {
            writeln!(self.out, "  {}", line)?;
        }
        writeln!(self.out)?;
        if !self.snapshot.alt_runtime_available {
            writeln!(
                self.out,
                "{} podman was not found. Install it before starting sandboxes.",
                style("Note:").yellow()
            )?;
        }
        if !self.is_linux() {
            writeln!(
                self.out,
                "{} this is not a Linux host. Commands will be printed for you to run on the target host.",
                style("Note:").yellow()
            )?;
        }
        Ok(WizardState::UserPrompt)
    }

    /// Ask until a non-empty answer arrives. `None` on cancellation.
    fn ask_required(&mut self, prompt: &str, initial: &str) -> Result<Option<String>> {
        loop {
            match self.prompter.text(prompt, initial)? {
                None => return Ok(None),
                Some(value) if value.trim().is_empty() => {
                    writeln!(self.out, "  {}", style("A value is required.").red())?;
                }
                Some(value) => return Ok(Some(value.trim().to_string())),
            }
        }
    }

    fn user_prompt(&mut self) -> Result<WizardState> {
        let initial = self.user.clone();
        let Some(user) = self.ask_required("User to run rootless Podman as", &initial)? else {
            return Ok(WizardState::Cancelled);
        };
        let changed = user != self.snapshot.candidate_user;
        self.user = user;

        if !self.is_linux() {
            return Ok(WizardState::SubUidPrompt);
        }

        if changed {
            self.existing_subuid = probe_subid(self.shell, self.snapshot.platform, SubIdFile::Uid, &self.user);
            self.existing_subgid = probe_subid(self.shell, self.snapshot.platform, SubIdFile::Gid, &self.user);
        }
        if changed || !self.snapshot.candidate_user_exists {
            self.user_exists = host::user_exists(self.shell, &self.user);
        }

        if self.user_exists {
            Ok(WizardState::SubUidPrompt)
        } else {
            Ok(WizardState::UserCreationConfirm)
        }
    }

    fn useradd_command(&self) -> Cmd {
        privileged("useradd")
            .args(["-m", "-s", "/bin/bash", &self.user])
            .timeout(MUTATE_TIMEOUT)
    }

    fn user_creation_confirm(&mut self) -> Result<WizardState> {
        let prompt = format!("User '{}' does not exist. Create it now?", self.user);
        let Some(create) = self.prompter.confirm(&prompt, true)? else {
            return Ok(WizardState::Cancelled);
        };
        let manual = format!("sudo useradd -m -s /bin/bash {}", self.user);

        if !create {
            writeln!(self.out, "Create the user yourself with:")?;
            writeln!(self.out, "  {}", style(&manual).cyan())?;
            return Ok(WizardState::SubUidPrompt);
        }

        match self.useradd_command().run(self.shell) {
            Ok(_) => {
                info!(user = %self.user, "provision:user created");
                writeln!(self.out, "  {} Created user {}", style("✓").green(), self.user)?;
                self.user_exists = true;
                // Lingering keeps user services alive without a login session
                let _ = privileged("loginctl")
                    .args(["enable-linger", &self.user])
                    .timeout(MUTATE_TIMEOUT)
                    .run(self.shell);
            }
            Err(e) => {
                warn!(user = %self.user, error = %e, "provision:user creation failed");
                self.report_failure(&format!("Could not create user {}", self.user), &e, &[manual])?;
            }
        }
        Ok(WizardState::SubUidPrompt)
    }

    fn subid_prompt(&mut self, file: SubIdFile) -> Result<WizardState> {
        let existing = match file {
            SubIdFile::Uid => &self.existing_subuid,
            SubIdFile::Gid => &self.existing_subgid,
        };
        let initial = existing
            .as_ref()
            .map(|e| e.range)
            .unwrap_or_default()
            .to_string();
        let prompt = format!("{} range for {} (start:count)", file.label(), self.user);

        let range = loop {
            let Some(answer) = self.ask_required(&prompt, &initial)? else {
                return Ok(WizardState::Cancelled);
            };
            match answer.parse::<SubIdRange>() {
                Ok(range) => break range,
                Err(e) => writeln!(self.out, "  {}", style(e).red())?,
            }
        };

        match file {
            SubIdFile::Uid => {
                self.subuid = range;
                Ok(WizardState::SubGidPrompt)
            }
            SubIdFile::Gid => {
                self.subgid = range;
                if self.is_linux() {
                    Ok(WizardState::ApplySubIdRanges)
                } else {
                    writeln!(self.out, "Run these on the Linux host to assign the ranges:")?;
                    for (file, range) in [(SubIdFile::Uid, self.subuid), (SubIdFile::Gid, self.subgid)] {
                        let line = subid::compose_line(&self.user, range);
                        writeln!(self.out, "  {}", style(subid::append_command(file, &line)).cyan())?;
                    }
                    Ok(WizardState::UnitInstallPrompt)
                }
            }
        }
    }

    fn apply_subid_ranges(&mut self) -> Result<WizardState> {
        let plans = [
            (SubIdFile::Uid, self.existing_subuid.clone(), self.subuid),
            (SubIdFile::Gid, self.existing_subgid.clone(), self.subgid),
        ];
        for (file, existing, desired) in plans {
            let action = subid::plan(existing.as_ref(), &self.user, desired);
            let Some(cmd) = action.command(file, &self.user) else {
                writeln!(self.out, "  {} {} unchanged", style("•").dim(), file.path())?;
                continue;
            };
            let verb = match action {
                SubIdAction::Append { .. } => "Added",
                _ => "Updated",
            };
            match cmd.run(self.shell) {
                Ok(_) => {
                    info!(file = file.path(), user = %self.user, verb, "provision:subid applied");
                    writeln!(
                        self.out,
                        "  {} {} {}:{}",
                        style("✓").green(),
                        verb,
                        file.path(),
                        subid::compose_line(&self.user, desired)
                    )?;
                }
                Err(e) => {
                    warn!(file = file.path(), error = %e, "provision:subid failed");
                    let manual: Vec<String> =
                        action.manual_command(file, &self.user).into_iter().collect();
                    self.report_failure(&format!("Could not update {}", file.path()), &e, &manual)?;
                }
            }
        }
        Ok(WizardState::UnitInstallPrompt)
    }

    fn unit_install_prompt(&mut self) -> Result<WizardState> {
        if !self.snapshot.service_manager_available {
            writeln!(
                self.out,
                "{} systemd was not detected here. You can still generate the unit for another host.",
                style("Note:").yellow()
            )?;
        }
        match self
            .prompter
            .select("Podman systemd unit (quadlet)", &UNIT_CHOICES, 0)?
        {
            None => Ok(WizardState::Cancelled),
            Some(1) => Ok(WizardState::InstallUnit),
            Some(_) => Ok(WizardState::Done),
        }
    }

    fn fallback_home(&self) -> PathBuf {
        PathBuf::from(format!("/home/{}", self.user))
    }

    fn print_manual_install(&mut self, home: PathBuf) -> Result<WizardState> {
        let content = unit::render(&home)?;
        writeln!(self.out, "Run these on the target host to install the unit:")?;
        for line in unit::manual_install(&self.user, &home, &content) {
            writeln!(self.out, "{}", style(line).cyan())?;
        }
        Ok(WizardState::Done)
    }

    fn install_unit(&mut self) -> Result<WizardState> {
        if !(self.is_linux() && self.snapshot.service_manager_available) {
            let home = self.fallback_home();
            return self.print_manual_install(home);
        }

        let Some(home) = host::resolve_home(self.shell, self.env, &self.user) else {
            writeln!(
                self.out,
                "  {} Could not resolve the home directory of {}",
                style("✗").red(),
                self.user
            )?;
            let home = self.fallback_home();
            return self.print_manual_install(home);
        };

        let content = unit::render(&home)?;
        let cmds = UnitCommands {
            user: &self.user,
            home: &home,
            as_self: self.env.is_invoking_user(&self.user),
        };

        let mut write_failure = None;
        for cmd in [cmds.mkdir(), cmds.write(&content)] {
            if let Err(e) = cmd.run(self.shell) {
                write_failure = Some(e);
                break;
            }
        }
        if let Some(e) = write_failure {
            warn!(user = %self.user, error = %e, "provision:unit write failed");
            let manual = unit::manual_install(&self.user, &home, &content);
            self.report_failure("Could not write the unit file", &e, &manual)?;
            return Ok(WizardState::Done);
        }
        info!(path = %unit::unit_path(&home).display(), "provision:unit written");
        writeln!(
            self.out,
            "  {} Wrote {}",
            style("✓").green(),
            unit::unit_path(&home).display()
        )?;

        let activation = Cmd::new("id")
            .args(["-u", &self.user])
            .run(self.shell)
            .and_then(|uid| {
                cmds.daemon_reload(&uid).run(self.shell)?;
                cmds.enable(&uid).run(self.shell)
            });
        match activation {
            Ok(_) => {
                writeln!(
                    self.out,
                    "  {} Enabled {} for {}",
                    style("✓").green(),
                    unit::SERVICE_NAME,
                    self.user
                )?;
            }
            Err(e) => {
                warn!(user = %self.user, error = %e, "provision:unit activation failed");
                let manual = unit::manual_activation(&self.user);
                self.report_failure("Could not reload/enable the unit", &e, &manual)?;
            }
        }
        Ok(WizardState::Done)
    }

    fn report_failure(&mut self, what: &str, error: &anyhow::Error, manual: &[String]) -> Result<()> {
        writeln!(self.out, "  {} {}: {}", style("✗").red(), what, error)?;
        if !manual.is_empty() {
            writeln!(self.out, "  Run manually:")?;
            for line in manual {
                writeln!(self.out, "    {}", style(line).cyan())?;
            }
        }
        Ok(())
    }
}
