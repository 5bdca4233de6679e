use anyhow::{Result, anyhow};
use std::path::PathBuf;
use tracing::{debug, info};

use super::subid::{self, SubIdEntry, SubIdFile};
use super::unit;
use super::{HostEnv, Platform, Probe};
use crate::cmd::{Cmd, PROBE_TIMEOUT, QUICK_TIMEOUT, Shell};

/// Dedicated service account preferred for running the rootless gateway.
pub const SERVICE_ACCOUNT: &str = "agentbox";

/// Host readiness for the rootless backend, captured once per wizard run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSnapshot {
    pub platform: Platform,
    pub alt_runtime_available: bool,
    pub candidate_user: String,
    pub candidate_user_exists: bool,
    pub subuid: Option<SubIdEntry>,
    pub subgid: Option<SubIdEntry>,
    pub service_manager_available: bool,
    pub unit_installed: bool,
}

impl HostSnapshot {
    /// Human-readable summary shown before the wizard prompts.
    pub fn summary_lines(&self) -> Vec<String> {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        let range = |entry: &Option<SubIdEntry>| {
            entry
                .as_ref()
                .map(|e| e.raw_line.clone())
                .unwrap_or_else(|| "not configured".to_string())
        };

        let mut lines = vec![
            format!("Platform:        {}", self.platform.name()),
            format!("Podman:          {}", yes_no(self.alt_runtime_available)),
            format!(
                "User:            {} (exists: {})",
                self.candidate_user,
                yes_no(self.candidate_user_exists)
            ),
            format!("subuid:          {}", range(&self.subuid)),
            format!("subgid:          {}", range(&self.subgid)),
        ];
        if self.service_manager_available {
            lines.push(format!(
                "systemd unit:    {}",
                if self.unit_installed {
                    "installed"
                } else {
                    "not installed"
                }
            ));
        } else {
            lines.push("systemd:         not found".to_string());
        }
        lines
    }
}

/// Does `user` exist on this host?
pub fn user_exists(shell: &dyn Shell, user: &str) -> bool {
    Probe::check("user", || {
        Cmd::new("id")
            .args(["-u", user])
            .timeout(PROBE_TIMEOUT)
            .run(shell)
            .map(drop)
    })
    .is_detected()
}

/// Home directory of `user`: taken from the environment for the invoking user,
/// otherwise from the passwd database.
pub fn resolve_home(shell: &dyn Shell, env: &HostEnv, user: &str) -> Option<PathBuf> {
    if env.is_invoking_user(user)
        && let Some(home) = &env.invoking_home
    {
        return Some(home.clone());
    }

    Probe::run("home", || lookup_passwd_home(shell, user)).detected()
}

fn lookup_passwd_home(shell: &dyn Shell, user: &str) -> Result<Option<PathBuf>> {
    let line = Cmd::new("getent")
        .args(["passwd", user])
        .timeout(PROBE_TIMEOUT)
        .run(shell)?;
    let home = line
        .lines()
        .next()
        .and_then(|l| l.split(':').nth(5))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow!("No home directory in passwd entry for {}", user))?;
    Ok(Some(PathBuf::from(home)))
}

/// Probe a subordinate id file for `user` (Linux only).
pub(crate) fn probe_subid(
    shell: &dyn Shell,
    platform: Platform,
    file: SubIdFile,
    user: &str,
) -> Option<SubIdEntry> {
    if !platform.is_linux() {
        return None;
    }
    Probe::run(file.label(), || subid::lookup(shell, file, user)).detected()
}

/// Run the detection probes in order. Never fails: each failed probe yields
/// its conservative default.
pub fn detect(shell: &dyn Shell, env: &HostEnv) -> HostSnapshot {
    let platform = env.platform;

    let alt_runtime_available = Probe::check("podman", || {
        Cmd::new("podman").arg("version").run(shell).map(drop)
    })
    .is_detected();

    let candidate_user = if user_exists(shell, SERVICE_ACCOUNT) {
        SERVICE_ACCOUNT.to_string()
    } else {
        env.invoking_user.clone()
    };

    let subuid = probe_subid(shell, platform, SubIdFile::Uid, &candidate_user);
    let subgid = probe_subid(shell, platform, SubIdFile::Gid, &candidate_user);

    let candidate_user_exists = user_exists(shell, &candidate_user);

    let service_manager_available = Probe::check("systemd", || {
        Cmd::new("systemctl").arg("--version").run(shell).map(drop)
    })
    .is_detected();

    let unit_installed = service_manager_available
        && candidate_user_exists
        && resolve_home(shell, env, &candidate_user).is_some_and(|home| {
            Probe::check("unit", || {
                Cmd::new("test")
                    .args(["-f".to_string(), unit::unit_path(&home).display().to_string()])
                    .timeout(QUICK_TIMEOUT)
                    .run(shell)
                    .map(drop)
            })
            .is_detected()
        });

    let snapshot = HostSnapshot {
        platform,
        alt_runtime_available,
        candidate_user,
        candidate_user_exists,
        subuid,
        subgid,
        service_manager_available,
        unit_installed,
    };
    debug!(?snapshot, "host:snapshot");
    info!(
        user = %snapshot.candidate_user,
        podman = snapshot.alt_runtime_available,
        systemd = snapshot.service_manager_available,
        "host:detected"
    );
    snapshot
}
