use anyhow::Result;
use std::io::{self, Write};

use crate::cmd::{Shell, SystemShell};
use crate::host::{self, HostEnv};
use crate::prompt::{Prompter, TerminalPrompter};
use crate::provision::{Wizard, WizardOutcome};

pub fn run() -> Result<()> {
    let shell = SystemShell;
    let mut prompter = TerminalPrompter::new();
    let mut out = io::stdout();
    run_wizard(&shell, &mut prompter, &mut out)?;
    Ok(())
}

/// Detect the host, then walk the operator through rootless Podman setup.
pub fn run_wizard(
    shell: &dyn Shell,
    prompter: &mut dyn Prompter,
    out: &mut dyn Write,
) -> Result<WizardOutcome> {
    let env = HostEnv::current(shell);
    let snapshot = host::detect(shell, &env);
    Wizard::new(&snapshot, &env, shell, prompter, out).run()
}
