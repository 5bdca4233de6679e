use anyhow::{Result, bail};
use console::style;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::agent::{agent_id_from_session_key, normalize_agent_id};
use crate::cmd::SystemShell;
use crate::config::ConfigFile;
use crate::prompt::{Prompter, TerminalPrompter};
use crate::registry::{
    BridgeRegistry, JsonRegistryStore, Reconciler, RegistryEntry, RegistryKind, RegistryStore,
};

pub fn run(
    config_path: Option<PathBuf>,
    names: Vec<String>,
    all: bool,
    agent: Option<String>,
    browser: bool,
    force: bool,
) -> Result<()> {
    let kind = if browser {
        RegistryKind::Browser
    } else {
        RegistryKind::Sandbox
    };
    let config = ConfigFile::resolve(config_path)?.load()?;
    let shell = SystemShell;
    let mut store = JsonRegistryStore::open_default()?;
    let mut bridges = BridgeRegistry::new();
    let mut out = io::stdout();

    let bulk = all || agent.is_some();
    let targets = if bulk {
        let agent = agent.as_deref().map(normalize_agent_id);
        bulk_targets(&store.read(kind)?, agent.as_deref())
    } else if names.is_empty() {
        bail!("Specify container names, --all, or --agent <id>");
    } else {
        names
    };

    if targets.is_empty() {
        writeln!(out, "No {}s to remove", kind.noun())?;
        return Ok(());
    }

    if bulk && !force {
        let mut prompter = TerminalPrompter::new();
        if !confirm_bulk(&targets, kind, &mut prompter, &mut out)? {
            writeln!(out, "Aborted.")?;
            return Ok(());
        }
    }

    let mut reconciler = Reconciler::new(&config, &shell, &mut store, &mut bridges);
    remove_targets(&mut reconciler, &targets, kind, &mut out)
}

/// Names of registry entries owned by `agent`, or every entry when `None`.
fn bulk_targets(entries: &[RegistryEntry], agent: Option<&str>) -> Vec<String> {
    entries
        .iter()
        .filter(|e| agent.is_none_or(|id| agent_id_from_session_key(&e.session_key) == id))
        .map(|e| e.container_name.clone())
        .collect()
}

fn confirm_bulk(
    targets: &[String],
    kind: RegistryKind,
    prompter: &mut dyn Prompter,
    out: &mut dyn Write,
) -> Result<bool> {
    writeln!(out, "The following {}s will be removed:", kind.noun())?;
    for name in targets {
        writeln!(out, "  - {}", name)?;
    }
    let answer = prompter.confirm(&format!("Remove {} container(s)?", targets.len()), false)?;
    Ok(answer.unwrap_or(false))
}

fn remove_targets(
    reconciler: &mut Reconciler<'_>,
    targets: &[String],
    kind: RegistryKind,
    out: &mut dyn Write,
) -> Result<()> {
    for name in targets {
        reconciler.remove(name, kind)?;
        writeln!(out, "  {} Removed {}", style("✓").green(), name)?;
    }
    Ok(())
}
