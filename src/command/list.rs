use anyhow::Result;
use console::style;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::cmd::SystemShell;
use crate::config::ConfigFile;
use crate::registry::{
    BridgeRegistry, JsonRegistryStore, LiveContainerInfo, Reconciler, RegistryKind,
};

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "CONTAINER")]
    name: String,
    #[tabled(rename = "AGENT")]
    agent: String,
    #[tabled(rename = "BACKEND")]
    backend: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "IMAGE")]
    image: String,
    #[tabled(rename = "AGE")]
    age: String,
    #[tabled(rename = "IDLE")]
    idle: String,
}

pub fn run(config_path: Option<PathBuf>, browser: bool, json: bool) -> Result<()> {
    let config = ConfigFile::resolve(config_path)?.load()?;
    let shell = SystemShell;
    let mut store = JsonRegistryStore::open_default()?;
    let mut bridges = BridgeRegistry::new();
    let kind = if browser {
        RegistryKind::Browser
    } else {
        RegistryKind::Sandbox
    };

    let live = Reconciler::new(&config, &shell, &mut store, &mut bridges).list(kind)?;
    let mut out = io::stdout();

    if json {
        writeln!(out, "{}", serde_json::to_string_pretty(&live)?)?;
        return Ok(());
    }

    render(&live, kind, now_ms(), &mut out)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn render(live: &[LiveContainerInfo], kind: RegistryKind, now_ms: u64, out: &mut dyn Write) -> Result<()> {
    if live.is_empty() {
        writeln!(out, "No {}s found", kind.noun())?;
        return Ok(());
    }

    let rows: Vec<ContainerRow> = live
        .iter()
        .map(|info| ContainerRow {
            name: info.entry.container_name.clone(),
            agent: info.agent_id.clone(),
            backend: info.backend.to_string(),
            status: if info.running { "running" } else { "stopped" }.to_string(),
            image: if info.image_match {
                info.actual_image.clone()
            } else {
                format!("{} (mismatch)", info.actual_image)
            },
            age: format_since(now_ms, info.entry.created_at_ms),
            idle: format_since(now_ms, info.entry.last_used_at_ms),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..7), Padding::new(0, 1, 0, 0));
    writeln!(out, "{table}")?;

    let running = live.iter().filter(|i| i.running).count();
    let mismatched = live.iter().filter(|i| !i.image_match).count();
    writeln!(out)?;
    writeln!(
        out,
        "{} container{}, {} running, {} image mismatch",
        live.len(),
        if live.len() == 1 { "" } else { "s" },
        running,
        mismatched
    )?;
    if mismatched > 0 {
        let flag = match kind {
            RegistryKind::Browser => " --browser",
            RegistryKind::Sandbox => "",
        };
        writeln!(
            out,
            "{} run `agentbox remove{} <name>` on mismatched containers; they are recreated with the configured image on next use.",
            style("Hint:").cyan(),
            flag
        )?;
    }
    Ok(())
}

/// Compact elapsed time since a millisecond timestamp, or `-` when unknown.
fn format_since(now_ms: u64, then_ms: Option<u64>) -> String {
    let Some(then_ms) = then_ms else {
        return "-".to_string();
    };
    let secs = now_ms.saturating_sub(then_ms) / 1000;
    if secs < 60 {
        return format!("{}s", secs);
    }
    let minutes = secs / 60;
    if minutes < 60 {
        return format!("{}m", minutes);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{}h", hours);
    }
    format!("{}d", hours / 24)
}
