use anyhow::Result;
use console::style;
use serde_json::json;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::agent::normalize_agent_id;
use crate::backend::{self, BackendChoice, Selection};
use crate::cmd::{Shell, SystemShell};
use crate::config::{Config, ConfigFile, ConfigWriter};
use crate::prompt::{Prompter, TerminalPrompter};

pub fn run(
    config_path: Option<PathBuf>,
    json: bool,
    set: Option<String>,
    agent: Option<String>,
) -> Result<()> {
    let mut file = ConfigFile::resolve(config_path)?;
    let config = file.load()?;
    let agent = agent.as_deref().map(normalize_agent_id);
    let agent = agent.as_deref();
    let shell = SystemShell;
    let mut out = io::stdout();

    if json {
        return print_json(&config, agent, &mut out);
    }

    if let Some(requested) = set {
        set_backend(&config, agent, &requested, &mut file, &shell, &mut out)?;
        return Ok(());
    }

    let mut prompter = TerminalPrompter::new();
    choose_and_provision(&config, agent, &mut file, &shell, &mut prompter, &mut out)?;
    Ok(())
}

/// The interactive path: pick a backend, then provision the host when the
/// choice is rootless. Only this path starts the wizard.
fn choose_and_provision(
    config: &Config,
    agent: Option<&str>,
    writer: &mut dyn ConfigWriter,
    shell: &dyn Shell,
    prompter: &mut dyn Prompter,
    out: &mut dyn Write,
) -> Result<Option<Selection>> {
    let Some(selection) = choose_interactively(config, agent, writer, shell, prompter, out)? else {
        return Ok(None);
    };

    if selection.backend().is_rootless() {
        writeln!(out)?;
        super::provision::run_wizard(shell, prompter, out)?;
    }
    Ok(Some(selection))
}

fn scope_label(agent: Option<&str>) -> String {
    match agent {
        Some(id) => format!("agent '{}'", id),
        None => "all agents".to_string(),
    }
}

/// `{"backend": ..., "agentId": ...}`, with no prompts or writes.
fn print_json(config: &Config, agent: Option<&str>, out: &mut dyn Write) -> Result<()> {
    let effective = backend::current_effective(config, agent);
    let value = json!({ "backend": effective, "agentId": agent });
    writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
    Ok(())
}

/// Non-interactive `--set`. Invalid names fail before anything is written.
fn set_backend(
    config: &Config,
    agent: Option<&str>,
    requested: &str,
    writer: &mut dyn ConfigWriter,
    shell: &dyn Shell,
    out: &mut dyn Write,
) -> Result<Selection> {
    let selection = backend::select(config, agent, requested, writer)?;
    report(&selection, agent, shell, out)?;
    Ok(selection)
}

/// Prompt for a backend and persist it. `None` when the prompt was cancelled.
fn choose_interactively(
    config: &Config,
    agent: Option<&str>,
    writer: &mut dyn ConfigWriter,
    shell: &dyn Shell,
    prompter: &mut dyn Prompter,
    out: &mut dyn Write,
) -> Result<Option<Selection>> {
    let current = backend::current_effective(config, agent);
    let items: Vec<String> = BackendChoice::ALL
        .iter()
        .map(|b| match b {
            BackendChoice::Docker => "docker  (daemon, default)".to_string(),
            BackendChoice::Podman => "podman  (daemonless, rootless)".to_string(),
        })
        .collect();
    let labels: Vec<&str> = items.iter().map(String::as_str).collect();
    let default = BackendChoice::ALL
        .iter()
        .position(|b| *b == current)
        .unwrap_or_default();

    let prompt = format!("Sandbox backend for {}", scope_label(agent));
    let Some(index) = prompter.select(&prompt, &labels, default)? else {
        writeln!(out, "Cancelled.")?;
        return Ok(None);
    };
    let choice = BackendChoice::ALL[index.min(BackendChoice::ALL.len() - 1)];

    let selection = backend::apply_choice(config, agent, choice, writer)?;
    report(&selection, agent, shell, out)?;
    Ok(Some(selection))
}

fn report(
    selection: &Selection,
    agent: Option<&str>,
    shell: &dyn Shell,
    out: &mut dyn Write,
) -> Result<()> {
    let scope = scope_label(agent);
    match selection {
        Selection::Unchanged(b) => {
            writeln!(out, "Backend for {} is already {}.", scope, b)?;
        }
        Selection::Changed { from, to, .. } => {
            writeln!(
                out,
                "{} Backend for {} set to {} (was {}).",
                style("✓").green(),
                scope,
                to,
                from
            )?;
        }
    }

    let chosen = selection.backend();
    if !backend::is_available(shell, chosen) {
        writeln!(
            out,
            "{} `{} version` failed; sandboxes will not start until {} is installed and running.",
            style("Warning:").yellow(),
            chosen.binary(),
            chosen
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InvalidBackend;
    use crate::cmd::testing::FakeShell;
    use crate::config::testing::RecordingWriter;
    use crate::prompt::testing::{Answer, ScriptedPrompter};
    use crate::provision::CANCELLED_NOTICE;

    fn output(buf: Vec<u8>) -> String {
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn json_reports_effective_backend_and_normalized_agent() {
        let mut out = Vec::new();
        print_json(&Config::default(), Some("ops"), &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["backend"], "docker");
        assert_eq!(value["agentId"], "ops");

        let mut out = Vec::new();
        print_json(&Config::default(), None, &mut out).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert!(value["agentId"].is_null());
    }

    #[test]
    fn set_invalid_backend_writes_nothing() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new();
        let mut out = Vec::new();
        let err = set_backend(&Config::default(), None, "kubernetes", &mut writer, &shell, &mut out)
            .unwrap_err();
        assert!(err.downcast_ref::<InvalidBackend>().is_some());
        assert!(writer.writes.is_empty());
        assert!(out.is_empty());
    }

    #[test]
    fn set_warns_when_backend_unavailable() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new();
        let mut out = Vec::new();
        set_backend(&Config::default(), Some("ops"), "Podman", &mut writer, &shell, &mut out)
            .unwrap();
        assert_eq!(writer.writes.len(), 1);
        let text = output(out);
        assert!(text.contains("set to podman (was docker)"));
        assert!(text.contains("agent 'ops'"));
        assert!(text.contains("`podman version` failed"));
    }

    #[test]
    fn set_same_backend_reports_unchanged() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new().ok("docker version", "Server: 27.0");
        let mut out = Vec::new();
        let selection =
            set_backend(&Config::default(), None, "docker", &mut writer, &shell, &mut out).unwrap();
        assert_eq!(selection, Selection::Unchanged(BackendChoice::Docker));
        assert!(writer.writes.is_empty());
        let text = output(out);
        assert!(text.contains("already docker"));
        assert!(!text.contains("Warning"));
    }

    #[test]
    fn interactive_defaults_to_current_and_persists_choice() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new().ok("podman version", "5.0");
        let mut prompter = ScriptedPrompter::new([Answer::Select(1)]);
        let mut out = Vec::new();
        let selection = choose_interactively(
            &Config::default(),
            None,
            &mut writer,
            &shell,
            &mut prompter,
            &mut out,
        )
        .unwrap()
        .unwrap();
        assert_eq!(selection.backend(), BackendChoice::Podman);
        assert_eq!(writer.writes.len(), 1);
        assert!(prompter.asked[0].1.starts_with("docker"));
        assert!(prompter.asked[0].0.contains("all agents"));
    }

    #[test]
    fn interactive_cancel_writes_nothing() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new();
        let mut prompter = ScriptedPrompter::new([Answer::Cancel]);
        let mut out = Vec::new();
        let selection = choose_interactively(
            &Config::default(),
            None,
            &mut writer,
            &shell,
            &mut prompter,
            &mut out,
        )
        .unwrap();
        assert!(selection.is_none());
        assert!(writer.writes.is_empty());
        assert!(shell.calls().is_empty());
    }

    #[test]
    fn choosing_podman_starts_the_wizard() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new().ok("podman version", "5.0");
        let mut prompter = ScriptedPrompter::new([Answer::Select(1), Answer::Cancel]);
        let mut out = Vec::new();
        let selection = choose_and_provision(
            &Config::default(),
            None,
            &mut writer,
            &shell,
            &mut prompter,
            &mut out,
        )
        .unwrap()
        .unwrap();

        assert_eq!(selection.backend(), BackendChoice::Podman);
        assert_eq!(writer.writes.len(), 1);
        let text = output(out);
        assert!(text.contains("Rootless Podman setup"));
        assert!(text.contains(CANCELLED_NOTICE));
        assert!(shell.was_called("id -u agentbox"));
        assert_eq!(prompter.remaining(), 0);
        assert_eq!(prompter.asked.len(), 2);
    }

    #[test]
    fn choosing_docker_skips_the_wizard() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new().ok("docker version", "27.0");
        let mut prompter = ScriptedPrompter::new([Answer::Select(0)]);
        let mut out = Vec::new();
        let selection = choose_and_provision(
            &Config::default(),
            None,
            &mut writer,
            &shell,
            &mut prompter,
            &mut out,
        )
        .unwrap()
        .unwrap();

        assert_eq!(selection, Selection::Unchanged(BackendChoice::Docker));
        assert_eq!(prompter.asked.len(), 1);
        assert!(!output(out).contains("Rootless Podman setup"));
        assert_eq!(shell.calls(), vec!["docker version".to_string()]);
    }

    #[test]
    fn cancelled_choice_skips_the_wizard() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new();
        let mut prompter = ScriptedPrompter::new([Answer::Cancel]);
        let mut out = Vec::new();
        let selection = choose_and_provision(
            &Config::default(),
            None,
            &mut writer,
            &shell,
            &mut prompter,
            &mut out,
        )
        .unwrap();
        assert!(selection.is_none());
        assert!(!output(out).contains("Rootless Podman setup"));
        assert!(shell.calls().is_empty());
    }

    #[test]
    fn set_podman_does_not_provision() {
        let mut writer = RecordingWriter::default();
        let shell = FakeShell::new().ok("podman version", "5.0");
        let mut out = Vec::new();
        set_backend(&Config::default(), None, "podman", &mut writer, &shell, &mut out).unwrap();

        assert_eq!(writer.writes.len(), 1);
        assert!(!output(out).contains("Rootless Podman setup"));
        assert_eq!(shell.calls(), vec!["podman version".to_string()]);
    }
}
