//! Container backend selection: validation, effective-value resolution, and
//! copy-on-write config patching.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::normalize_agent_id;
use crate::cmd::{Cmd, PROBE_TIMEOUT, Shell};
use crate::config::{
    AgentDefaults, AgentEntry, AgentsConfig, Config, ConfigWriter, SandboxSettings,
};

/// Container runtime used to execute sandboxes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Daemon-based runtime (default)
    #[default]
    Docker,
    /// Daemonless runtime that can run rootless
    Podman,
}

impl BackendChoice {
    pub const ALL: [BackendChoice; 2] = [BackendChoice::Docker, BackendChoice::Podman];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendChoice::Docker => "docker",
            BackendChoice::Podman => "podman",
        }
    }

    /// The runtime binary invoked for this backend.
    pub fn binary(&self) -> &'static str {
        self.as_str()
    }

    pub fn is_rootless(&self) -> bool {
        matches!(self, BackendChoice::Podman)
    }

    /// Parse a user-supplied backend name, case-insensitively.
    pub fn validate(requested: &str) -> Result<Self, InvalidBackend> {
        let wanted = requested.trim();
        Self::ALL
            .into_iter()
            .find(|b| b.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| InvalidBackend {
                requested: requested.to_string(),
            })
    }

    pub fn valid_names() -> String {
        Self::ALL
            .iter()
            .map(|b| b.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for BackendChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid backend '{}'. Valid backends: {}", .requested, BackendChoice::valid_names())]
pub struct InvalidBackend {
    pub requested: String,
}

/// Resolve the backend in effect: per-agent override, then global default, then docker.
///
/// Unparseable stored values are skipped rather than failing the lookup.
pub fn current_effective(config: &Config, agent_id: Option<&str>) -> BackendChoice {
    let (agent_value, global_value) = config.backend_values(agent_id);
    [("agent", agent_value), ("global", global_value)]
        .into_iter()
        .filter_map(|(scope, value)| Some((scope, value?)))
        .find_map(|(scope, value)| match BackendChoice::validate(value) {
            Ok(choice) => Some(choice),
            Err(e) => {
                warn!(scope, error = %e, "backend:ignoring invalid configured value");
                None
            }
        })
        .unwrap_or_default()
}

/// A backend change to apply to a configuration without mutating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPatch {
    /// Target agent; `None` writes the global default
    pub agent: Option<String>,
    pub backend: BackendChoice,
}

impl BackendPatch {
    pub fn global(backend: BackendChoice) -> Self {
        Self {
            agent: None,
            backend,
        }
    }

    pub fn for_agent(agent: &str, backend: BackendChoice) -> Self {
        Self {
            agent: Some(normalize_agent_id(agent)),
            backend,
        }
    }

    pub fn new(agent: Option<&str>, backend: BackendChoice) -> Self {
        match agent {
            Some(id) => Self::for_agent(id, backend),
            None => Self::global(backend),
        }
    }

    /// Build the patched configuration. `base` is left untouched; only the
    /// sandbox settings on the patched path are rebuilt, siblings are carried over.
    pub fn apply(&self, base: &Config) -> Config {
        let agents = &base.agents;
        let (defaults, list) = match &self.agent {
            None => {
                let current = agents.defaults.as_ref();
                let defaults = AgentDefaults {
                    sandbox: Some(self.patch_sandbox(current.and_then(|d| d.sandbox.as_ref()))),
                    extra: current.map(|d| d.extra.clone()).unwrap_or_default(),
                };
                (Some(defaults), agents.list.clone())
            }
            Some(agent_id) => (
                agents.defaults.clone(),
                Some(self.patch_list(agent_id, agents.list.as_deref())),
            ),
        };

        Config {
            agents: AgentsConfig {
                defaults,
                list,
                extra: agents.extra.clone(),
            },
            extra: base.extra.clone(),
        }
    }

    fn patch_sandbox(&self, current: Option<&SandboxSettings>) -> SandboxSettings {
        SandboxSettings {
            backend: Some(self.backend.as_str().to_string()),
            ..current.cloned().unwrap_or_default()
        }
    }

    /// The agent list with `agent_id`'s entry patched, appending one when missing.
    fn patch_list(&self, agent_id: &str, current: Option<&[AgentEntry]>) -> Vec<AgentEntry> {
        let current = current.unwrap_or_default();
        let mut found = false;
        let mut list: Vec<AgentEntry> = current
            .iter()
            .map(|entry| {
                if !found && normalize_agent_id(&entry.id) == agent_id {
                    found = true;
                    AgentEntry {
                        sandbox: Some(self.patch_sandbox(entry.sandbox.as_ref())),
                        ..entry.clone()
                    }
                } else {
                    entry.clone()
                }
            })
            .collect();
        if !found {
            list.push(AgentEntry {
                id: agent_id.to_string(),
                sandbox: Some(self.patch_sandbox(None)),
                ..Default::default()
            });
        }
        list
    }
}

/// Outcome of a backend selection
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    /// The requested backend is already in effect; nothing was written
    Unchanged(BackendChoice),
    /// The config was patched and persisted
    Changed {
        from: BackendChoice,
        to: BackendChoice,
        config: Config,
    },
}

impl Selection {
    pub fn backend(&self) -> BackendChoice {
        match self {
            Selection::Unchanged(b) => *b,
            Selection::Changed { to, .. } => *to,
        }
    }
}

/// Validate, compare against the effective backend, and persist when it changes.
pub fn select(
    config: &Config,
    agent_id: Option<&str>,
    requested: &str,
    writer: &mut dyn ConfigWriter,
) -> Result<Selection> {
    let backend = BackendChoice::validate(requested)?;
    apply_choice(config, agent_id, backend, writer)
}

/// Like [`select`] for a backend that is already validated (interactive choice).
pub fn apply_choice(
    config: &Config,
    agent_id: Option<&str>,
    backend: BackendChoice,
    writer: &mut dyn ConfigWriter,
) -> Result<Selection> {
    let current = current_effective(config, agent_id);
    if current == backend {
        debug!(backend = %backend, ?agent_id, "backend:unchanged");
        return Ok(Selection::Unchanged(backend));
    }

    let patched = BackendPatch::new(agent_id, backend).apply(config);
    writer.write(&patched)?;
    info!(from = %current, to = %backend, ?agent_id, "backend:changed");

    Ok(Selection::Changed {
        from: current,
        to: backend,
        config: patched,
    })
}

/// Best-effort liveness check: `<backend> version` with a short timeout.
pub fn is_available(shell: &dyn Shell, backend: BackendChoice) -> bool {
    let available = Cmd::new(backend.binary())
        .arg("version")
        .timeout(PROBE_TIMEOUT)
        .run_as_check(shell);
    debug!(backend = %backend, available, "backend:availability");
    available
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::testing::FakeShell;
    use crate::config::testing::RecordingWriter;

    fn config_with(global: Option<&str>, agents: &[(&str, Option<&str>)]) -> Config {
        let mut config = Config::default();
        if let Some(b) = global {
            config.agents.defaults = Some(AgentDefaults {
                sandbox: Some(SandboxSettings {
                    backend: Some(b.to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
        if !agents.is_empty() {
            config.agents.list = Some(
                agents
                    .iter()
                    .map(|(id, backend)| AgentEntry {
                        id: id.to_string(),
                        sandbox: backend.map(|b| SandboxSettings {
                            backend: Some(b.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    })
                    .collect(),
            );
        }
        config
    }

    #[test]
    fn validate_is_case_insensitive() {
        assert_eq!(BackendChoice::validate("Docker"), Ok(BackendChoice::Docker));
        assert_eq!(BackendChoice::validate(" PODMAN "), Ok(BackendChoice::Podman));
    }

    #[test]
    fn validate_rejects_unknown_names_with_valid_set() {
        for bad in ["kubernetes", "", "dock", "podman2", "lxc"] {
            let err = BackendChoice::validate(bad).unwrap_err();
            assert_eq!(err.requested, bad);
            let msg = err.to_string();
            assert!(msg.contains(&format!("'{}'", bad)));
            assert!(msg.contains("docker, podman"));
        }
    }

    #[test]
    fn effective_prefers_agent_then_global_then_default() {
        let config = config_with(Some("podman"), &[("work", Some("docker")), ("idle", None)]);
        assert_eq!(current_effective(&config, Some("work")), BackendChoice::Docker);
        assert_eq!(current_effective(&config, Some("idle")), BackendChoice::Podman);
        assert_eq!(current_effective(&config, Some("unknown")), BackendChoice::Podman);
        assert_eq!(current_effective(&config, None), BackendChoice::Podman);
        assert_eq!(
            current_effective(&Config::default(), None),
            BackendChoice::Docker
        );
    }

    #[test]
    fn effective_skips_invalid_stored_values() {
        let config = config_with(Some("podman"), &[("work", Some("bogus"))]);
        assert_eq!(current_effective(&config, Some("work")), BackendChoice::Podman);
    }

    #[test]
    fn global_patch_leaves_input_untouched() {
        let base = config_with(Some("docker"), &[]);
        let patched = BackendPatch::global(BackendChoice::Podman).apply(&base);
        assert_eq!(base.backend_values(None), (None, Some("docker")));
        assert_eq!(patched.backend_values(None), (None, Some("podman")));
    }

    #[test]
    fn agent_patch_creates_exactly_one_entry() {
        let base = config_with(None, &[("work", Some("docker")), ("research", None)]);
        let patched = BackendPatch::for_agent("New Agent", BackendChoice::Podman).apply(&base);

        let list = patched.agents.list.as_ref().unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list[0], base.agents.list.as_ref().unwrap()[0]);
        assert_eq!(list[1], base.agents.list.as_ref().unwrap()[1]);
        assert_eq!(list[2].id, "new-agent");
        assert_eq!(
            patched.backend_values(Some("new-agent")).0,
            Some("podman")
        );
        assert_eq!(base.agents.list.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn agent_patch_updates_existing_entry_by_normalized_id() {
        let base = config_with(None, &[("Work", Some("docker"))]);
        let patched = BackendPatch::for_agent("WORK", BackendChoice::Podman).apply(&base);
        let list = patched.agents.list.as_ref().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "Work");
        assert_eq!(
            list[0].sandbox.as_ref().unwrap().backend.as_deref(),
            Some("podman")
        );
    }

    #[test]
    fn patch_keeps_sibling_settings() {
        let mut base = config_with(Some("docker"), &[("work", Some("docker"))]);
        base.extra.insert("theme".into(), "dark".into());
        if let Some(defaults) = base.agents.defaults.as_mut()
            && let Some(sandbox) = defaults.sandbox.as_mut()
        {
            sandbox.image = Some("sandbox:1".to_string());
        }

        let patched = BackendPatch::global(BackendChoice::Podman).apply(&base);
        let sandbox = patched.agents.defaults.as_ref().unwrap().sandbox.as_ref().unwrap();
        assert_eq!(sandbox.image.as_deref(), Some("sandbox:1"));
        assert_eq!(patched.extra, base.extra);
        assert_eq!(patched.agents.list, base.agents.list);

        let patched = BackendPatch::for_agent("work", BackendChoice::Podman).apply(&base);
        assert_eq!(patched.agents.defaults, base.agents.defaults);
        assert_eq!(patched.backend_values(Some("work")).0, Some("podman"));
    }

    #[test]
    fn select_invalid_backend_never_writes() {
        let config = config_with(Some("docker"), &[]);
        let mut writer = RecordingWriter::default();
        let err = select(&config, None, "kubernetes", &mut writer).unwrap_err();
        assert!(err.downcast_ref::<InvalidBackend>().is_some());
        assert!(writer.writes.is_empty());
    }

    #[test]
    fn select_current_backend_is_a_noop() {
        let config = config_with(Some("docker"), &[("work", Some("podman"))]);
        let mut writer = RecordingWriter::default();

        let global = select(&config, None, "docker", &mut writer).unwrap();
        assert_eq!(global, Selection::Unchanged(BackendChoice::Docker));

        let agent = select(&config, Some("work"), "Podman", &mut writer).unwrap();
        assert_eq!(agent, Selection::Unchanged(BackendChoice::Podman));

        let implicit = select(&Config::default(), None, "docker", &mut writer).unwrap();
        assert_eq!(implicit, Selection::Unchanged(BackendChoice::Docker));

        assert!(writer.writes.is_empty());
    }

    #[test]
    fn select_new_backend_writes_once() {
        let config = config_with(Some("docker"), &[]);
        let mut writer = RecordingWriter::default();
        let selection = select(&config, None, "podman", &mut writer).unwrap();

        match &selection {
            Selection::Changed { from, to, config } => {
                assert_eq!(*from, BackendChoice::Docker);
                assert_eq!(*to, BackendChoice::Podman);
                assert_eq!(writer.writes, vec![config.clone()]);
            }
            other => panic!("expected change, got {:?}", other),
        }
        assert_eq!(selection.backend(), BackendChoice::Podman);
    }

    #[test]
    fn availability_probe_never_fails() {
        let shell = FakeShell::new().ok("docker version", "Client: 27.0");
        assert!(is_available(&shell, BackendChoice::Docker));
        assert!(!is_available(&shell, BackendChoice::Podman));
        assert!(shell.was_called("podman version"));
    }
}
