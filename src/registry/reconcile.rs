use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{BridgeRegistry, RegistryEntry, RegistryKind, RegistryStore};
use crate::agent::agent_id_from_session_key;
use crate::backend::{self, BackendChoice};
use crate::cmd::{Cmd, MUTATE_TIMEOUT, PROBE_TIMEOUT, Shell};
use crate::config::Config;

/// A registry entry joined with what its runtime reports right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveContainerInfo {
    #[serde(flatten)]
    pub entry: RegistryEntry,
    pub backend: BackendChoice,
    pub running: bool,
    pub actual_image: String,
    pub image_match: bool,
    pub agent_id: String,
}

/// The image an agent's containers of `kind` should run.
pub fn configured_image(config: &Config, kind: RegistryKind, agent_id: &str) -> String {
    match kind {
        RegistryKind::Sandbox => config.sandbox_image(Some(agent_id)),
        RegistryKind::Browser => config.browser_image(Some(agent_id)),
    }
}

pub struct Reconciler<'a> {
    config: &'a Config,
    shell: &'a dyn Shell,
    store: &'a mut dyn RegistryStore,
    bridges: &'a mut BridgeRegistry,
}

impl<'a> Reconciler<'a> {
    pub fn new(
        config: &'a Config,
        shell: &'a dyn Shell,
        store: &'a mut dyn RegistryStore,
        bridges: &'a mut BridgeRegistry,
    ) -> Self {
        Self {
            config,
            shell,
            store,
            bridges,
        }
    }

    /// Registry entries of `kind`, in registry order, with their live state.
    pub fn list(&self, kind: RegistryKind) -> Result<Vec<LiveContainerInfo>> {
        let entries = self.store.read(kind)?;
        Ok(entries
            .into_iter()
            .map(|entry| self.inspect(kind, entry))
            .collect())
    }

    fn inspect(&self, kind: RegistryKind, entry: RegistryEntry) -> LiveContainerInfo {
        let agent_id = agent_id_from_session_key(&entry.session_key);
        let configured = configured_image(self.config, kind, &agent_id);
        let backend = backend::current_effective(self.config, Some(&agent_id));

        let state = inspect_field(self.shell, backend, "{{.State.Running}}", &entry.container_name);
        let running = state.as_deref().is_ok_and(|s| s.trim() == "true");
        let actual_image = match state {
            Ok(_) => inspect_field(self.shell, backend, "{{.Config.Image}}", &entry.container_name)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| entry.image.clone()),
            Err(e) => {
                debug!(container = %entry.container_name, %backend, error = %e, "registry:container missing");
                entry.image.clone()
            }
        };

        LiveContainerInfo {
            image_match: actual_image == configured,
            entry,
            backend,
            running,
            actual_image,
            agent_id,
        }
    }

    /// Force-remove `name` on both backends, drop its registry entry, and tear
    /// down bridges bound to it. Runtime failures never fail the removal.
    pub fn remove(&mut self, name: &str, kind: RegistryKind) -> Result<()> {
        for backend in BackendChoice::ALL {
            let result = Cmd::new(backend.binary())
                .args(["rm", "-f", name])
                .timeout(MUTATE_TIMEOUT)
                .run(self.shell);
            match result {
                Ok(_) => info!(container = name, %backend, "registry:container removed"),
                Err(e) if is_absent(&e) => {
                    debug!(container = name, %backend, error = %e, "registry:nothing to remove")
                }
                Err(e) => warn!(container = name, %backend, error = %e, "registry:remove failed"),
            }
        }

        let existed = self.store.remove(kind, name)?;
        debug!(container = name, existed, "registry:entry dropped");

        if kind == RegistryKind::Browser {
            let stopped = self.bridges.teardown_for_container(name);
            if stopped > 0 {
                info!(container = name, stopped, "registry:bridges torn down");
            }
        }
        Ok(())
    }
}

fn inspect_field(shell: &dyn Shell, backend: BackendChoice, format: &str, name: &str) -> Result<String> {
    Cmd::new(backend.binary())
        .args(["inspect", "-f", format, name])
        .timeout(PROBE_TIMEOUT)
        .run(shell)
}

/// Failures that only mean there was nothing to remove on that backend.
fn is_absent(error: &anyhow::Error) -> bool {
    let message = error.to_string().to_lowercase();
    ["no such container", "no container with name", "command not found"]
        .iter()
        .any(|needle| message.contains(needle))
}
