//! In-process bridges bound to browser containers.

use anyhow::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

/// A live resource serving one browser container, such as a CDP relay.
pub trait BridgeHandle {
    fn stop(&mut self) -> Result<()>;
}

// Only tests register bridges in this binary
#[cfg_attr(not(test), allow(dead_code))]
struct BridgeRecord {
    container_name: String,
    handle: Box<dyn BridgeHandle>,
}

/// Bridges keyed by session key. Owned by the command context and passed to
/// whoever removes containers.
#[derive(Default)]
pub struct BridgeRegistry {
    bridges: HashMap<String, BridgeRecord>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    /// Register a bridge, replacing and stopping any previous one for the session.
    pub fn insert(
        &mut self,
        session_key: impl Into<String>,
        container_name: impl Into<String>,
        handle: Box<dyn BridgeHandle>,
    ) {
        let record = BridgeRecord {
            container_name: container_name.into(),
            handle,
        };
        if let Some(mut old) = self.bridges.insert(session_key.into(), record) {
            let _ = old.handle.stop();
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, session_key: &str) -> bool {
        self.bridges.contains_key(session_key)
    }

    /// Stop and drop every bridge bound to `container_name`. Stop failures are
    /// logged and the bridge is dropped anyway. Returns how many were removed.
    pub fn teardown_for_container(&mut self, container_name: &str) -> usize {
        let keys: Vec<String> = self
            .bridges
            .iter()
            .filter(|(_, r)| r.container_name == container_name)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &keys {
            if let Some(mut record) = self.bridges.remove(key) {
                match record.handle.stop() {
                    Ok(()) => debug!(session = %key, container = container_name, "bridge:stopped"),
                    Err(e) => {
                        warn!(session = %key, container = container_name, error = %e, "bridge:stop failed")
                    }
                }
            }
        }
        keys.len()
    }
}
