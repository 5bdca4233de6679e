//! Persisted records of launched sandbox and browser containers, and their
//! reconciliation against live runtime state.

pub mod bridge;
mod reconcile;
mod store;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use bridge::BridgeRegistry;
pub use reconcile::{LiveContainerInfo, Reconciler};
pub use store::{JsonRegistryStore, state_dir};

/// Which of the two parallel registries an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryKind {
    Sandbox,
    Browser,
}

impl RegistryKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            RegistryKind::Sandbox => "containers.json",
            RegistryKind::Browser => "browsers.json",
        }
    }

    /// Noun used in operator-facing messages.
    pub fn noun(&self) -> &'static str {
        match self {
            RegistryKind::Sandbox => "sandbox container",
            RegistryKind::Browser => "browser container",
        }
    }
}

/// A launched container, as recorded by the launch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub container_name: String,
    pub image: String,
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at_ms: Option<u64>,
}

/// Read and delete access to the registries, keyed by container name.
pub trait RegistryStore {
    fn read(&self, kind: RegistryKind) -> Result<Vec<RegistryEntry>>;

    /// Delete the entry named `container_name`. Returns whether one existed.
    fn remove(&mut self, kind: RegistryKind, container_name: &str) -> Result<bool>;
}

#[cfg(test)]
pub mod testing {
    use super::{RegistryEntry, RegistryKind, RegistryStore};
    use anyhow::Result;

    /// In-memory registries for unit tests.
    #[derive(Debug, Default)]
    pub struct MemoryStore {
        pub sandboxes: Vec<RegistryEntry>,
        pub browsers: Vec<RegistryEntry>,
    }

    impl MemoryStore {
        fn entries_mut(&mut self, kind: RegistryKind) -> &mut Vec<RegistryEntry> {
            match kind {
                RegistryKind::Sandbox => &mut self.sandboxes,
                RegistryKind::Browser => &mut self.browsers,
            }
        }
    }

    impl RegistryStore for MemoryStore {
        fn read(&self, kind: RegistryKind) -> Result<Vec<RegistryEntry>> {
            Ok(match kind {
                RegistryKind::Sandbox => self.sandboxes.clone(),
                RegistryKind::Browser => self.browsers.clone(),
            })
        }

        fn remove(&mut self, kind: RegistryKind, container_name: &str) -> Result<bool> {
            let entries = self.entries_mut(kind);
            let before = entries.len();
            entries.retain(|e| e.container_name != container_name);
            Ok(entries.len() != before)
        }
    }

    pub fn entry(name: &str, image: &str, session_key: &str) -> RegistryEntry {
        RegistryEntry {
            container_name: name.to_string(),
            image: image.to_string(),
            session_key: session_key.to_string(),
            created_at_ms: None,
            last_used_at_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_uses_camel_case_fields() {
        let json = r#"{"containerName":"sb-1","image":"img:1","sessionKey":"agent:ops:x","createdAtMs":10}"#;
        let entry: RegistryEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.container_name, "sb-1");
        assert_eq!(entry.session_key, "agent:ops:x");
        assert_eq!(entry.created_at_ms, Some(10));
        assert_eq!(entry.last_used_at_ms, None);

        let out = serde_json::to_string(&entry).unwrap();
        assert!(out.contains("\"containerName\":\"sb-1\""));
        assert!(!out.contains("lastUsedAtMs"));
    }
}
