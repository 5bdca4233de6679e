use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{RegistryEntry, RegistryKind, RegistryStore};

#[derive(Debug, Default, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    entries: Vec<RegistryEntry>,
}

/// Registries stored as JSON files in the agentbox state directory.
#[derive(Debug, Clone)]
pub struct JsonRegistryStore {
    dir: PathBuf,
}

impl JsonRegistryStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Store rooted at `$XDG_STATE_HOME/agentbox` (or `~/.local/state/agentbox`).
    pub fn open_default() -> Result<Self> {
        Ok(Self::new(state_dir()?))
    }

    pub fn path(&self, kind: RegistryKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    fn read_raw(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path) {
            Ok(contents) if contents.trim().is_empty() => Ok(None),
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read registry: {}", path.display()))
            }
        }
    }

    fn write_atomic(&self, path: &Path, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create state directory: {}", self.dir.display())
        })?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;
        let json = serde_json::to_string_pretty(value).context("Failed to serialize registry")?;
        tmp.write_all(json.as_bytes())
            .context("Failed to write registry")?;
        tmp.persist(path)
            .map_err(|e| anyhow!("Failed to replace {}: {}", path.display(), e.error))?;
        Ok(())
    }
}

/// The agentbox state directory. Not created here.
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(state_home) = std::env::var("XDG_STATE_HOME")
        && !state_home.is_empty()
    {
        return Ok(PathBuf::from(state_home).join("agentbox"));
    }
    home::home_dir()
        .map(|home| home.join(".local/state/agentbox"))
        .ok_or_else(|| anyhow!("Could not determine state directory"))
}

impl RegistryStore for JsonRegistryStore {
    fn read(&self, kind: RegistryKind) -> Result<Vec<RegistryEntry>> {
        let path = self.path(kind);
        let Some(contents) = self.read_raw(&path)? else {
            return Ok(Vec::new());
        };
        let file: RegistryFile = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse registry: {}", path.display()))?;
        Ok(file.entries)
    }

    fn remove(&mut self, kind: RegistryKind, container_name: &str) -> Result<bool> {
        let path = self.path(kind);
        let Some(contents) = self.read_raw(&path)? else {
            return Ok(false);
        };

        // Edit the raw document so fields written by the launcher survive
        let mut doc: Value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse registry: {}", path.display()))?;
        let Some(entries) = doc.get_mut("entries").and_then(Value::as_array_mut) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|e| e.get("containerName").and_then(Value::as_str) != Some(container_name));
        if entries.len() == before {
            return Ok(false);
        }

        self.write_atomic(&path, &doc)?;
        debug!(path = %path.display(), container = container_name, "registry:entry removed");
        Ok(true)
    }
}
