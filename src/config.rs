use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::agent::normalize_agent_id;

/// Image used for plain sandbox containers when nothing is configured.
pub const DEFAULT_SANDBOX_IMAGE: &str = "agentbox-sandbox:bookworm-slim";

/// Image used for browser-automation containers when nothing is configured.
pub const DEFAULT_BROWSER_IMAGE: &str = "agentbox-sandbox-browser:bookworm-slim";

/// Configuration for agentbox, read from ~/.config/agentbox/config.yaml.
///
/// Keys this tool does not understand are kept in `extra` so a write never
/// drops settings that belong to other tools sharing the file.
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AgentsConfig {
    /// Settings applied to every agent unless overridden
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<AgentDefaults>,

    /// Per-agent overrides, keyed by agent id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub list: Option<Vec<AgentEntry>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AgentDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSettings>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct AgentEntry {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxSettings>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Sandbox settings shared by the global defaults and per-agent entries
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct SandboxSettings {
    /// Container backend: "docker" or "podman"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Image for plain sandbox containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Browser-automation container settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<BrowserSettings>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct BrowserSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SandboxSettings {
    fn browser_image(&self) -> Option<&str> {
        self.browser.as_ref().and_then(|b| b.image.as_deref())
    }
}

impl Config {
    /// The default location of the global config file.
    pub fn default_path() -> Result<PathBuf> {
        let home = home::home_dir().context("Could not determine home directory")?;
        Ok(home.join(".config/agentbox/config.yaml"))
    }

    /// Load configuration from a specific path. A missing file is an empty config.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config:missing, using defaults");
            return Ok(Self::default());
        }
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config at {}: {}", path.display(), e))
    }

    /// Write the config atomically: temp file in the same directory, then rename.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create config directory {}", dir.display()))?;

        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        tmp.write_all(yaml.as_bytes())
            .context("Failed to write config")?;
        tmp.persist(path)
            .with_context(|| format!("Failed to replace config at {}", path.display()))?;
        Ok(())
    }

    /// Find the entry for an agent, comparing normalized ids.
    pub fn agent(&self, agent_id: &str) -> Option<&AgentEntry> {
        let wanted = normalize_agent_id(agent_id);
        self.agents
            .list
            .as_ref()?
            .iter()
            .find(|entry| normalize_agent_id(&entry.id) == wanted)
    }

    pub fn default_sandbox(&self) -> Option<&SandboxSettings> {
        self.agents.defaults.as_ref()?.sandbox.as_ref()
    }

    fn agent_sandbox(&self, agent_id: Option<&str>) -> Option<&SandboxSettings> {
        self.agent(agent_id?)?.sandbox.as_ref()
    }

    /// Image configured for plain sandbox containers of this agent.
    pub fn sandbox_image(&self, agent_id: Option<&str>) -> String {
        self.agent_sandbox(agent_id)
            .and_then(|s| s.image.as_deref())
            .or_else(|| self.default_sandbox().and_then(|s| s.image.as_deref()))
            .unwrap_or(DEFAULT_SANDBOX_IMAGE)
            .to_string()
    }

    /// Image configured for browser containers of this agent.
    pub fn browser_image(&self, agent_id: Option<&str>) -> String {
        self.agent_sandbox(agent_id)
            .and_then(SandboxSettings::browser_image)
            .or_else(|| self.default_sandbox().and_then(SandboxSettings::browser_image))
            .unwrap_or(DEFAULT_BROWSER_IMAGE)
            .to_string()
    }

    /// Raw backend strings at the per-agent and global scopes, in that order.
    pub fn backend_values(&self, agent_id: Option<&str>) -> (Option<&str>, Option<&str>) {
        let agent = self
            .agent_sandbox(agent_id)
            .and_then(|s| s.backend.as_deref());
        let global = self.default_sandbox().and_then(|s| s.backend.as_deref());
        (agent, global)
    }
}

/// Persists a configuration snapshot.
pub trait ConfigWriter {
    fn write(&mut self, config: &Config) -> Result<()>;
}

/// The YAML config file on disk.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Use the given path, or the default location when none was passed.
    pub fn resolve(path: Option<PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Ok(Self::new(path)),
            None => Ok(Self::new(Config::default_path()?)),
        }
    }

    pub fn load(&self) -> Result<Config> {
        Config::load_from_path(&self.path)
    }
}

impl ConfigWriter for ConfigFile {
    fn write(&mut self, config: &Config) -> Result<()> {
        config.save_to_path(&self.path)?;
        info!(path = %self.path.display(), "config:written");
        Ok(())
    }
}
