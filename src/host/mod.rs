//! Host readiness for the rootless backend: detection, subordinate id ranges,
//! and the service-manager unit.

mod detect;
mod probe;
pub mod subid;
pub mod unit;

use std::path::PathBuf;

use crate::cmd::{Cmd, Shell};

pub(crate) use detect::probe_subid;
pub use detect::{HostSnapshot, detect, resolve_home, user_exists};
pub use probe::Probe;

/// Operating system family, as far as provisioning cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Other,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Other
        }
    }

    pub fn is_linux(&self) -> bool {
        matches!(self, Platform::Linux)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Other => std::env::consts::OS,
        }
    }
}

/// Facts about the invoking process that never need a probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEnv {
    pub platform: Platform,
    pub invoking_user: String,
    pub invoking_home: Option<PathBuf>,
}

impl HostEnv {
    /// Gather the current platform, user name and home directory.
    pub fn current(shell: &dyn Shell) -> Self {
        let invoking_user = ["USER", "LOGNAME"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
            .or_else(|| Cmd::new("id").arg("-un").run(shell).ok())
            .unwrap_or_else(|| "root".to_string());

        Self {
            platform: Platform::current(),
            invoking_user,
            invoking_home: home::home_dir(),
        }
    }

    pub fn is_invoking_user(&self, user: &str) -> bool {
        self.invoking_user == user
    }
}
