use anyhow::Result;
use tracing::debug;

/// Outcome of a host probe. Absence is a normal answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe<T> {
    Detected(T),
    NotDetected,
}

impl<T> Probe<T> {
    /// Run a fallible probe, folding any failure into `NotDetected`.
    pub fn run(label: &str, f: impl FnOnce() -> Result<Option<T>>) -> Self {
        match f() {
            Ok(Some(value)) => {
                debug!(probe = label, "probe:detected");
                Probe::Detected(value)
            }
            Ok(None) => {
                debug!(probe = label, "probe:not detected");
                Probe::NotDetected
            }
            Err(e) => {
                debug!(probe = label, error = %e, "probe:failed, treating as not detected");
                Probe::NotDetected
            }
        }
    }

    pub fn is_detected(&self) -> bool {
        matches!(self, Probe::Detected(_))
    }

    pub fn detected(self) -> Option<T> {
        match self {
            Probe::Detected(value) => Some(value),
            Probe::NotDetected => None,
        }
    }
}

impl Probe<()> {
    /// A probe whose only question is whether it succeeded.
    pub fn check(label: &str, f: impl FnOnce() -> Result<()>) -> Self {
        Self::run(label, || f().map(Some))
    }
}
