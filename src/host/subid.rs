//! Subordinate uid/gid ranges (`/etc/subuid`, `/etc/subgid`).

use anyhow::{Context, Result, anyhow, bail};
use std::fmt;
use std::str::FromStr;

use crate::cmd::{Cmd, MUTATE_TIMEOUT, PROBE_TIMEOUT, Shell, privileged};

/// Start of the range offered when a user has none configured.
pub const DEFAULT_START: u64 = 100_000;

/// Size of the range offered when a user has none configured.
pub const DEFAULT_COUNT: u64 = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubIdFile {
    Uid,
    Gid,
}

impl SubIdFile {
    pub fn path(&self) -> &'static str {
        match self {
            SubIdFile::Uid => "/etc/subuid",
            SubIdFile::Gid => "/etc/subgid",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SubIdFile::Uid => "subuid",
            SubIdFile::Gid => "subgid",
        }
    }
}

/// A `start:count` range as entered at a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubIdRange {
    pub start: u64,
    pub count: u64,
}

impl Default for SubIdRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_START,
            count: DEFAULT_COUNT,
        }
    }
}

impl FromStr for SubIdRange {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, count) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("Expected start:count, got '{}'", s.trim()))?;
        let start = start
            .trim()
            .parse()
            .with_context(|| format!("Invalid range start '{}'", start.trim()))?;
        let count: u64 = count
            .trim()
            .parse()
            .with_context(|| format!("Invalid range count '{}'", count.trim()))?;
        if count == 0 {
            bail!("Range count must be greater than zero");
        }
        Ok(Self { start, count })
    }
}

impl fmt::Display for SubIdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.count)
    }
}

/// A parsed `user:start:count` line from a subordinate id file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubIdEntry {
    pub raw_line: String,
    pub user: String,
    pub range: SubIdRange,
}

impl SubIdEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (user, rest) = line.split_once(':')?;
        if user.is_empty() {
            return None;
        }
        let range = rest.parse().ok()?;
        Some(Self {
            raw_line: line.to_string(),
            user: user.to_string(),
            range,
        })
    }
}

/// The line a user's range is stored as.
pub fn compose_line(user: &str, range: SubIdRange) -> String {
    format!("{}:{}", user, range)
}

/// Look up the first entry for `user`. A missing line or failed grep yields `Ok(None)`.
/// The grep pattern is unescaped, so lines for other users are filtered out here.
pub fn lookup(shell: &dyn Shell, file: SubIdFile, user: &str) -> Result<Option<SubIdEntry>> {
    let output = Cmd::new("grep")
        .args([format!("^{}:", user), file.path().to_string()])
        .timeout(PROBE_TIMEOUT)
        .run(shell)?;
    Ok(output
        .lines()
        .filter_map(SubIdEntry::parse)
        .find(|e| e.user == user))
}

/// What applying a desired range to one file requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubIdAction {
    /// No entry for the user yet: add a new line
    Append { line: String },
    /// An entry exists with different values: rewrite it in place
    Edit { line: String },
    /// The existing entry already matches
    Unchanged,
}

/// Decide how to bring `file` to the desired range for `user`.
pub fn plan(existing: Option<&SubIdEntry>, user: &str, desired: SubIdRange) -> SubIdAction {
    let line = compose_line(user, desired);
    match existing {
        None => SubIdAction::Append { line },
        Some(entry) if entry.raw_line == line => SubIdAction::Unchanged,
        Some(_) => SubIdAction::Edit { line },
    }
}

impl SubIdAction {
    /// The privileged command that performs this action, if any.
    pub fn command(&self, file: SubIdFile, user: &str) -> Option<Cmd> {
        match self {
            SubIdAction::Append { line } => Some(
                privileged("tee")
                    .args(["-a", file.path()])
                    .stdin(format!("{}\n", line))
                    .timeout(MUTATE_TIMEOUT),
            ),
            SubIdAction::Edit { line } => Some(
                privileged("sed")
                    .args(["-i".to_string(), sed_replace(user, line), file.path().to_string()])
                    .timeout(MUTATE_TIMEOUT),
            ),
            SubIdAction::Unchanged => None,
        }
    }

    /// Copy-pasteable equivalent of [`SubIdAction::command`].
    pub fn manual_command(&self, file: SubIdFile, user: &str) -> Option<String> {
        match self {
            SubIdAction::Append { line } => Some(append_command(file, line)),
            SubIdAction::Edit { line } => Some(format!(
                "sudo sed -i '{}' {}",
                sed_replace(user, line),
                file.path()
            )),
            SubIdAction::Unchanged => None,
        }
    }
}

/// The range-assignment command an operator runs on the target host.
pub fn append_command(file: SubIdFile, line: &str) -> String {
    format!("echo '{}' | sudo tee -a {}", line, file.path())
}

/// sed expression replacing the line that starts with `user:`.
fn sed_replace(user: &str, line: &str) -> String {
    format!("s/^{}:.*$/{}/", escape_sed(user), escape_sed(line))
}

fn escape_sed(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '.' | '[' | ']' | '*' | '^' | '$' | '\\' | '/' | '&') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
