//! Agent identity helpers shared by backend selection and registry reconciliation.

use regex::Regex;
use std::sync::LazyLock;

/// The agent that owns sessions not scoped to a specific agent.
pub const DEFAULT_AGENT_ID: &str = "main";

const MAX_AGENT_ID_LEN: usize = 64;

static INVALID_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^a-z0-9_-]+").expect("static regex is valid")
});

static DASH_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{2,}").expect("static regex is valid"));

/// Normalize an agent id so config entries and session keys compare equal.
///
/// Lowercases, replaces anything outside `[a-z0-9_-]` with `-`, collapses dash
/// runs, trims dashes, and caps the length. An empty result becomes `main`.
pub fn normalize_agent_id(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let replaced = INVALID_CHARS.replace_all(&lowered, "-");
    let collapsed = DASH_RUNS.replace_all(&replaced, "-");
    let trimmed: String = collapsed
        .trim_matches('-')
        .chars()
        .take(MAX_AGENT_ID_LEN)
        .collect();
    let trimmed = trimmed.trim_end_matches('-');

    if trimmed.is_empty() {
        DEFAULT_AGENT_ID.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolve the owning agent of a session key.
///
/// Keys look like `agent:<id>:<rest>`; anything else belongs to the default agent.
pub fn agent_id_from_session_key(session_key: &str) -> String {
    let mut parts = session_key.trim().splitn(3, ':');
    match (parts.next(), parts.next()) {
        (Some(prefix), Some(id)) if prefix.eq_ignore_ascii_case("agent") && !id.is_empty() => {
            normalize_agent_id(id)
        }
        _ => DEFAULT_AGENT_ID.to_string(),
    }
}
