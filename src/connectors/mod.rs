//! Session indexing for mirrored agent histories.
//!
//! The mirror itself only moves files. Turning a mirrored tree into session
//! summaries is the job of a [`SessionIndexer`]; [`JsonlSessionIndexer`] is the
//! built-in one that understands Codex rollouts and Claude Code projects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::sources::host::SessionKind;
use crate::sources::provenance::Origin;

pub mod claude_code;
pub mod codex;

/// One session as shown in a history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Provider session id, or the file stem when the log carries none.
    pub id: String,
    pub kind: SessionKind,
    pub title: Option<String>,
    /// Working directory the session ran in.
    pub cwd: Option<PathBuf>,
    /// Milliseconds since the epoch.
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub message_count: usize,
    /// Local file the summary was parsed from.
    pub source_path: PathBuf,
    /// Set for sessions that came from a remote host.
    pub origin: Option<Origin>,
}

impl SessionSummary {
    pub fn with_origin(mut self, origin: Origin) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Alias of the host the session ran on, `None` for local sessions.
    pub fn host(&self) -> Option<&str> {
        self.origin.as_ref().map(|o| o.host.as_str())
    }
}

/// Parses a mirrored tree into summaries and counts.
///
/// Implementations are called from blocking worker threads and must not assume
/// any async runtime.
pub trait SessionIndexer: Send + Sync {
    /// Every Codex rollout under `root`.
    fn codex_sessions(&self, root: &Path) -> Vec<SessionSummary>;

    /// A single Codex rollout; `None` if it holds no conversation.
    fn codex_session(&self, path: &Path) -> Option<SessionSummary>;

    /// A single Claude session file; `None` if it holds no conversation.
    fn claude_session(&self, path: &Path) -> Option<SessionSummary>;

    /// Number of sessions per working directory under `root`.
    fn cwd_counts(&self, root: &Path, kind: SessionKind) -> HashMap<String, usize>;

    /// Number of sessions under `root`.
    fn count_sessions(&self, root: &Path, kind: SessionKind) -> usize;
}

/// Default indexer reading the JSONL formats directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlSessionIndexer;

impl JsonlSessionIndexer {
    pub fn new() -> Self {
        Self
    }

    fn summaries(&self, root: &Path, kind: SessionKind) -> Vec<SessionSummary> {
        match kind {
            SessionKind::Codex => self.codex_sessions(root),
            SessionKind::Claude => claude_code::session_files(root)
                .iter()
                .filter(|path| claude_code::is_countable_session(path))
                .filter_map(|path| self.claude_session(path))
                .collect(),
        }
    }
}

impl SessionIndexer for JsonlSessionIndexer {
    fn codex_sessions(&self, root: &Path) -> Vec<SessionSummary> {
        codex::rollout_files(root)
            .iter()
            .filter_map(|path| self.codex_session(path))
            .collect()
    }

    fn codex_session(&self, path: &Path) -> Option<SessionSummary> {
        match codex::parse_rollout(path) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "codex skipping rollout");
                None
            }
        }
    }

    fn claude_session(&self, path: &Path) -> Option<SessionSummary> {
        match claude_code::parse_session(path) {
            Ok(summary) => summary,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "claude_code skipping session");
                None
            }
        }
    }

    fn cwd_counts(&self, root: &Path, kind: SessionKind) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for summary in self.summaries(root, kind) {
            if let Some(cwd) = summary.cwd {
                *counts.entry(cwd.to_string_lossy().into_owned()).or_insert(0) += 1;
            }
        }
        counts
    }

    fn count_sessions(&self, root: &Path, kind: SessionKind) -> usize {
        match kind {
            SessionKind::Codex => codex::rollout_files(root)
                .iter()
                .filter(|p| std::fs::metadata(p).is_ok_and(|m| m.len() > 0))
                .count(),
            SessionKind::Claude => claude_code::count_sessions(root),
        }
    }
}

/// Parse a timestamp that may be epoch seconds, epoch millis or ISO-8601.
///
/// Returns milliseconds since the epoch.
pub fn parse_timestamp(val: &serde_json::Value) -> Option<i64> {
    // Values below 1e11 are seconds (that is year 5138 as seconds, 1973 as millis).
    fn normalize(ts: i64) -> i64 {
        if (0..100_000_000_000).contains(&ts) {
            ts.saturating_mul(1000)
        } else {
            ts
        }
    }

    if let Some(ts) = val.as_i64() {
        return Some(normalize(ts));
    }
    if let Some(f) = val.as_f64() {
        return Some(normalize_float(f));
    }
    let s = val.as_str()?;
    if let Ok(num) = s.parse::<i64>() {
        return Some(normalize(num));
    }
    if let Ok(num) = s.parse::<f64>() {
        return Some(normalize_float(num));
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn normalize_float(f: f64) -> i64 {
    if (0.0..100_000_000_000.0).contains(&f) {
        (f * 1000.0).round() as i64
    } else {
        f.round() as i64
    }
}

/// Flatten message content that may be a string or an array of blocks.
///
/// Text and `input_text` blocks are joined with newlines; other block kinds
/// (tool calls, images) are dropped since only titles are derived from this.
pub fn flatten_content(val: &serde_json::Value) -> String {
    if let Some(s) = val.as_str() {
        return s.to_string();
    }
    let Some(arr) = val.as_array() else {
        return String::new();
    };
    let mut result = String::new();
    for item in arr {
        let text = item.as_str().or_else(|| {
            let item_type = item.get("type").and_then(|v| v.as_str());
            match item_type {
                None | Some("text" | "input_text" | "output_text") => {
                    item.get("text").and_then(|v| v.as_str())
                }
                _ => None,
            }
        });
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            if !result.is_empty() {
                result.push('\n');
            }
            result.push_str(text);
        }
    }
    result
}

/// First line of `text`, trimmed and cut to 100 characters.
pub(crate) fn title_from(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    Some(line.chars().take(100).collect())
}
