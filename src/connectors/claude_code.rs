use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use walkdir::WalkDir;

use crate::connectors::{SessionSummary, flatten_content, parse_timestamp, title_from};
use crate::sources::host::SessionKind;

/// Sidechain transcripts written by subagents. They share the project tree with
/// real sessions but are not sessions of their own.
pub const RESERVED_SESSION_PREFIX: &str = "agent-";

/// Every `.jsonl` file under a mirrored `projects` tree, sorted by path.
pub fn session_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !root.exists() {
        return out;
    }
    for entry in WalkDir::new(root).into_iter().flatten() {
        if entry.file_type().is_file()
            && entry.path().extension().and_then(|s| s.to_str()) == Some("jsonl")
        {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    out
}

/// True for files counted as sessions: not reserved, and not empty.
pub fn is_countable_session(path: &Path) -> bool {
    let reserved = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(RESERVED_SESSION_PREFIX));
    !reserved && fs::metadata(path).is_ok_and(|m| m.len() > 0)
}

/// Number of sessions under `root`, by file enumeration alone.
pub fn count_sessions(root: &Path) -> usize {
    session_files(root)
        .iter()
        .filter(|p| is_countable_session(p))
        .count()
}

/// Summarize one session file. `Ok(None)` when it has no user or assistant turn.
pub fn parse_session(path: &Path) -> Result<Option<SessionSummary>> {
    let content = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;

    let mut cwd: Option<PathBuf> = None;
    let mut session_id: Option<String> = None;
    let mut summary_title: Option<String> = None;
    let mut first_user: Option<String> = None;
    let mut started_at = None;
    let mut ended_at = None;
    let mut message_count = 0usize;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(val) = serde_json::from_str::<Value>(line) else {
            continue;
        };

        if cwd.is_none() {
            cwd = val.get("cwd").and_then(|v| v.as_str()).map(PathBuf::from);
        }
        if session_id.is_none() {
            session_id = val
                .get("sessionId")
                .and_then(|v| v.as_str())
                .map(String::from);
        }

        let entry_type = val.get("type").and_then(|v| v.as_str());
        if entry_type == Some("summary") {
            if summary_title.is_none() {
                summary_title = val
                    .get("summary")
                    .and_then(|v| v.as_str())
                    .and_then(title_from);
            }
            continue;
        }
        if !matches!(entry_type, Some("user" | "assistant")) {
            continue;
        }

        let text = val
            .get("message")
            .and_then(|m| m.get("content"))
            .map(flatten_content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            continue;
        }

        let created = val.get("timestamp").and_then(parse_timestamp);
        started_at = started_at.or(created);
        ended_at = created.or(ended_at);
        message_count += 1;

        let is_meta = val.get("isMeta").and_then(|v| v.as_bool()).unwrap_or(false);
        if first_user.is_none()
            && entry_type == Some("user")
            && !is_meta
            && !text.trim_start().starts_with('<')
        {
            first_user = title_from(&text);
        }
    }

    if message_count == 0 {
        return Ok(None);
    }

    let id = session_id.unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    });

    Ok(Some(SessionSummary {
        id,
        kind: SessionKind::Claude,
        title: summary_title.or(first_user),
        cwd,
        started_at,
        ended_at,
        message_count,
        source_path: path.to_path_buf(),
        origin: None,
    }))
}
