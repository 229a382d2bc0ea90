use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use walkdir::WalkDir;

use crate::connectors::{SessionSummary, flatten_content, parse_timestamp, title_from};
use crate::sources::host::SessionKind;

const ROLLOUT_PREFIX: &str = "rollout-";

/// Rollout files under a mirrored `sessions` tree, sorted by path.
pub fn rollout_files(root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if !root.exists() {
        return out;
    }
    for entry in WalkDir::new(root).into_iter().flatten() {
        if entry.file_type().is_file() && is_rollout_file(entry.path()) {
            out.push(entry.path().to_path_buf());
        }
    }
    out.sort();
    out
}

/// `rollout-*.jsonl`, the only files Codex writes sessions to.
pub fn is_rollout_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name.starts_with(ROLLOUT_PREFIX) && name.ends_with(".jsonl"))
}

/// Summarize one rollout. `Ok(None)` when it has no messages.
///
/// Rollouts are envelopes of `{type, timestamp, payload}`. The working
/// directory and id come from `session_meta`; the title is the first
/// `user_message` event, falling back to the first user `response_item` that
/// is not injected context.
pub fn parse_rollout(path: &Path) -> Result<Option<SessionSummary>> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read rollout {}", path.display()))?;

    let mut id: Option<String> = None;
    let mut cwd: Option<PathBuf> = None;
    let mut started_at = None;
    let mut ended_at = None;
    let mut message_count = 0usize;
    let mut event_title: Option<String> = None;
    let mut item_title: Option<String> = None;

    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let Ok(val) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let entry_type = val.get("type").and_then(|v| v.as_str()).unwrap_or("");
        let created = val.get("timestamp").and_then(parse_timestamp);
        let Some(payload) = val.get("payload") else {
            continue;
        };

        match entry_type {
            "session_meta" => {
                if id.is_none() {
                    id = payload.get("id").and_then(|v| v.as_str()).map(String::from);
                }
                if cwd.is_none() {
                    cwd = payload.get("cwd").and_then(|v| v.as_str()).map(PathBuf::from);
                }
                started_at = started_at.or(created);
            }
            "response_item" => {
                let text = payload.get("content").map(flatten_content).unwrap_or_default();
                if text.trim().is_empty() {
                    continue;
                }
                message_count += 1;
                started_at = started_at.or(created);
                ended_at = created.or(ended_at);
                let role = payload.get("role").and_then(|v| v.as_str());
                if item_title.is_none() && role == Some("user") && !text.trim_start().starts_with('<')
                {
                    item_title = title_from(&text);
                }
            }
            "event_msg" => {
                if payload.get("type").and_then(|v| v.as_str()) == Some("user_message") {
                    let text = payload.get("message").and_then(|v| v.as_str()).unwrap_or("");
                    if event_title.is_none() {
                        event_title = title_from(text);
                    }
                    ended_at = created.or(ended_at);
                }
            }
            _ => {}
        }
    }

    if message_count == 0 && event_title.is_none() {
        return Ok(None);
    }

    let id = id.unwrap_or_else(|| {
        path.file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string()
    });

    Ok(Some(SessionSummary {
        id,
        kind: SessionKind::Codex,
        title: event_title.or(item_title),
        cwd,
        started_at,
        ended_at,
        message_count,
        source_path: path.to_path_buf(),
        origin: None,
    }))
}
