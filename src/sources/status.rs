//! Per-host sync status.
//!
//! Purely informational: the coordinator moves each host through
//! `Idle -> Syncing -> {Succeeded | Failed} -> Syncing -> ...` during
//! `sync_hosts`, and UIs read a snapshot. Nothing here is persisted.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Succeeded {
        at: DateTime<Utc>,
    },
    Failed {
        at: DateTime<Utc>,
        message: String,
    },
}

impl SyncState {
    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Syncing)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    /// When the last attempt finished, if it has.
    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Succeeded { at } | Self::Failed { at, .. } => Some(*at),
            Self::Idle | Self::Syncing => None,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Succeeded { at } => write!(f, "synced at {}", at.format("%Y-%m-%d %H:%M:%S UTC")),
            Self::Failed { at, message } => write!(
                f,
                "failed at {}: {}",
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                message
            ),
        }
    }
}

/// Snapshot of every host's state, ordered by alias.
pub type SyncStates = BTreeMap<String, SyncState>;
