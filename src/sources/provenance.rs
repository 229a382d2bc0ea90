//! Provenance of mirrored files.
//!
//! Every file the engine keeps in the local cache is tied back to the remote
//! file it came from. Downstream consumers use this to stamp "fetched from host
//! X at path Y" onto the records they derive from the file.
//!
//! # Example
//!
//! ```rust
//! use session_mirror::sources::provenance::Origin;
//!
//! let origin = Origin::new("devbox", "~/.codex/sessions/2024/05/01/rollout-a.jsonl", 1714550400.0);
//! assert_eq!(origin.display_label(), "devbox:~/.codex/sessions/2024/05/01/rollout-a.jsonl");
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::host::SessionKind;

/// Where a single local file came from on its host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteFileRef {
    /// Home-relative remote path (`~/.codex/sessions/...`).
    pub remote_path: String,
    /// Remote modification time, seconds since the epoch.
    pub remote_mtime: f64,
}

/// Result of mirroring one `(host, kind)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorOutcome {
    /// Alias of the host the files came from.
    pub host: String,
    pub kind: SessionKind,
    /// `<cache_root>/<alias>/<kind>`.
    pub local_root: PathBuf,
    /// Every local file that is current as of the mirror call.
    pub files: HashMap<PathBuf, RemoteFileRef>,
}

impl MirrorOutcome {
    pub fn new(host: impl Into<String>, kind: SessionKind, local_root: PathBuf) -> Self {
        Self {
            host: host.into(),
            kind,
            local_root,
            files: HashMap::new(),
        }
    }

    /// Provenance for a local file, if this outcome covers it.
    pub fn origin_for(&self, local_path: &Path) -> Option<Origin> {
        self.files.get(local_path).map(|file| Origin {
            host: self.host.clone(),
            remote_path: file.remote_path.clone(),
            remote_mtime: file.remote_mtime,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Per-record provenance attached to derived session summaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Origin {
    /// Host alias.
    pub host: String,
    pub remote_path: String,
    pub remote_mtime: f64,
}

impl Origin {
    pub fn new(host: impl Into<String>, remote_path: impl Into<String>, remote_mtime: f64) -> Self {
        Self {
            host: host.into(),
            remote_path: remote_path.into(),
            remote_mtime,
        }
    }

    /// `host:path`, the way scp would name the file.
    pub fn display_label(&self) -> String {
        format!("{}:{}", self.host, self.remote_path)
    }
}
