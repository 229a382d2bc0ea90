//! Remote session mirroring.
//!
//! This module pulls agent session logs from remote machines over SSH into a
//! local cache so they can be indexed alongside local history.
//!
//! # Architecture
//!
//! - **host**: `Host`, `SessionKind` and `LoadScope`, the identity types
//! - **exec**: the `CommandRunner` seam every external tool goes through
//! - **ssh**: option builders for `ssh`/`rsync -e` and, separately, `scp`
//! - **listing**: remote `find` over SSH and its `path|size|mtime` parser
//! - **sync**: the mirror engine (freshness diff, rsync batch, scp fallback)
//! - **provenance**: per-file origin records returned with every mirror
//! - **status**: the per-host sync state machine
//!
//! # Cache layout
//!
//! ```text
//! <cache_root>/<host alias>/codex/2024/05/01/rollout-....jsonl
//! <cache_root>/<host alias>/claude/<project>/<session>.jsonl
//! ```
//!
//! # Syncing
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use session_mirror::sources::{Host, LoadScope, MirrorEngine, SessionKind, SystemRunner};
//!
//! let engine = MirrorEngine::new(&cache_root, Arc::new(SystemRunner));
//! let outcome = engine.ensure_mirror(&Host::new("devbox"), SessionKind::Claude, LoadScope::All)?;
//! for (local, origin) in &outcome.files {
//!     println!("{} <- {}", local.display(), origin.remote_path);
//! }
//! ```

pub mod exec;
pub mod host;
pub mod listing;
pub mod provenance;
pub mod ssh;
pub mod status;
pub mod sync;

pub use exec::{CommandError, CommandOutput, CommandRunner, SystemRunner};
pub use host::{Host, LoadScope, SessionKind};
pub use listing::{RemoteEntry, RemoteLister, parse_listing};
pub use provenance::{MirrorOutcome, Origin, RemoteFileRef};
pub use status::{SyncState, SyncStates};
pub use sync::{MirrorEngine, SyncError, SyncMethod, TransferReport, TransferTools};
