//! Mirror engine: pulls session files from one host into the local cache.
//!
//! One call lists the remote tree, diffs it against the cache by size and
//! mtime, and transfers only what is stale. The batch path is a single
//! `rsync --files-from` run; if that fails for any reason the still-pending
//! files are copied one at a time with `scp`.
//!
//! # Safety
//!
//! **IMPORTANT**: the engine never deletes. Files that vanished remotely stay in
//! the cache, and rsync runs without `--delete`, so a misconfigured or
//! temporarily empty remote cannot wipe local history.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use session_mirror::sources::{Host, LoadScope, MirrorEngine, SessionKind, SystemRunner};
//!
//! let engine = MirrorEngine::new(&cache_root, Arc::new(SystemRunner));
//! let outcome = engine.ensure_mirror(&Host::new("devbox"), SessionKind::Codex, LoadScope::Today)?;
//! println!("{} files current under {}", outcome.len(), outcome.local_root.display());
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use thiserror::Error;

use super::exec::{CommandError, CommandRunner};
use super::host::{Host, LoadScope, SessionKind};
use super::listing::{RemoteEntry, RemoteLister};
use super::provenance::{MirrorOutcome, RemoteFileRef};
use super::ssh::{home_relative, rsync_remote_shell, scp_options, scp_target};

/// Maximum mtime drift, in seconds, for a local copy to still count as fresh.
pub const MTIME_TOLERANCE_SECS: f64 = 0.5;

/// Errors that can occur while mirroring a host.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("remote listing failed: {0}")]
    Listing(#[source] CommandError),

    #[error("failed to copy {remote_path}: {source}")]
    Transfer {
        remote_path: String,
        #[source]
        source: CommandError,
    },

    #[error("local mirror I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("mirror task did not complete: {0}")]
    Interrupted(String),
}

impl SyncError {
    /// The underlying shell failure, when there is one.
    pub fn command_error(&self) -> Option<&CommandError> {
        match self {
            Self::Listing(e) | Self::Transfer { source: e, .. } => Some(e),
            Self::Io(_) | Self::Interrupted(_) => None,
        }
    }

    /// Message suitable for a status line: tool, stderr and exit code for shell
    /// failures, the plain error text otherwise.
    pub fn status_message(&self) -> String {
        match self.command_error() {
            Some(e) => e.describe(),
            None => self.to_string(),
        }
    }
}

/// Method used for transferring files from a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMethod {
    /// Single rsync run over SSH with a file manifest.
    Rsync,
    /// Per-file scp after rsync failed.
    Scp,
}

impl std::fmt::Display for SyncMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsync => write!(f, "rsync"),
            Self::Scp => write!(f, "scp"),
        }
    }
}

/// Executable names (or paths) for the external tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferTools {
    pub ssh: String,
    pub rsync: String,
    pub scp: String,
}

impl Default for TransferTools {
    fn default() -> Self {
        Self {
            ssh: "ssh".into(),
            rsync: "rsync".into(),
            scp: "scp".into(),
        }
    }
}

/// What one `ensure_mirror` call did.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TransferReport {
    pub host: String,
    pub kind: Option<SessionKind>,
    /// Method that delivered the files; `None` when nothing was stale.
    pub method: Option<SyncMethod>,
    pub files_listed: usize,
    pub files_downloaded: usize,
    pub bytes_downloaded: u64,
    pub duration_ms: u64,
}

/// Mirror engine for pulling session files from remote hosts.
pub struct MirrorEngine {
    /// Structure: `{cache_root}/{alias}/{kind}/...`
    cache_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
    tools: TransferTools,
}

impl MirrorEngine {
    /// Create a new engine writing under `cache_root`.
    pub fn new(cache_root: &Path, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            cache_root: cache_root.to_path_buf(),
            runner,
            tools: TransferTools::default(),
        }
    }

    /// Override the tool executables.
    pub fn with_tools(mut self, tools: TransferTools) -> Self {
        self.tools = tools;
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Local mirror directory for a `(host, kind)` pair.
    pub fn mirror_root(&self, alias: &str, kind: SessionKind) -> PathBuf {
        self.cache_root
            .join(safe_alias(alias))
            .join(kind.cache_dir_name())
    }

    /// Bring the local cache up to date for `(host, kind, scope)`.
    pub fn ensure_mirror(
        &self,
        host: &Host,
        kind: SessionKind,
        scope: LoadScope,
    ) -> Result<MirrorOutcome, SyncError> {
        self.ensure_mirror_on(host, kind, scope, LoadScope::today())
            .map(|(outcome, _)| outcome)
    }

    /// Like [`Self::ensure_mirror`], also returning what was transferred.
    pub fn ensure_mirror_with_report(
        &self,
        host: &Host,
        kind: SessionKind,
        scope: LoadScope,
    ) -> Result<(MirrorOutcome, TransferReport), SyncError> {
        self.ensure_mirror_on(host, kind, scope, LoadScope::today())
    }

    /// Mirror with an explicit "today" for scope resolution.
    pub fn ensure_mirror_on(
        &self,
        host: &Host,
        kind: SessionKind,
        scope: LoadScope,
        today: NaiveDate,
    ) -> Result<(MirrorOutcome, TransferReport), SyncError> {
        let start = Instant::now();
        let entries = RemoteLister::new(self.runner.as_ref(), &self.tools.ssh)
            .list(host, kind, scope, today)
            .map_err(SyncError::Listing)?;

        let root = self.mirror_root(&host.alias, kind);
        fs::create_dir_all(&root)?;

        let mut outcome = MirrorOutcome::new(&host.alias, kind, root.clone());
        let mut pending: Vec<&RemoteEntry> = Vec::new();

        for entry in &entries {
            if !stays_inside_root(&entry.relative_path) {
                tracing::warn!(
                    host = %host.alias,
                    path = %entry.relative_path,
                    "skipping path outside mirror root"
                );
                continue;
            }
            let local = root.join(&entry.relative_path);
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent)?;
            }
            if is_fresh(&local, entry) {
                outcome.files.insert(local, file_ref(entry));
            } else {
                tracing::debug!(host = %host.alias, path = %entry.relative_path, "stale, queued");
                pending.push(entry);
            }
        }

        let mut report = TransferReport {
            host: host.alias.clone(),
            kind: Some(kind),
            files_listed: entries.len(),
            ..Default::default()
        };

        if !pending.is_empty() {
            let method = match self.transfer_rsync(host, kind, &root, &pending) {
                Ok(()) => SyncMethod::Rsync,
                Err(e) => {
                    tracing::warn!(
                        host = %host.alias,
                        kind = %kind,
                        pending = pending.len(),
                        error = %e.describe(),
                        "rsync failed, falling back to per-file scp"
                    );
                    self.transfer_scp(host, &root, &pending)?;
                    SyncMethod::Scp
                }
            };

            for entry in &pending {
                let local = root.join(&entry.relative_path);
                if method == SyncMethod::Rsync {
                    set_local_mtime(&local, entry.mtime)?;
                }
                outcome.files.insert(local, file_ref(entry));
            }
            report.method = Some(method);
            report.files_downloaded = pending.len();
            report.bytes_downloaded = pending.iter().map(|e| e.size).sum();
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        tracing::info!(
            host = %host.alias,
            kind = %kind,
            scope = %scope,
            listed = report.files_listed,
            downloaded = report.files_downloaded,
            bytes = report.bytes_downloaded,
            method = ?report.method,
            duration_ms = report.duration_ms,
            "mirror complete"
        );

        Ok((outcome, report))
    }

    /// Batch transfer of every pending file in one rsync run.
    ///
    /// **IMPORTANT**: no `--delete`. Safe additive sync only.
    fn transfer_rsync(
        &self,
        host: &Host,
        kind: SessionKind,
        root: &Path,
        pending: &[&RemoteEntry],
    ) -> Result<(), CommandError> {
        let manifest = write_manifest(pending).map_err(|e| CommandError::Spawn {
            executable: self.tools.rsync.clone(),
            message: format!("could not write file manifest: {e}"),
        })?;

        let source = format!(
            "{}:{}/",
            host.user_at_host(),
            home_relative(kind.remote_base()).trim_end_matches('/')
        );
        let args = vec![
            "-e".to_string(),
            rsync_remote_shell(&self.tools.ssh, host),
            "-az".to_string(),
            "--prune-empty-dirs".to_string(),
            format!("--files-from={}", manifest.path().display()),
            source,
            format!("{}/", root.display()),
        ];

        tracing::debug!(host = %host.alias, files = pending.len(), "starting rsync");
        self.runner.run(&self.tools.rsync, &args)?;
        Ok(())
    }

    /// Per-file fallback. The first failure aborts the rest; whatever did not
    /// arrive is picked up by the freshness check on the next call.
    fn transfer_scp(
        &self,
        host: &Host,
        root: &Path,
        pending: &[&RemoteEntry],
    ) -> Result<(), SyncError> {
        for entry in pending {
            let local = root.join(&entry.relative_path);
            let mut args = scp_options(host);
            args.push("-q".into());
            args.push("-p".into());
            args.push(scp_target(host, &entry.remote_path));
            args.push(local.to_string_lossy().into_owned());

            self.runner
                .run(&self.tools.scp, &args)
                .map_err(|source| SyncError::Transfer {
                    remote_path: entry.remote_path.clone(),
                    source,
                })?;
            set_local_mtime(&local, entry.mtime)?;
        }
        Ok(())
    }
}

/// Aliases become directory names; keep them to one path component.
fn safe_alias(alias: &str) -> String {
    let cleaned: String = alias
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

/// Only plain relative components: no `..`, no absolute prefix.
fn stays_inside_root(relative: &str) -> bool {
    let path = Path::new(relative);
    path.components().next().is_some()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_) | std::path::Component::CurDir))
}

fn file_ref(entry: &RemoteEntry) -> RemoteFileRef {
    RemoteFileRef {
        remote_path: entry.remote_path.clone(),
        remote_mtime: entry.mtime,
    }
}

/// Same size and mtime within [`MTIME_TOLERANCE_SECS`].
pub fn is_fresh(local: &Path, entry: &RemoteEntry) -> bool {
    let Ok(meta) = fs::metadata(local) else {
        return false;
    };
    if !meta.is_file() || meta.len() != entry.size {
        return false;
    }
    meta.modified()
        .ok()
        .and_then(system_time_to_secs)
        .is_some_and(|local_mtime| (local_mtime - entry.mtime).abs() <= MTIME_TOLERANCE_SECS)
}

fn system_time_to_secs(t: SystemTime) -> Option<f64> {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => Some(d.as_secs_f64()),
        Err(e) => Some(-e.duration().as_secs_f64()),
    }
}

fn secs_to_system_time(secs: f64) -> Option<SystemTime> {
    if !secs.is_finite() {
        return None;
    }
    if secs >= 0.0 {
        UNIX_EPOCH.checked_add(Duration::try_from_secs_f64(secs).ok()?)
    } else {
        UNIX_EPOCH.checked_sub(Duration::try_from_secs_f64(-secs).ok()?)
    }
}

/// Stamp the remote mtime onto a local copy so the next freshness check converges.
pub fn set_local_mtime(path: &Path, mtime: f64) -> std::io::Result<()> {
    let Some(time) = secs_to_system_time(mtime) else {
        return Ok(());
    };
    let file = fs::File::options().append(true).open(path)?;
    file.set_modified(time)
}

fn write_manifest(pending: &[&RemoteEntry]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut manifest = tempfile::Builder::new()
        .prefix("session-mirror-")
        .suffix(".files")
        .tempfile()?;
    for entry in pending {
        writeln!(manifest, "{}", entry.relative_path)?;
    }
    manifest.flush()?;
    Ok(manifest)
}
