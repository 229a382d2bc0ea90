//! Multi-host cache coordinator.
//!
//! Sits between a UI and the [`MirrorEngine`]: resolves the host list, keeps a
//! read-through cache of mirror outcomes, suppresses duplicate refreshes, and
//! tracks per-host sync status.
//!
//! # Concurrency
//!
//! All mutable state lives behind one `parking_lot::Mutex`. The lock is only
//! held for map reads and writes; it is never held across an `.await` or while
//! a subprocess or the filesystem is being touched. Engine and indexer work
//! runs on tokio's blocking pool, one host at a time.
//!
//! There is no timeout on remote commands. A hung `ssh` holds its refresh (and
//! the debounce key for it) until the process exits.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::config::{DEFAULT_DEBOUNCE, HostResolver, MirrorConfig, TomlHostResolver};
use crate::connectors::{claude_code, codex};
use crate::connectors::{JsonlSessionIndexer, SessionIndexer, SessionSummary};
use crate::sources::exec::CommandRunner;
use crate::sources::host::{Host, LoadScope, SessionKind};
use crate::sources::provenance::MirrorOutcome;
use crate::sources::status::{SyncState, SyncStates};
use crate::sources::sync::{MirrorEngine, SyncError};

/// Key of one cached mirror outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct MirrorKey {
    alias: String,
    kind: SessionKind,
    scope: LoadScope,
}

impl MirrorKey {
    fn new(alias: &str, kind: SessionKind, scope: LoadScope) -> Self {
        Self {
            alias: alias.to_string(),
            kind,
            scope,
        }
    }
}

/// Identity of a refresh request for debouncing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RefreshKey {
    kind: SessionKind,
    scope: LoadScope,
    /// Sorted aliases of the enabled hosts.
    aliases: Vec<String>,
}

impl RefreshKey {
    fn new(kind: SessionKind, scope: LoadScope, hosts: &[Host]) -> Self {
        Self {
            kind,
            scope,
            aliases: hosts.iter().map(|h| h.alias.clone()).sorted().collect(),
        }
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    /// `None` until the first successful load.
    cached_hosts: Option<Vec<Host>>,
    cached_config_mtime: Option<SystemTime>,
    /// Bumped on every host reload; outcomes from an older generation are
    /// never stored.
    generation: u64,
    mirror_store: HashMap<MirrorKey, MirrorOutcome>,
    in_flight: HashSet<RefreshKey>,
    last_completed: HashMap<RefreshKey, Instant>,
    sync_states: SyncStates,
}

/// Marks a refresh key in flight until dropped.
struct RefreshGuard<'a> {
    coordinator: &'a HostCacheCoordinator,
    key: RefreshKey,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.state.lock();
        state.in_flight.remove(&self.key);
        state.last_completed.insert(self.key.clone(), Instant::now());
    }
}

/// Owner of all per-host cache state. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct HostCacheCoordinator {
    engine: Arc<MirrorEngine>,
    resolver: Arc<dyn HostResolver>,
    indexer: Arc<dyn SessionIndexer>,
    debounce: Duration,
    state: Arc<Mutex<CoordinatorState>>,
}

impl HostCacheCoordinator {
    pub fn new(
        engine: MirrorEngine,
        resolver: Arc<dyn HostResolver>,
        indexer: Arc<dyn SessionIndexer>,
    ) -> Self {
        Self {
            engine: Arc::new(engine),
            resolver,
            indexer,
            debounce: DEFAULT_DEBOUNCE,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
        }
    }

    /// Coordinator with the built-in TOML resolver and JSONL indexer.
    pub fn from_config(config: &MirrorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let engine = MirrorEngine::new(&config.cache_dir, runner).with_tools(config.tools.clone());
        Self::new(
            engine,
            Arc::new(TomlHostResolver::new(&config.hosts_file)),
            Arc::new(JsonlSessionIndexer::new()),
        )
        .with_debounce(config.debounce)
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn engine(&self) -> &MirrorEngine {
        &self.engine
    }

    /// Every configured host, reloading the config file if its mtime changed.
    pub async fn hosts(&self) -> Vec<Host> {
        self.run_blocking("hosts", |this| this.resolve_hosts())
            .await
            .unwrap_or_default()
    }

    /// Codex sessions from every enabled host, annotated with provenance.
    ///
    /// Returns an empty list when an identical request is in flight or
    /// finished within the debounce window. Hosts that fail are skipped.
    pub async fn codex_sessions(&self, scope: LoadScope) -> Vec<SessionSummary> {
        self.run_blocking("codex_sessions", move |this| {
            this.aggregate(SessionKind::Codex, scope)
        })
        .await
        .unwrap_or_default()
    }

    /// Claude sessions from every enabled host. Same rules as
    /// [`Self::codex_sessions`].
    pub async fn claude_sessions(&self, scope: LoadScope) -> Vec<SessionSummary> {
        self.run_blocking("claude_sessions", move |this| {
            this.aggregate(SessionKind::Claude, scope)
        })
        .await
        .unwrap_or_default()
    }

    /// Mirror both session kinds for each enabled host in `hosts`, one host at
    /// a time, recording progress in the per-host sync state.
    ///
    /// With `force` the mirror store is bypassed and every host is listed
    /// again. Returns the state snapshot after the last host finished.
    pub async fn sync_hosts(&self, hosts: &[Host], force: bool) -> SyncStates {
        for host in hosts.iter().filter(|h| h.enabled) {
            self.set_sync_state(&host.alias, SyncState::Syncing);
            tracing::info!(host = %host.alias, force, "sync started");

            let owned = host.clone();
            let result = self
                .run_blocking("sync_host", move |this| this.refresh_host(&owned, force))
                .await
                .unwrap_or_else(|| Err(SyncError::Interrupted(format!("sync of {}", host.alias))));

            let next = match result {
                Ok(()) => SyncState::Succeeded { at: Utc::now() },
                Err(e) => {
                    let message = e.status_message();
                    tracing::warn!(host = %host.alias, error = %message, "sync failed");
                    SyncState::Failed {
                        at: Utc::now(),
                        message,
                    }
                }
            };
            self.set_sync_state(&host.alias, next);
        }
        self.sync_states()
    }

    /// Resolve the enabled hosts and sync them all.
    pub async fn sync_enabled(&self, force: bool) -> SyncStates {
        let hosts = self.hosts().await;
        self.sync_hosts(&hosts, force).await
    }

    /// Snapshot of per-host sync state.
    pub fn sync_states(&self) -> SyncStates {
        self.state.lock().sync_states.clone()
    }

    /// Sessions per working directory across every enabled host's cache.
    ///
    /// Reads only what is already mirrored; never contacts a host.
    pub async fn collect_cwd_aggregates(&self, kind: SessionKind) -> BTreeMap<String, usize> {
        self.run_blocking("collect_cwd_aggregates", move |this| {
            let mut totals = BTreeMap::new();
            for host in this.enabled_hosts() {
                let root = this.engine.mirror_root(&host.alias, kind);
                if !root.exists() {
                    continue;
                }
                for (cwd, n) in this.indexer.cwd_counts(&root, kind) {
                    *totals.entry(cwd).or_insert(0) += n;
                }
            }
            totals
        })
        .await
        .unwrap_or_default()
    }

    /// Total sessions across every enabled host's cache. Never contacts a host.
    pub async fn count_sessions(&self, kind: SessionKind) -> usize {
        self.run_blocking("count_sessions", move |this| {
            this.enabled_hosts()
                .iter()
                .map(|host| this.count_cached(&this.engine.mirror_root(&host.alias, kind), kind))
                .sum()
        })
        .await
        .unwrap_or_default()
    }

    /// The stored outcome for exactly `(alias, kind, scope)`, if any.
    ///
    /// No fallback between scopes: an outcome stored under `Today` is not
    /// returned for `All` and vice versa.
    pub fn cached_outcome(
        &self,
        alias: &str,
        kind: SessionKind,
        scope: LoadScope,
    ) -> Option<MirrorOutcome> {
        self.state
            .lock()
            .mirror_store
            .get(&MirrorKey::new(alias, kind, scope))
            .cloned()
    }

    async fn run_blocking<T, F>(&self, op: &'static str, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(Self) -> T + Send + 'static,
    {
        let this = self.clone();
        match tokio::task::spawn_blocking(move || f(this)).await {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(op, error = %e, "coordinator task did not complete");
                None
            }
        }
    }

    fn resolve_hosts(&self) -> Vec<Host> {
        self.resolve_hosts_at().0
    }

    /// Current hosts together with the store generation they belong to.
    fn resolve_hosts_at(&self) -> (Vec<Host>, u64) {
        let config_path = self.resolver.config_path();
        let mtime = config_mtime(&config_path);
        {
            let state = self.state.lock();
            if let Some(hosts) = &state.cached_hosts
                && !hosts.is_empty()
                && state.cached_config_mtime == mtime
            {
                return (hosts.clone(), state.generation);
            }
        }

        match self.resolver.hosts() {
            Ok(hosts) => {
                let mut state = self.state.lock();
                tracing::debug!(
                    path = %config_path.display(),
                    hosts = hosts.len(),
                    dropped_outcomes = state.mirror_store.len(),
                    "host config reloaded"
                );
                state.cached_hosts = Some(hosts.clone());
                state.cached_config_mtime = mtime;
                state.mirror_store.clear();
                state.generation += 1;
                (hosts, state.generation)
            }
            Err(e) => {
                tracing::warn!(path = %config_path.display(), error = %e, "could not load hosts");
                let mut state = self.state.lock();
                state.cached_hosts = None;
                state.cached_config_mtime = None;
                (Vec::new(), state.generation)
            }
        }
    }

    fn enabled_hosts(&self) -> Vec<Host> {
        self.resolve_hosts().into_iter().filter(|h| h.enabled).collect()
    }

    fn try_begin(&self, key: RefreshKey) -> Option<RefreshGuard<'_>> {
        let debounce = self.debounce;
        let mut state = self.state.lock();
        state.last_completed.retain(|_, done| done.elapsed() < debounce);
        if state.in_flight.contains(&key) {
            return None;
        }
        if let Some(done) = state.last_completed.get(&key)
            && done.elapsed() < self.debounce
        {
            return None;
        }
        state.in_flight.insert(key.clone());
        Some(RefreshGuard {
            coordinator: self,
            key,
        })
    }

    fn aggregate(&self, kind: SessionKind, scope: LoadScope) -> Vec<SessionSummary> {
        let (hosts, generation) = self.resolve_hosts_at();
        let hosts: Vec<Host> = hosts.into_iter().filter(|h| h.enabled).collect();
        let key = RefreshKey::new(kind, scope, &hosts);
        let Some(_guard) = self.try_begin(key) else {
            tracing::debug!(kind = %kind, scope = %scope, "refresh debounced");
            return Vec::new();
        };

        let mut sessions = Vec::new();
        for host in &hosts {
            match self.mirror_read_through(host, kind, scope, generation) {
                Ok(outcome) => sessions.extend(self.annotated(&outcome)),
                Err(e) => {
                    tracing::warn!(
                        host = %host.alias,
                        kind = %kind,
                        error = %e.status_message(),
                        "host skipped"
                    );
                }
            }
        }
        sessions
    }

    fn mirror_read_through(
        &self,
        host: &Host,
        kind: SessionKind,
        scope: LoadScope,
        generation: u64,
    ) -> Result<MirrorOutcome, SyncError> {
        let key = MirrorKey::new(&host.alias, kind, scope);
        {
            let state = self.state.lock();
            if state.generation == generation
                && let Some(outcome) = state.mirror_store.get(&key)
            {
                return Ok(outcome.clone());
            }
        }
        self.mirror_and_store(host, kind, scope, generation)
    }

    fn mirror_and_store(
        &self,
        host: &Host,
        kind: SessionKind,
        scope: LoadScope,
        generation: u64,
    ) -> Result<MirrorOutcome, SyncError> {
        let outcome = self.engine.ensure_mirror(host, kind, scope)?;
        let mut state = self.state.lock();
        if state.generation == generation {
            state
                .mirror_store
                .insert(MirrorKey::new(&host.alias, kind, scope), outcome.clone());
        } else {
            tracing::debug!(
                host = %host.alias,
                kind = %kind,
                "host config reloaded during mirror; outcome not stored"
            );
        }
        Ok(outcome)
    }

    /// Mirror every kind for one host. All kinds are attempted; the first
    /// failure is returned.
    fn refresh_host(&self, host: &Host, force: bool) -> Result<(), SyncError> {
        let (_, generation) = self.resolve_hosts_at();
        let mut first_err = None;
        for kind in SessionKind::ALL {
            let result = if force {
                self.mirror_and_store(host, kind, LoadScope::All, generation)
            } else {
                self.mirror_read_through(host, kind, LoadScope::All, generation)
            };
            if let Err(e) = result {
                tracing::debug!(host = %host.alias, kind = %kind, error = %e, "kind failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Parse exactly the files the outcome vouches for, so a scoped refresh
    /// never reads the rest of the host's cache.
    fn annotated(&self, outcome: &MirrorOutcome) -> Vec<SessionSummary> {
        let paths = outcome.files.keys().sorted();
        let summaries: Vec<SessionSummary> = match outcome.kind {
            SessionKind::Codex => paths
                .filter(|path| codex::is_rollout_file(path))
                .filter_map(|path| self.indexer.codex_session(path))
                .collect(),
            SessionKind::Claude => paths
                .filter(|path| claude_code::is_countable_session(path))
                .filter_map(|path| self.indexer.claude_session(path))
                .collect(),
        };
        summaries
            .into_iter()
            .filter_map(|summary| {
                let origin = outcome.origin_for(&summary.source_path)?;
                Some(summary.with_origin(origin))
            })
            .collect()
    }

    fn count_cached(&self, root: &Path, kind: SessionKind) -> usize {
        if !root.exists() {
            return 0;
        }
        match kind {
            SessionKind::Codex => self.indexer.count_sessions(root, kind),
            SessionKind::Claude => claude_code::count_sessions(root),
        }
    }

    fn set_sync_state(&self, alias: &str, next: SyncState) {
        self.state.lock().sync_states.insert(alias.to_string(), next);
    }
}

fn config_mtime(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}
