//! Host, session-kind and load-scope types.
//!
//! These are the identity types every other part of the mirror works with:
//! the lister turns a [`SessionKind`] and a [`LoadScope`] into a remote `find`,
//! the sync engine lays out its cache by `(Host::alias, SessionKind)`, and the
//! coordinator keys its caches on all three.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};

/// A remote machine reachable over SSH.
///
/// `alias` is the identity key: it names the cache directory, keys the
/// per-host sync state and is what provenance records carry. `hostname` is what
/// actually gets dialed; when empty the alias is used (so an alias from
/// `~/.ssh/config` works as-is).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    pub alias: String,
    #[serde(default)]
    pub hostname: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    pub proxy_jump: Option<String>,
    pub proxy_command: Option<String>,
    #[serde(default)]
    pub forward_agent: bool,
    /// Disabled hosts stay in the config but are skipped by aggregation and sync.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Host {
    /// Create an enabled host that dials its own alias.
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            hostname: String::new(),
            user: None,
            port: None,
            identity_file: None,
            proxy_jump: None,
            proxy_command: None,
            forward_agent: false,
            enabled: true,
        }
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    pub fn with_proxy_jump(mut self, jump: impl Into<String>) -> Self {
        self.proxy_jump = Some(jump.into());
        self
    }

    pub fn with_proxy_command(mut self, command: impl Into<String>) -> Self {
        self.proxy_command = Some(command.into());
        self
    }

    pub fn with_forward_agent(mut self, forward: bool) -> Self {
        self.forward_agent = forward;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// The name handed to `ssh`/`rsync`/`scp` as the destination host.
    pub fn connect_host(&self) -> &str {
        if self.hostname.trim().is_empty() {
            &self.alias
        } else {
            &self.hostname
        }
    }

    /// `user@host`, or just `host` when no user is configured.
    pub fn user_at_host(&self) -> String {
        match self.user.as_deref().filter(|u| !u.is_empty()) {
            Some(user) => format!("{}@{}", user, self.connect_host()),
            None => self.connect_host().to_string(),
        }
    }
}

/// The two providers of assistant sessions that get mirrored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Codex CLI rollouts, laid out `YYYY/MM/DD/rollout-*.jsonl`.
    Codex,
    /// Claude Code projects, laid out `<project-slug>/<session>.jsonl`.
    Claude,
}

impl SessionKind {
    pub const ALL: [SessionKind; 2] = [SessionKind::Codex, SessionKind::Claude];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }

    /// Remote base directory, relative to the remote home.
    pub fn remote_base(&self) -> &'static str {
        match self {
            Self::Codex => "~/.codex/sessions",
            Self::Claude => "~/.claude/projects",
        }
    }

    /// Name of the per-host cache subdirectory.
    pub fn cache_dir_name(&self) -> &'static str {
        self.as_str()
    }

    /// Relative subdirectories of [`Self::remote_base`] that `scope` covers.
    ///
    /// An empty result means "search the whole base". Claude projects have no
    /// date layout, so every scope maps to the whole base for them.
    pub fn scoped_dirs(&self, scope: LoadScope, today: NaiveDate) -> Vec<String> {
        match self {
            Self::Claude => Vec::new(),
            Self::Codex => match scope {
                LoadScope::All => Vec::new(),
                LoadScope::Today => vec![day_dir(today)],
                LoadScope::Day(date) => vec![day_dir(date)],
                LoadScope::Month(date) => vec![format!("{:04}/{:02}", date.year(), date.month())],
            },
        }
    }
}

fn day_dir(date: NaiveDate) -> String {
    format!("{:04}/{:02}/{:02}", date.year(), date.month(), date.day())
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which slice of the remote tree a refresh covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "scope", content = "date", rename_all = "snake_case")]
pub enum LoadScope {
    #[default]
    All,
    Today,
    Day(NaiveDate),
    /// Any date within the month; only year and month are used.
    Month(NaiveDate),
}

impl LoadScope {
    /// Resolve `Today` against the local clock.
    pub fn today() -> NaiveDate {
        Local::now().date_naive()
    }
}

impl fmt::Display for LoadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Today => write!(f, "today"),
            Self::Day(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Self::Month(date) => write!(f, "{}", date.format("%Y-%m")),
        }
    }
}

impl FromStr for LoadScope {
    type Err = String;

    /// Accepts `all`, `today`, `YYYY-MM-DD` and `YYYY-MM`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_lowercase().as_str() {
            "all" => return Ok(Self::All),
            "today" => return Ok(Self::Today),
            _ => {}
        }
        if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
            return Ok(Self::Day(date));
        }
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{s}-01"), "%Y-%m-%d") {
            return Ok(Self::Month(date));
        }
        Err(format!(
            "invalid scope `{s}` (expected all, today, YYYY-MM-DD or YYYY-MM)"
        ))
    }
}
