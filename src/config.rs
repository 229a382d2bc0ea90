//! Runtime configuration and the host list.
//!
//! Settings come from defaults, then environment (a `.env` file is honored via
//! `dotenvy`), then explicit CLI overrides. The host list lives in a TOML file:
//!
//! ```toml
//! [[hosts]]
//! alias = "devbox"
//! hostname = "10.0.0.5"
//! user = "me"
//! port = 2222
//! identity_file = "~/.ssh/id_ed25519"
//!
//! [[hosts]]
//! alias = "build"
//! proxy_jump = "bastion"
//! enabled = false
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sources::host::Host;
use crate::sources::sync::TransferTools;

/// Debounce window for identical refresh requests.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read hosts file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse hosts file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to serialize hosts file: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("host alias '{0}' is defined more than once")]
    DuplicateAlias(String),

    #[error("host entry {index} has an empty alias")]
    EmptyAlias { index: usize },
}

/// Top-level settings for the mirror.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Root of the local mirror cache.
    pub cache_dir: PathBuf,
    /// TOML file listing remote hosts.
    pub hosts_file: PathBuf,
    pub debounce: Duration,
    pub tools: TransferTools,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            hosts_file: default_hosts_file(),
            debounce: DEFAULT_DEBOUNCE,
            tools: TransferTools::default(),
        }
    }
}

impl MirrorConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("SESSION_MIRROR_CACHE_DIR") {
            cfg.cache_dir = PathBuf::from(path);
        }

        if let Ok(path) = dotenvy::var("SESSION_MIRROR_HOSTS_FILE") {
            cfg.hosts_file = PathBuf::from(path);
        }

        if let Ok(val) = dotenvy::var("SESSION_MIRROR_DEBOUNCE_MS")
            && let Ok(ms) = val.parse()
        {
            cfg.debounce = Duration::from_millis(ms);
        }

        if let Ok(bin) = dotenvy::var("SESSION_MIRROR_SSH_BIN") {
            cfg.tools.ssh = bin;
        }
        if let Ok(bin) = dotenvy::var("SESSION_MIRROR_RSYNC_BIN") {
            cfg.tools.rsync = bin;
        }
        if let Ok(bin) = dotenvy::var("SESSION_MIRROR_SCP_BIN") {
            cfg.tools.scp = bin;
        }

        cfg
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn with_hosts_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.hosts_file = path.into();
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "session-mirror", "session-mirror")
}

/// Default mirror cache root.
pub fn default_cache_dir() -> PathBuf {
    project_dirs().map_or_else(
        || fallback_dir().join("mirrors"),
        |dirs| dirs.cache_dir().join("mirrors"),
    )
}

/// Default hosts file location.
pub fn default_hosts_file() -> PathBuf {
    project_dirs().map_or_else(
        || fallback_dir().join("hosts.toml"),
        |dirs| dirs.config_dir().join("hosts.toml"),
    )
}

fn fallback_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".session-mirror")
}

/// Source of the configured host list.
pub trait HostResolver: Send + Sync {
    /// Every configured host, enabled or not.
    fn hosts(&self) -> Result<Vec<Host>, ConfigError>;

    /// File whose mtime signals that [`Self::hosts`] may have changed.
    fn config_path(&self) -> PathBuf;
}

/// On-disk shape of the hosts file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostsFile {
    #[serde(default)]
    pub hosts: Vec<Host>,
}

impl HostsFile {
    pub fn parse(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        let file: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        file.validate()?;
        Ok(file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for (index, host) in self.hosts.iter().enumerate() {
            if host.alias.trim().is_empty() {
                return Err(ConfigError::EmptyAlias { index });
            }
            if !seen.insert(host.alias.as_str()) {
                return Err(ConfigError::DuplicateAlias(host.alias.clone()));
            }
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Reads hosts from a TOML file on every call.
#[derive(Debug, Clone)]
pub struct TomlHostResolver {
    path: PathBuf,
}

impl TomlHostResolver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl HostResolver for TomlHostResolver {
    fn hosts(&self) -> Result<Vec<Host>, ConfigError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "no hosts file");
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        Ok(HostsFile::parse(&self.path, &contents)?.hosts)
    }

    fn config_path(&self) -> PathBuf {
        self.path.clone()
    }
}
