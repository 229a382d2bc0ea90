pub mod config;
pub mod connectors;
pub mod coordinator;
pub mod sources;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use colored::Colorize;
use tracing_subscriber::EnvFilter;

use crate::config::MirrorConfig;
use crate::connectors::SessionSummary;
use crate::coordinator::HostCacheCoordinator;
use crate::sources::exec::SystemRunner;
use crate::sources::host::{Host, LoadScope, SessionKind};
use crate::sources::status::{SyncState, SyncStates};

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "session-mirror",
    version,
    about = "Mirror Codex and Claude Code session logs from remote hosts over SSH"
)]
pub struct Cli {
    /// Local mirror cache root (defaults to platform cache dir)
    #[arg(long, global = true)]
    pub cache_dir: Option<PathBuf>,

    /// Hosts file (defaults to platform config dir)
    #[arg(long, global = true)]
    pub hosts_file: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mirror and list sessions from every enabled host
    Sessions {
        #[arg(long, value_enum)]
        kind: SessionKind,

        /// all, today, YYYY-MM-DD or YYYY-MM
        #[arg(long, default_value = "all")]
        scope: LoadScope,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Mirror both session kinds for each host and report sync state
    Sync {
        /// Restrict to these host aliases (repeatable)
        #[arg(long = "host")]
        hosts: Vec<String>,

        /// Re-list every host even if already mirrored this run
        #[arg(long)]
        force: bool,

        #[arg(long)]
        json: bool,
    },
    /// Count sessions already in the local mirror
    Count {
        #[arg(long, value_enum)]
        kind: SessionKind,
    },
    /// Sessions per working directory, from the local mirror
    Cwds {
        #[arg(long, value_enum)]
        kind: SessionKind,

        #[arg(long)]
        json: bool,
    },
    /// Show configured hosts
    Hosts {
        #[arg(long)]
        json: bool,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = MirrorConfig::from_env();
    if let Some(dir) = cli.cache_dir {
        config = config.with_cache_dir(dir);
    }
    if let Some(path) = cli.hosts_file {
        config = config.with_hosts_file(path);
    }

    match cli.command {
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "session-mirror", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
        command => {
            let coordinator = HostCacheCoordinator::from_config(&config, Arc::new(SystemRunner));
            run_with(&coordinator, command).await
        }
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `-v`.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn run_with(coordinator: &HostCacheCoordinator, command: Commands) -> Result<()> {
    match command {
        Commands::Sessions { kind, scope, json } => {
            let sessions = match kind {
                SessionKind::Codex => coordinator.codex_sessions(scope).await,
                SessionKind::Claude => coordinator.claude_sessions(scope).await,
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                print_sessions(&sessions);
            }
            Ok(())
        }
        Commands::Sync { hosts, force, json } => {
            let targets = select_hosts(coordinator.hosts().await, &hosts)?;
            let states = coordinator.sync_hosts(&targets, force).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&states)?);
            } else {
                print_states(&states);
            }
            let failed = targets
                .iter()
                .filter(|h| states.get(&h.alias).is_some_and(SyncState::is_failed))
                .count();
            if failed > 0 {
                bail!("{failed} host(s) failed to sync");
            }
            Ok(())
        }
        Commands::Count { kind } => {
            println!("{}", coordinator.count_sessions(kind).await);
            Ok(())
        }
        Commands::Cwds { kind, json } => {
            let cwds = coordinator.collect_cwd_aggregates(kind).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&cwds)?);
            } else {
                print_cwds(&cwds);
            }
            Ok(())
        }
        Commands::Hosts { json } => {
            let hosts = coordinator.hosts().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&hosts)?);
            } else {
                print_hosts(&hosts);
            }
            Ok(())
        }
        Commands::Completions { .. } | Commands::Man => Ok(()),
    }
}

/// Enabled hosts, narrowed to `aliases` when any are given.
fn select_hosts(all: Vec<Host>, aliases: &[String]) -> Result<Vec<Host>> {
    let enabled: Vec<Host> = all.into_iter().filter(|h| h.enabled).collect();
    if aliases.is_empty() {
        return Ok(enabled);
    }
    let mut selected = Vec::with_capacity(aliases.len());
    for alias in aliases {
        let host = enabled
            .iter()
            .find(|h| &h.alias == alias)
            .with_context(|| format!("no enabled host named '{alias}'"))?;
        selected.push(host.clone());
    }
    Ok(selected)
}

fn print_sessions(sessions: &[SessionSummary]) {
    if sessions.is_empty() {
        println!("{}", "No sessions.".dimmed());
        return;
    }
    for s in sessions {
        let started = s
            .started_at
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".repeat(16));
        let cwd = s
            .cwd
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        println!(
            "{}  {}  {}  {}",
            s.host().unwrap_or("local").cyan(),
            started,
            s.title.as_deref().unwrap_or("(untitled)"),
            cwd.dimmed()
        );
    }
}

fn print_states(states: &SyncStates) {
    for (alias, state) in states {
        let line = match state {
            SyncState::Succeeded { .. } => format!("{} {}", "✓".green(), state),
            SyncState::Failed { .. } => format!("{} {}", "✗".red(), state.to_string().red()),
            SyncState::Syncing | SyncState::Idle => state.to_string(),
        };
        println!("{}: {}", alias.cyan(), line);
    }
}

fn print_cwds(cwds: &BTreeMap<String, usize>) {
    for (cwd, count) in cwds {
        println!("{count:>6}  {cwd}");
    }
}

fn print_hosts(hosts: &[Host]) {
    if hosts.is_empty() {
        println!("{}", "No hosts configured.".dimmed());
        return;
    }
    for host in hosts {
        let status = if host.enabled {
            "enabled".green()
        } else {
            "disabled".yellow()
        };
        println!("{}  {}  {}", host.alias.cyan(), host.user_at_host(), status);
    }
}
