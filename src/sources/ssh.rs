//! Connection option builders for the three transports.
//!
//! `ssh` (used for listing and as rsync's remote shell) and `scp` share most of
//! their options but disagree on two: the port flag (`-p` vs `-P`) and how the
//! user is passed (`-l user` vs `user@host:` in the target). The builders below
//! are kept separate so a change to one cannot silently break the other.

use std::borrow::Cow;

use super::host::Host;

/// Options every connection carries regardless of host.
///
/// No multiplexing: each call opens its own connection so a stale control
/// socket cannot wedge a refresh. New host keys are accepted, changed ones are
/// rejected without prompting.
pub const SSH_BASELINE_OPTIONS: &[(&str, &str)] = &[
    ("BatchMode", "yes"),
    ("ControlMaster", "no"),
    ("ControlPath", "none"),
    ("StrictHostKeyChecking", "accept-new"),
    ("ServerAliveInterval", "15"),
    ("ServerAliveCountMax", "3"),
];

fn baseline() -> Vec<String> {
    let mut args = Vec::with_capacity(SSH_BASELINE_OPTIONS.len() * 2);
    for (key, value) in SSH_BASELINE_OPTIONS {
        args.push("-o".to_string());
        args.push(format!("{key}={value}"));
    }
    args
}

/// Options for `ssh` and for rsync's `-e` remote shell.
///
/// The user goes in as `-l`, the port as lowercase `-p`.
pub fn ssh_options(host: &Host) -> Vec<String> {
    let mut args = baseline();
    if let Some(user) = host.user.as_deref().filter(|u| !u.is_empty()) {
        args.push("-l".into());
        args.push(user.to_string());
    }
    if let Some(port) = host.port {
        args.push("-p".into());
        args.push(port.to_string());
    }
    if let Some(identity) = &host.identity_file {
        args.push("-i".into());
        args.push(expand_local_tilde(&identity.to_string_lossy()).into_owned());
    }
    if let Some(jump) = host.proxy_jump.as_deref().filter(|j| !j.is_empty()) {
        args.push("-J".into());
        args.push(jump.to_string());
    }
    if let Some(proxy) = host.proxy_command.as_deref().filter(|p| !p.is_empty()) {
        args.push("-o".into());
        args.push(format!("ProxyCommand={proxy}"));
    }
    if host.forward_agent {
        args.push("-A".into());
    }
    args
}

/// Options for `scp`.
///
/// The port is uppercase `-P`; the user is not passed here at all, it is
/// embedded in the target by [`scp_target`].
pub fn scp_options(host: &Host) -> Vec<String> {
    let mut args = baseline();
    if let Some(port) = host.port {
        args.push("-P".into());
        args.push(port.to_string());
    }
    if let Some(identity) = &host.identity_file {
        args.push("-i".into());
        args.push(expand_local_tilde(&identity.to_string_lossy()).into_owned());
    }
    if let Some(jump) = host.proxy_jump.as_deref().filter(|j| !j.is_empty()) {
        args.push("-J".into());
        args.push(jump.to_string());
    }
    if let Some(proxy) = host.proxy_command.as_deref().filter(|p| !p.is_empty()) {
        args.push("-o".into());
        args.push(format!("ProxyCommand={proxy}"));
    }
    if host.forward_agent {
        args.push("-o".into());
        args.push("ForwardAgent=yes".into());
    }
    args
}

/// `user@host:path` as scp expects it.
pub fn scp_target(host: &Host, remote_path: &str) -> String {
    format!("{}:{}", host.user_at_host(), remote_path)
}

/// Full `ssh …` command line for rsync's `-e`, quoted for rsync's own splitting.
pub fn rsync_remote_shell(ssh_bin: &str, host: &Host) -> String {
    let mut words = vec![ssh_bin.to_string()];
    words.extend(ssh_options(host));
    shell_words::join(words)
}

/// Normalize a remote base directory to a home-relative form.
///
/// `~` becomes `~/`, `~user`-less relative paths get a `~/` prefix, absolute
/// paths are left alone.
pub fn home_relative(path: &str) -> String {
    if path.starts_with("~/") || path.starts_with('/') {
        path.to_string()
    } else if path == "~" {
        "~/".to_string()
    } else if let Some(rest) = path.strip_prefix('~') {
        format!("~/{rest}")
    } else {
        format!("~/{path}")
    }
}

/// Expand a leading `~/` in a local path (identity files come from config).
fn expand_local_tilde(path: &str) -> Cow<'_, str> {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => Cow::Owned(home.join(rest).to_string_lossy().into_owned()),
        _ => Cow::Borrowed(path),
    }
}
