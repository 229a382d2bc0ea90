//! Remote file listing.
//!
//! A listing is one SSH round-trip that runs `find` under the session base
//! directory and prints `relativePath|sizeBytes|epochSeconds` per file. The
//! script is wrapped in `/bin/sh -c` so the remote login shell (fish, nu, ...)
//! never gets to interpret it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::exec::{CommandError, CommandRunner};
use super::host::{Host, LoadScope, SessionKind};
use super::ssh::ssh_options;

/// `find -printf` format producing one `path|size|mtime` line per file.
const FIND_PRINTF: &str = r"%p|%s|%T@\n";

/// Extension of mirrored session files.
pub const SESSION_EXTENSION: &str = "jsonl";

/// One file as reported by the remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Path relative to the kind's remote base, without a leading `./`.
    pub relative_path: String,
    /// Base directory joined with `relative_path` (home-relative, `~/...`).
    pub remote_path: String,
    pub size: u64,
    /// Seconds since the epoch, with the fractional part `find` reports.
    pub mtime: f64,
}

/// Shell form of a base directory: `~/x` becomes `"$HOME"/x`.
fn shell_dir(base: &str) -> String {
    match base.strip_prefix("~/") {
        Some(rest) => format!("\"$HOME\"/{}", shell_words::quote(rest)),
        None if base == "~" => "\"$HOME\"".to_string(),
        None => shell_words::quote(base).into_owned(),
    }
}

/// The POSIX `sh` script run on the remote.
///
/// A missing base directory lists nothing rather than failing: a host that never
/// ran a given agent simply has no sessions of that kind. Scoped listings only
/// pass existing subdirectories to `find`, so an empty day is not an error
/// either.
pub fn listing_script(kind: SessionKind, scope: LoadScope, today: NaiveDate) -> String {
    let base = shell_dir(kind.remote_base());
    let find_tail = format!(
        "-type f -name '*.{SESSION_EXTENSION}' -printf '{FIND_PRINTF}'"
    );
    let dirs = kind.scoped_dirs(scope, today);

    if dirs.is_empty() {
        return format!("[ -d {base} ] || exit 0; cd {base} && find . {find_tail}");
    }

    let quoted: Vec<String> = dirs
        .iter()
        .map(|d| shell_words::quote(d).into_owned())
        .collect();
    format!(
        "[ -d {base} ] || exit 0; cd {base} || exit 1; set --; \
         for d in {}; do [ -d \"$d\" ] && set -- \"$@\" \"$d\"; done; \
         [ \"$#\" -eq 0 ] || find \"$@\" {find_tail}",
        quoted.join(" ")
    )
}

/// The remote command string handed to `ssh`.
pub fn remote_listing_command(kind: SessionKind, scope: LoadScope, today: NaiveDate) -> String {
    format!(
        "/bin/sh -c {}",
        shell_words::quote(&listing_script(kind, scope, today))
    )
}

/// Parse listing output.
///
/// Lines with fewer than three `|`-separated fields are skipped. Numeric fields
/// that do not parse become zero instead of failing the listing; a zero size
/// or mtime never matches a real local file, so such entries are simply
/// re-fetched. Fields are split from the right so a `|` inside a path survives.
pub fn parse_listing(output: &str, remote_base: &str) -> Vec<RemoteEntry> {
    let base = remote_base.trim_end_matches('/');
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                return None;
            }
            let mut fields = line.rsplitn(3, '|');
            let mtime = fields.next()?;
            let size = fields.next()?;
            let path = fields.next()?;

            let relative = path.strip_prefix("./").unwrap_or(path);
            if relative.is_empty() {
                return None;
            }

            Some(RemoteEntry {
                relative_path: relative.to_string(),
                remote_path: format!("{base}/{relative}"),
                size: size.trim().parse().unwrap_or(0),
                mtime: mtime.trim().parse().unwrap_or(0.0),
            })
        })
        .collect()
}

/// Runs listings for one host at a time.
pub struct RemoteLister<'a> {
    runner: &'a dyn CommandRunner,
    ssh_bin: &'a str,
}

impl<'a> RemoteLister<'a> {
    pub fn new(runner: &'a dyn CommandRunner, ssh_bin: &'a str) -> Self {
        Self { runner, ssh_bin }
    }

    /// List session files of `kind` on `host` within `scope`.
    ///
    /// Any non-zero exit (including ssh's own 255 on connection failure) is an
    /// error for this attempt only.
    pub fn list(
        &self,
        host: &Host,
        kind: SessionKind,
        scope: LoadScope,
        today: NaiveDate,
    ) -> Result<Vec<RemoteEntry>, CommandError> {
        let mut args = ssh_options(host);
        args.push("--".into());
        args.push(host.connect_host().to_string());
        args.push(remote_listing_command(kind, scope, today));

        let output = self.runner.run(self.ssh_bin, &args)?;
        let entries = parse_listing(&output.stdout, kind.remote_base());

        tracing::debug!(
            host = %host.alias,
            kind = %kind,
            scope = %scope,
            files = entries.len(),
            "remote listing complete"
        );
        Ok(entries)
    }
}
