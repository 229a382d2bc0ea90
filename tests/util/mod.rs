use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant, UNIX_EPOCH};

use session_mirror::config::HostsFile;
use session_mirror::sources::sync::set_local_mtime;
use session_mirror::sources::{CommandError, CommandOutput, CommandRunner, Host, SessionKind};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}

/// A fixed point in time for remote files: 2024-05-01T08:00:00Z.
#[allow(dead_code)]
pub const T0: f64 = 1_714_550_400.0;

#[derive(Debug, Clone)]
struct Failure {
    exit_code: i32,
    stderr: String,
}

#[derive(Default)]
struct Gate {
    held: Mutex<bool>,
    cv: Condvar,
}

/// A `CommandRunner` that plays every remote host using one temp directory as
/// the remote `$HOME`.
///
/// It understands exactly the command shapes the engine issues: the `ssh`
/// listing script, `rsync --files-from` and single-file `scp`.
#[allow(dead_code)]
pub struct FakeRemote {
    home: TempDir,
    failures: Mutex<HashMap<String, Failure>>,
    host_failures: Mutex<HashMap<String, Failure>>,
    scp_budget: Mutex<Option<usize>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
    downloaded: Mutex<Vec<String>>,
    listings_started: AtomicUsize,
    gate: Gate,
}

#[allow(dead_code)]
impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            home: TempDir::new().expect("remote home"),
            failures: Mutex::new(HashMap::new()),
            host_failures: Mutex::new(HashMap::new()),
            scp_budget: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
            downloaded: Mutex::new(Vec::new()),
            listings_started: AtomicUsize::new(0),
            gate: Gate::default(),
        })
    }

    pub fn home(&self) -> &Path {
        self.home.path()
    }

    /// Remote directory for `kind`, e.g. `$HOME/.codex/sessions`.
    pub fn base(&self, kind: SessionKind) -> PathBuf {
        let rest = kind.remote_base().trim_start_matches("~/");
        self.home.path().join(rest)
    }

    /// Write a remote session file with the given size and mtime.
    pub fn put(&self, kind: SessionKind, rel: &str, size: usize, mtime: f64) -> PathBuf {
        self.put_bytes(kind, rel, &vec![b'x'; size], mtime)
    }

    pub fn put_bytes(&self, kind: SessionKind, rel: &str, body: &[u8], mtime: f64) -> PathBuf {
        let path = self.base(kind).join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, body).unwrap();
        set_local_mtime(&path, mtime).unwrap();
        path
    }

    pub fn remove(&self, kind: SessionKind, rel: &str) {
        fs::remove_file(self.base(kind).join(rel)).unwrap();
    }

    /// Every call to `program` fails with this exit code until cleared.
    pub fn fail(&self, program: &str, exit_code: i32, stderr: &str) {
        self.failures.lock().unwrap().insert(
            program.to_string(),
            Failure {
                exit_code,
                stderr: stderr.to_string(),
            },
        );
    }

    /// Every call addressed to `host` fails, whatever the tool.
    pub fn fail_host(&self, host: &str, exit_code: i32, stderr: &str) {
        self.host_failures.lock().unwrap().insert(
            host.to_string(),
            Failure {
                exit_code,
                stderr: stderr.to_string(),
            },
        );
    }

    /// Let `n` more scp copies succeed, then fail the rest.
    pub fn limit_scp(&self, n: usize) {
        *self.scp_budget.lock().unwrap() = Some(n);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
        self.host_failures.lock().unwrap().clear();
        *self.scp_budget.lock().unwrap() = None;
    }

    /// Block every listing until [`Self::release`].
    pub fn hold(&self) {
        *self.gate.held.lock().unwrap() = true;
    }

    pub fn release(&self) {
        *self.gate.held.lock().unwrap() = false;
        self.gate.cv.notify_all();
    }

    pub fn listings_started(&self) -> usize {
        self.listings_started.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` listings have started.
    pub async fn wait_for_listings(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.listings_started() < n {
            assert!(Instant::now() < deadline, "listing never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Relative paths transferred so far, in order.
    pub fn downloaded(&self) -> Vec<String> {
        self.downloaded.lock().unwrap().clone()
    }

    pub fn download_count(&self) -> usize {
        self.downloaded.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|(p, _)| p == program)
            .map(|(_, args)| args)
            .collect()
    }

    fn injected(&self, program: &str, args: &[String]) -> Option<CommandError> {
        let failure = self.failures.lock().unwrap().get(program).cloned().or_else(|| {
            let hosts = self.host_failures.lock().unwrap();
            hosts
                .iter()
                .find(|(host, _)| args.iter().any(|a| addresses(a, host)))
                .map(|(_, f)| f.clone())
        })?;
        Some(CommandError::Failed {
            executable: program.to_string(),
            args: args.to_vec(),
            stderr: failure.stderr,
            exit_code: failure.exit_code,
        })
    }

    fn wait_gate(&self) {
        let mut held = self.gate.held.lock().unwrap();
        while *held {
            held = self.gate.cv.wait(held).unwrap();
        }
    }

    fn ssh(&self, args: &[String]) -> Result<CommandOutput, String> {
        self.listings_started.fetch_add(1, Ordering::SeqCst);
        self.wait_gate();

        let command = args.last().ok_or("no remote command")?;
        let words = shell_words::split(command).map_err(|e| e.to_string())?;
        let script = match words.as_slice() {
            [sh, flag, script] if sh == "/bin/sh" && flag == "-c" => script,
            _ => return Err(format!("unexpected remote command: {command}")),
        };

        let base_rel = between(script, "\"$HOME\"/", " ]").ok_or("no base dir")?;
        let base_rel = shell_words::split(base_rel)
            .map_err(|e| e.to_string())?
            .join("");
        let base = self.home.path().join(base_rel);
        if !base.is_dir() {
            return Ok(CommandOutput::default());
        }

        let mut lines = String::new();
        match between(script, "for d in ", "; do") {
            None => {
                for (rel, size, mtime) in list_tree(&base, &base) {
                    lines.push_str(&format!("./{rel}|{size}|{mtime:.10}\n"));
                }
            }
            Some(dirs) => {
                for dir in shell_words::split(dirs).map_err(|e| e.to_string())? {
                    let scoped = base.join(&dir);
                    if scoped.is_dir() {
                        for (rel, size, mtime) in list_tree(&base, &scoped) {
                            lines.push_str(&format!("{rel}|{size}|{mtime:.10}\n"));
                        }
                    }
                }
            }
        }
        Ok(CommandOutput {
            exit_code: 0,
            stdout: lines,
            stderr: String::new(),
        })
    }

    fn rsync(&self, args: &[String]) -> Result<CommandOutput, String> {
        let manifest = args
            .iter()
            .find_map(|a| a.strip_prefix("--files-from="))
            .ok_or("no --files-from")?;
        let [.., source, dest] = args else {
            return Err("missing source/destination".into());
        };
        let src_root = self.remote_path(source)?;
        let dest_root = PathBuf::from(dest);

        let list = fs::read_to_string(manifest).map_err(|e| e.to_string())?;
        for rel in list.lines().filter(|l| !l.is_empty()) {
            let to = dest_root.join(rel);
            fs::create_dir_all(to.parent().unwrap()).map_err(|e| e.to_string())?;
            fs::copy(src_root.join(rel), &to).map_err(|e| format!("{rel}: {e}"))?;
            self.downloaded.lock().unwrap().push(rel.to_string());
        }
        Ok(CommandOutput::default())
    }

    fn scp(&self, args: &[String]) -> Result<CommandOutput, String> {
        {
            let mut budget = self.scp_budget.lock().unwrap();
            if let Some(left) = budget.as_mut() {
                if *left == 0 {
                    return Err("scp: Connection reset by peer".into());
                }
                *left -= 1;
            }
        }
        let [.., target, local] = args else {
            return Err("missing target/local".into());
        };
        let from = self.remote_path(target)?;
        fs::copy(&from, local).map_err(|e| format!("{}: {e}", from.display()))?;
        let rel = SessionKind::ALL
            .iter()
            .find_map(|kind| from.strip_prefix(self.base(*kind)).ok())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.downloaded.lock().unwrap().push(rel);
        Ok(CommandOutput::default())
    }

    /// `user@host:~/x/y` to a path under the fake home.
    fn remote_path(&self, spec: &str) -> Result<PathBuf, String> {
        let (_, path) = spec.split_once(':').ok_or_else(|| format!("not remote: {spec}"))?;
        let rest = path.strip_prefix("~/").ok_or_else(|| format!("not home-relative: {path}"))?;
        Ok(self.home.path().join(rest.trim_end_matches('/')))
    }
}

impl CommandRunner for FakeRemote {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, CommandError> {
        self.calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));

        if let Some(err) = self.injected(program, args) {
            if program == "ssh" {
                self.listings_started.fetch_add(1, Ordering::SeqCst);
            }
            return Err(err);
        }

        let result = match program {
            "ssh" => self.ssh(args),
            "rsync" => self.rsync(args),
            "scp" => self.scp(args),
            other => Err(format!("{other}: command not found")),
        };
        result.map_err(|stderr| CommandError::Failed {
            executable: program.to_string(),
            args: args.to_vec(),
            stderr,
            exit_code: 1,
        })
    }
}

/// True if `arg` names `host` as an ssh destination or a remote spec.
fn addresses(arg: &str, host: &str) -> bool {
    arg == host || arg.starts_with(&format!("{host}:")) || arg.contains(&format!("@{host}:"))
}

fn between<'a>(s: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = s.find(start)? + start.len();
    let len = s[from..].find(end)?;
    Some(&s[from..from + len])
}

/// `(path relative to base, size, mtime)` for every `.jsonl` under `dir`.
fn list_tree(base: &Path, dir: &Path) -> Vec<(String, u64, f64)> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("jsonl"))
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            let mtime = meta
                .modified()
                .ok()?
                .duration_since(UNIX_EPOCH)
                .ok()?
                .as_secs_f64();
            let rel = e.path().strip_prefix(base).ok()?.to_string_lossy().into_owned();
            Some((rel, meta.len(), mtime))
        })
        .collect()
}

/// Local mtime of a file in seconds.
#[allow(dead_code)]
pub fn mtime_secs(path: &Path) -> f64 {
    fs::metadata(path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

/// Write a hosts file for `hosts`.
#[allow(dead_code)]
pub fn write_hosts(path: &Path, hosts: &[Host]) {
    let file = HostsFile {
        hosts: hosts.to_vec(),
    };
    fs::write(path, file.to_toml().unwrap()).unwrap();
}

/// A minimal Codex rollout with one user turn.
#[allow(dead_code)]
pub fn codex_rollout(id: &str, cwd: &str, prompt: &str) -> String {
    format!(
        concat!(
            r#"{{"type":"session_meta","timestamp":"2024-05-01T08:00:00Z","payload":{{"id":"{id}","cwd":"{cwd}"}}}}"#,
            "\n",
            r#"{{"type":"response_item","timestamp":"2024-05-01T08:00:01Z","payload":{{"role":"user","content":[{{"type":"input_text","text":"{prompt}"}}]}}}}"#,
            "\n"
        ),
        id = id,
        cwd = cwd,
        prompt = prompt
    )
}

/// A minimal Claude Code session with one user turn.
#[allow(dead_code)]
pub fn claude_session(id: &str, cwd: &str, prompt: &str) -> String {
    format!(
        r#"{{"type":"user","cwd":"{cwd}","sessionId":"{id}","timestamp":"2024-05-01T08:00:00Z","message":{{"role":"user","content":"{prompt}"}}}}
"#
    )
}
