//! Tracking and forced termination of external tool processes.
//!
//! Every child is spawned into its own process group and registered with the
//! owning [`ProcessSupervisor`] until it has been reaped. [`TrackedChild`]
//! deregisters on drop, so early returns and panics cannot leave a stale
//! registry entry or an orphaned child behind.

use crate::cmd;
use crate::{EngineError, Result};
use std::collections::{HashMap, VecDeque};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::ops::ControlFlow;
use std::path::Path;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const STDERR_TAIL_LINES: usize = 12;
pub const MAX_LINE_BYTES: usize = 64 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(1);
const DEFAULT_CANCEL_DEADLINE: Duration = Duration::from_secs(3);

/// Shared cancel flag. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clears the flag before a new run starts.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    /// `Err(Canceled)` once the flag is set; meant for `?` between work units.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(EngineError::Canceled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapturedOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr_tail: String,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

struct Registration {
    tool: String,
    pgid: u32,
    child: Arc<Mutex<Child>>,
}

pub struct ProcessSupervisor {
    registry: Mutex<HashMap<u64, Registration>>,
    next_id: AtomicU64,
    token: CancellationToken,
    grace_period: Duration,
    cancel_deadline: Duration,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_GRACE_PERIOD, DEFAULT_CANCEL_DEADLINE)
    }

    pub fn with_timeouts(grace_period: Duration, cancel_deadline: Duration) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            token: CancellationToken::new(),
            grace_period,
            cancel_deadline,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn tracked_count(&self) -> usize {
        self.lock_registry().len()
    }

    /// Launches `argv` without a shell, in a fresh process group, and
    /// registers it until it is reaped.
    pub fn spawn_tracked<S: AsRef<OsStr>>(
        &self,
        argv: &[S],
        cwd: Option<&Path>,
    ) -> Result<TrackedChild<'_>> {
        self.spawn_with(argv, cwd, Stdio::piped(), Stdio::piped())
    }

    fn spawn_with<S: AsRef<OsStr>>(
        &self,
        argv: &[S],
        cwd: Option<&Path>,
        stdout: Stdio,
        stderr: Stdio,
    ) -> Result<TrackedChild<'_>> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::InvalidOptions("empty command line".to_string()))?;
        self.token.check()?;

        let tool = tool_label(program.as_ref());
        let mut command = cmd::command(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ToolNotFound { tool: tool.clone() },
            _ => EngineError::Io(e),
        })?;

        let pgid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_registry().insert(
            id,
            Registration {
                tool: tool.clone(),
                pgid,
                child: child.clone(),
            },
        );
        debug!(tool = %tool, pid = pgid, "spawned tracked process");

        let tracked = TrackedChild {
            supervisor: self,
            id,
            tool,
            pgid,
            child,
            stdout,
            stderr,
        };
        // A cancel that snapshotted the registry before our insert never
        // signalled this child; dropping it kills and deregisters it.
        if self.token.is_canceled() {
            drop(tracked);
            return Err(EngineError::Canceled);
        }
        Ok(tracked)
    }

    /// Runs to completion capturing stdout and the stderr tail. A nonzero
    /// exit is returned as data, not as an error.
    pub fn capture_run<S: AsRef<OsStr>>(
        &self,
        argv: &[S],
        timeout: Option<Duration>,
    ) -> Result<CapturedOutput> {
        let mut child = self.spawn_tracked(argv, None)?;
        let stdout_handle = child.stdout.take().map(|mut out| {
            thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf);
                buf
            })
        });
        let stderr_handle = child.stderr.take().map(spawn_tail_reader);

        let status = child.wait_with_timeout(timeout);
        let stdout = stdout_handle
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr_tail = stderr_handle.and_then(|h| h.join().ok()).unwrap_or_default();
        let status = status?;

        Ok(CapturedOutput {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr_tail,
        })
    }

    /// `capture_run` that maps a nonzero exit to `ProcessFailed`.
    pub fn run_checked<S: AsRef<OsStr>>(
        &self,
        argv: &[S],
        timeout: Option<Duration>,
    ) -> Result<CapturedOutput> {
        let output = self.capture_run(argv, timeout)?;
        if !output.success() {
            return Err(EngineError::ProcessFailed {
                tool: argv.first().map(|p| tool_label(p.as_ref())).unwrap_or_default(),
                exit_code: output.exit_code,
                stderr_tail: output.stderr_tail,
            });
        }
        Ok(output)
    }

    /// Runs to completion discarding all output; returns the exit code
    /// (`-1` when the child was terminated by a signal).
    pub fn quiet_run<S: AsRef<OsStr>>(&self, argv: &[S]) -> Result<i32> {
        let mut child = self.spawn_with(argv, None, Stdio::null(), Stdio::null())?;
        let status = child.wait_with_timeout(None)?;
        Ok(status.code().unwrap_or(-1))
    }

    /// Runs to completion feeding each stdout line to `on_line` as it
    /// arrives. Returning `ControlFlow::Break` terminates the child and the
    /// call returns `Canceled`.
    pub fn stream_run<S, F>(
        &self,
        argv: &[S],
        cwd: Option<&Path>,
        timeout: Option<Duration>,
        mut on_line: F,
    ) -> Result<CapturedOutput>
    where
        S: AsRef<OsStr>,
        F: FnMut(&str) -> ControlFlow<()>,
    {
        let mut child = self.spawn_tracked(argv, cwd)?;
        let stderr_handle = child.stderr.take().map(spawn_tail_reader);

        let watchdog = Watchdog::start(
            child.pgid,
            timeout,
            self.token.clone(),
            self.grace_period,
        );

        let mut interrupted = false;
        if let Some(stdout) = child.stdout.take() {
            let mut reader = BufReader::new(stdout);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match read_bounded_line(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\r', '\n']);
                        if on_line(line).is_break() {
                            interrupted = true;
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(tool = %child.tool, "stdout read failed: {err}");
                        break;
                    }
                }
            }
        }

        if interrupted {
            child.escalate();
        }
        let status = child.wait_with_timeout(None);
        let timed_out = watchdog.finish();
        let stderr_tail = stderr_handle.and_then(|h| h.join().ok()).unwrap_or_default();

        if interrupted {
            return Err(EngineError::Canceled);
        }
        if timed_out {
            return Err(EngineError::TimeoutEscalated {
                tool: child.tool.clone(),
                timeout_secs: timeout.map(|t| t.as_secs()).unwrap_or_default(),
            });
        }
        let status = status?;
        if self.token.is_canceled() && !status.success() {
            return Err(EngineError::Canceled);
        }

        Ok(CapturedOutput {
            exit_code: status.code(),
            stdout: String::new(),
            stderr_tail,
        })
    }

    /// Sets the shared cancel flag and terminates every tracked process.
    pub fn cancel(&self) {
        self.token.cancel();
        self.cancel_all();
    }

    /// Gracefully signals every tracked process group, waits up to one
    /// aggregate deadline, force-kills survivors and deregisters them.
    /// Children registered after the snapshot are left to their owners.
    /// Safe to call repeatedly and from several threads.
    pub fn cancel_all(&self) {
        let snapshot: Vec<(u64, String, u32, Arc<Mutex<Child>>)> = self
            .lock_registry()
            .iter()
            .map(|(id, r)| (*id, r.tool.clone(), r.pgid, r.child.clone()))
            .collect();
        if snapshot.is_empty() {
            return;
        }
        debug!(count = snapshot.len(), "terminating tracked processes");

        for (_, _, pgid, child) in &snapshot {
            if still_running(child) {
                let _ = cmd::signal_group_terminate(*pgid);
            }
        }

        let deadline = Instant::now() + self.cancel_deadline;
        while Instant::now() < deadline {
            if snapshot.iter().all(|(_, _, _, child)| !still_running(child)) {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }

        for (_, tool, pgid, child) in &snapshot {
            if still_running(child) {
                warn!(tool = %tool, pid = pgid, "process ignored terminate signal, killing");
                cmd::kill_group(*pgid);
                let mut guard = lock_child(child);
                let _ = guard.kill();
                let _ = guard.wait();
            }
        }

        let mut registry = self.lock_registry();
        for (id, _, _, _) in &snapshot {
            registry.remove(id);
        }
    }

    fn deregister(&self, id: u64) {
        self.lock_registry().remove(&id);
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<u64, Registration>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A registered child. Dropping it kills the child if it is still alive and
/// removes it from the registry.
pub struct TrackedChild<'a> {
    supervisor: &'a ProcessSupervisor,
    id: u64,
    tool: String,
    pgid: u32,
    child: Arc<Mutex<Child>>,
    stdout: Option<std::process::ChildStdout>,
    stderr: Option<std::process::ChildStderr>,
}

impl TrackedChild<'_> {
    pub fn pid(&self) -> u32 {
        self.pgid
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn take_stdout(&mut self) -> Option<std::process::ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<std::process::ChildStderr> {
        self.stderr.take()
    }

    /// Waits for exit. Cancellation or an elapsed timeout triggers the single
    /// escalation step (group signal, bounded grace wait, force kill).
    pub fn wait_with_timeout(&mut self, timeout: Option<Duration>) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            let polled = lock_child(&self.child).try_wait();
            match polled {
                Ok(Some(status)) => {
                    debug!(tool = %self.tool, code = ?status.code(), "tracked process exited");
                    return Ok(status);
                }
                Ok(None) => {}
                Err(err) => {
                    self.force_kill();
                    return Err(EngineError::Io(err));
                }
            }

            if self.supervisor.token.is_canceled() {
                self.escalate();
                return Err(EngineError::Canceled);
            }
            if let Some(limit) = timeout {
                if started.elapsed() >= limit {
                    warn!(tool = %self.tool, "timed out after {}s, terminating", limit.as_secs());
                    self.escalate();
                    return Err(EngineError::TimeoutEscalated {
                        tool: self.tool.clone(),
                        timeout_secs: limit.as_secs(),
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn escalate(&self) {
        if !still_running(&self.child) {
            return;
        }
        let _ = cmd::signal_group_terminate(self.pgid);
        let deadline = Instant::now() + self.supervisor.grace_period;
        while Instant::now() < deadline {
            if !still_running(&self.child) {
                return;
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.force_kill();
    }

    fn force_kill(&self) {
        cmd::kill_group(self.pgid);
        let mut child = lock_child(&self.child);
        let _ = child.kill();
        let _ = child.wait();
    }
}

impl Drop for TrackedChild<'_> {
    fn drop(&mut self) {
        if still_running(&self.child) {
            self.force_kill();
        }
        self.supervisor.deregister(self.id);
    }
}

/// Kills the process group at the deadline or on cancellation while the
/// owning thread is blocked reading the child's stdout.
struct Watchdog {
    done: Arc<AtomicBool>,
    fired: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn start(
        pgid: u32,
        timeout: Option<Duration>,
        token: CancellationToken,
        grace: Duration,
    ) -> Self {
        let done = Arc::new(AtomicBool::new(false));
        let fired = Arc::new(AtomicBool::new(false));
        let done_thread = done.clone();
        let fired_thread = fired.clone();
        let handle = thread::spawn(move || {
            let started = Instant::now();
            while !done_thread.load(Ordering::SeqCst) {
                let expired = timeout.is_some_and(|t| started.elapsed() >= t);
                if expired || token.is_canceled() {
                    if expired {
                        fired_thread.store(true, Ordering::SeqCst);
                    }
                    let _ = cmd::signal_group_terminate(pgid);
                    let grace_end = Instant::now() + grace;
                    while Instant::now() < grace_end && !done_thread.load(Ordering::SeqCst) {
                        thread::sleep(POLL_INTERVAL);
                    }
                    if !done_thread.load(Ordering::SeqCst) {
                        cmd::kill_group(pgid);
                    }
                    return;
                }
                thread::sleep(POLL_INTERVAL);
            }
        });
        Self {
            done,
            fired,
            handle: Some(handle),
        }
    }

    /// Stops the watchdog; true when it fired because of the timeout.
    fn finish(mut self) -> bool {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.fired.load(Ordering::SeqCst)
    }
}

fn spawn_tail_reader(stderr: std::process::ChildStderr) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut tail = StderrTail::new(STDERR_TAIL_LINES);
        let mut reader = BufReader::new(stderr);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match read_bounded_line(&mut reader, &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => tail.push(String::from_utf8_lossy(&buf).trim_end().to_string()),
            }
        }
        tail.joined()
    })
}

/// Reads up to one line, capped at `MAX_LINE_BYTES`. Longer lines arrive
/// as several chunks.
fn read_bounded_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    reader.take(MAX_LINE_BYTES as u64).read_until(b'\n', buf)
}

/// Keeps only the last `capacity` lines of a noisy stream.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

fn still_running(child: &Arc<Mutex<Child>>) -> bool {
    matches!(lock_child(child).try_wait(), Ok(None))
}

fn lock_child(child: &Arc<Mutex<Child>>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|e| e.into_inner())
}

fn tool_label(program: &OsStr) -> String {
    Path::new(program)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string_lossy().to_string())
}

/// Converts display-friendly arguments into an owned argv.
pub fn argv<I, S>(parts: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    parts.into_iter().map(Into::into).collect()
}
