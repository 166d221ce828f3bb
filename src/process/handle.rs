//! One supervised child process
//!
//! A handle owns two tasks. The reader merges stdout and stderr into the
//! handle's [`OutputQueue`]. The watcher owns the child, reaps it, and kills
//! the whole process tree when the hard timeout elapses or the handle is
//! cancelled. The exit state is published only after output is drained,
//! so once [`ProcessHandle::poll`] reports an exit the captured output is
//! complete.

use crate::error::{CigateError, CigateResult};
use crate::process::diagnostics::StackTraceCapture;
use crate::process::output::OutputQueue;
use crate::process::registry::ProcessRegistry;
use crate::process::tree::{kill_process_tree, TERM_GRACE};
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long the watcher waits for the reader after the child is reaped
const READER_DRAIN: Duration = Duration::from_millis(500);

/// Default interval for polling loops
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a reaped child ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Code(i32),
    Signal(i32),
}

impl ExitKind {
    /// Exit code, with signals reported as their negated number
    pub fn as_code(&self) -> i32 {
        match self {
            Self::Code(code) => *code,
            Self::Signal(signal) => -signal,
        }
    }
}

impl From<ExitStatus> for ExitKind {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::Code(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::Signal(signal);
            }
        }
        Self::Code(-1)
    }
}

/// Spawn settings for a handle
#[derive(Clone)]
pub struct ProcessOptions {
    pub cwd: Option<PathBuf>,
    /// Hard wall-clock limit enforced by the watcher
    pub timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Run before the timeout kill
    pub stack_capture: Option<Arc<dyn StackTraceCapture>>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stack_capture: None,
        }
    }
}

impl fmt::Debug for ProcessOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessOptions")
            .field("cwd", &self.cwd)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field(
                "stack_capture",
                &self.stack_capture.as_ref().map(|c| c.name()),
            )
            .finish()
    }
}

#[derive(Debug, Default)]
struct ExitState {
    status: Option<ExitKind>,
    ended_at: Option<Instant>,
    timed_out: bool,
    killed: bool,
    stack_trace: Option<String>,
}

type SharedState = Arc<Mutex<ExitState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, ExitState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// A running (or finished) child process
pub struct ProcessHandle {
    command: Vec<String>,
    pid: u32,
    started_at: Instant,
    timeout: Option<Duration>,
    poll_interval: Duration,
    output: Arc<OutputQueue>,
    state: SharedState,
    done: watch::Receiver<bool>,
    kill_token: CancellationToken,
    parent: CancellationToken,
}

impl ProcessHandle {
    /// Start `command` as the leader of a new process group.
    ///
    /// The handle is cancelled along with `cancel`.
    pub fn spawn(
        command: Vec<String>,
        options: ProcessOptions,
        registry: &ProcessRegistry,
        cancel: &CancellationToken,
    ) -> CigateResult<Self> {
        let command_line = command.join(" ");
        let (program, args) = command
            .split_first()
            .ok_or_else(|| CigateError::EmptyCommand(command_line.clone()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &options.cwd {
            cmd.current_dir(cwd);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| CigateError::spawn_failed(&command_line, e))?;
        let pid = child.id().unwrap_or(0);
        let started_at = Instant::now();
        debug!("Started pid {}: {}", pid, command_line);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CigateError::Internal("child stdout was not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CigateError::Internal("child stderr was not piped".to_string()))?;

        let output = Arc::new(OutputQueue::new());
        let reader_stop = CancellationToken::new();
        let reader = tokio::spawn(read_output(
            stdout,
            stderr,
            Arc::clone(&output),
            reader_stop.clone(),
        ));

        let state: SharedState = Arc::default();
        let (done_tx, done_rx) = watch::channel(false);
        let kill_token = cancel.child_token();
        let registry_id = registry.register(pid, &command_line, options.cwd.clone());

        let watcher = Watcher {
            pid,
            started_at,
            timeout: options.timeout,
            stack_capture: options.stack_capture,
            kill_token: kill_token.clone(),
            state: Arc::clone(&state),
            output: Arc::clone(&output),
            reader,
            reader_stop,
            registry: registry.clone(),
            registry_id,
            done: done_tx,
        };
        tokio::spawn(watcher.run(child));

        Ok(Self {
            command,
            pid,
            started_at,
            timeout: options.timeout,
            poll_interval: options.poll_interval,
            output,
            state,
            done: done_rx,
            kill_token,
            parent: cancel.clone(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// Command joined with spaces
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }

    /// The handle's output queue
    pub fn output(&self) -> &Arc<OutputQueue> {
        &self.output
    }

    /// Wait up to `timeout` for the next output line
    pub async fn next_line(&self, timeout: Option<Duration>) -> Option<String> {
        self.output.next(timeout).await
    }

    /// Pop a queued line without waiting
    pub fn try_next_line(&self) -> Option<String> {
        self.output.try_next()
    }

    /// Lines are queued or the reader is still running
    pub fn has_more_output(&self) -> bool {
        self.output.has_more()
    }

    /// Every line captured so far
    pub fn output_lines(&self) -> Vec<String> {
        self.output.history()
    }

    /// Exit status if the child has been reaped
    pub fn poll(&self) -> Option<ExitKind> {
        lock_state(&self.state).status
    }

    pub fn is_running(&self) -> bool {
        self.poll().is_none()
    }

    /// Exit code if finished (signals negated)
    pub fn exit_code(&self) -> Option<i32> {
        self.poll().map(|kind| kind.as_code())
    }

    /// Whether the hard timeout fired
    pub fn timed_out(&self) -> bool {
        lock_state(&self.state).timed_out
    }

    /// Whether the child was killed through the handle or its parent token
    pub fn was_killed(&self) -> bool {
        lock_state(&self.state).killed
    }

    /// Stack dump captured before a timeout kill
    pub fn stack_trace(&self) -> Option<String> {
        lock_state(&self.state).stack_trace.clone()
    }

    /// Time from start to exit, or to now while still running
    pub fn duration(&self) -> Duration {
        let end = lock_state(&self.state).ended_at.unwrap_or_else(Instant::now);
        end.saturating_duration_since(self.started_at)
    }

    /// Kill the process tree and wait until the child is reaped
    pub async fn kill(&self) {
        self.kill_token.cancel();
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Wait for the child to finish and return its exit code.
    ///
    /// `limit` bounds this wait independently of the handle's own timeout;
    /// when it elapses the tree is killed and `ProcessTimeout` returned.
    /// A child ended by SIGINT, or killed because the parent token was
    /// cancelled, yields `Interrupted`.
    pub async fn wait(&self, limit: Option<Duration>) -> CigateResult<i32> {
        let start = Instant::now();
        loop {
            if let Some(result) = self.exit_result() {
                return result;
            }
            if let Some(limit) = limit {
                if start.elapsed() >= limit {
                    self.kill().await;
                    return Err(CigateError::ProcessTimeout {
                        command: self.command_line(),
                        timeout: limit,
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Translate the exit state into a wait result, `None` while running
    pub(crate) fn exit_result(&self) -> Option<CigateResult<i32>> {
        let state = lock_state(&self.state);
        let status = state.status?;

        if state.timed_out {
            return Some(Err(CigateError::ProcessTimeout {
                command: self.command_line(),
                timeout: self.timeout.unwrap_or_default(),
            }));
        }
        if state.killed && self.parent.is_cancelled() {
            return Some(Err(CigateError::Interrupted));
        }
        #[cfg(unix)]
        if status == ExitKind::Signal(libc::SIGINT) && !state.killed {
            return Some(Err(CigateError::Interrupted));
        }
        Some(Ok(status.as_code()))
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("command", &self.command)
            .field("status", &self.poll())
            .finish()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill_token.cancel();
    }
}

struct Watcher {
    pid: u32,
    started_at: Instant,
    timeout: Option<Duration>,
    stack_capture: Option<Arc<dyn StackTraceCapture>>,
    kill_token: CancellationToken,
    state: SharedState,
    output: Arc<OutputQueue>,
    reader: JoinHandle<()>,
    reader_stop: CancellationToken,
    registry: ProcessRegistry,
    registry_id: u64,
    done: watch::Sender<bool>,
}

impl Watcher {
    async fn run(mut self, mut child: Child) {
        // A timeout past the end of the clock is no timeout.
        let deadline = self
            .timeout
            .and_then(|t| self.started_at.checked_add(t));

        let status = tokio::select! {
            status = child.wait() => status,
            _ = sleep_until(deadline) => {
                warn!(
                    "pid {} exceeded its {:.1}s timeout, killing",
                    self.pid,
                    self.timeout.unwrap_or_default().as_secs_f64()
                );
                if let Some(capture) = &self.stack_capture {
                    let trace = capture.capture(self.pid).await;
                    lock_state(&self.state).stack_trace = trace;
                }
                lock_state(&self.state).timed_out = true;
                self.terminate(&mut child).await
            }
            _ = self.kill_token.cancelled() => {
                debug!("Killing pid {} on request", self.pid);
                lock_state(&self.state).killed = true;
                self.terminate(&mut child).await
            }
        };

        let kind = match status {
            Ok(status) => ExitKind::from(status),
            Err(e) => {
                warn!("Failed to reap pid {}: {}", self.pid, e);
                ExitKind::Code(-1)
            }
        };

        if tokio::time::timeout(READER_DRAIN, &mut self.reader)
            .await
            .is_err()
        {
            debug!("Output of pid {} still open after exit, closing", self.pid);
            self.reader_stop.cancel();
        }
        self.output.close();

        {
            let mut state = lock_state(&self.state);
            state.status = Some(kind);
            state.ended_at = Some(Instant::now());
        }
        self.registry.unregister(self.registry_id);
        debug!("pid {} finished: {:?}", self.pid, kind);
        let _ = self.done.send(true);
    }

    async fn terminate(&self, child: &mut Child) -> std::io::Result<ExitStatus> {
        if let Err(e) = kill_process_tree(self.pid, TERM_GRACE).await {
            warn!("Failed to kill process tree of pid {}: {}", self.pid, e);
            let _ = child.start_kill();
        }
        child.wait().await
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Merge stdout and stderr line by line into `queue`, closing it at EOF.
///
/// Lines are read as raw bytes so invalid UTF-8 never stops the drain.
async fn read_output(
    stdout: ChildStdout,
    stderr: ChildStderr,
    queue: Arc<OutputQueue>,
    stop: CancellationToken,
) {
    let mut stdout = BufReader::new(stdout);
    let mut stderr = BufReader::new(stderr);
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_open = true;
    let mut stderr_open = true;

    while stdout_open || stderr_open {
        tokio::select! {
            read = stdout.read_until(b'\n', &mut stdout_buf), if stdout_open => {
                stdout_open = forward_line(read, &mut stdout_buf, &queue);
            }
            read = stderr.read_until(b'\n', &mut stderr_buf), if stderr_open => {
                stderr_open = forward_line(read, &mut stderr_buf, &queue);
            }
            _ = stop.cancelled() => break,
        }
    }

    queue.close();
}

/// Push whatever `buf` holds as one line. Returns whether the stream is
/// still open.
fn forward_line(read: std::io::Result<usize>, buf: &mut Vec<u8>, queue: &OutputQueue) -> bool {
    let open = match read {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => {
            debug!("Output stream closed with error: {}", e);
            false
        }
    };
    if !buf.is_empty() {
        queue.push(decode_line(buf));
        buf.clear();
    }
    open
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}
