//! Process execution and orchestration
//!
//! - [`ProcessHandle`] runs one child in its own process group, drains its
//!   output on a reader task and enforces its timeout on a watcher task.
//! - [`ProcessGroup`] schedules many handles (parallel, sequential or by
//!   dependency), kills stuck ones, and aborts the batch once the failure
//!   budget is spent.
//! - [`ProcessRegistry`] lists every live child for hang diagnostics.

mod diagnostics;
mod group;
mod handle;
mod monitor;
mod output;
mod registry;
pub mod report;
mod tree;

pub use diagnostics::{GdbStackCapture, StackTraceCapture};
pub use group::{GroupOptions, GroupStatus, GroupStatusSnapshot, ProcessGroup};
pub use handle::{ExitKind, ProcessHandle, ProcessOptions};
pub use monitor::{StuckMonitor, StuckSignal};
pub use output::OutputQueue;
pub use registry::{ActiveProcess, ProcessRegistry};
pub use tree::kill_process_tree;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CigateError;

/// One runnable command handed to a group
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    /// Identifier unique within the group
    pub id: String,
    /// Program followed by its arguments
    pub command: Vec<String>,
    /// Working directory (inherits when unset)
    pub cwd: Option<PathBuf>,
    /// Hard wall-clock limit for this process
    pub timeout: Option<Duration>,
    /// Items that must complete successfully first (dependency mode)
    pub depends_on: Vec<String>,
}

impl WorkItem {
    /// Create an item with no working directory, timeout or dependencies
    pub fn new<I, S>(id: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            command: command.into_iter().map(Into::into).collect(),
            cwd: None,
            timeout: None,
            depends_on: Vec::new(),
        }
    }

    /// Shell one-liner run through `sh -c`
    pub fn shell(id: impl Into<String>, script: impl Into<String>) -> Self {
        Self::new(id, ["sh".to_string(), "-c".to_string(), script.into()])
    }

    /// Set the working directory
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Set the hard timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Add a dependency on another item
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Command rendered for logs and failure reports
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }
}

/// How a group schedules its items
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Start everything at once
    #[default]
    Parallel,
    /// One at a time in list order, stop at the first failure
    Sequential,
    /// One at a time, each once its dependencies succeeded
    Dependency,
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Parallel => "parallel",
            Self::Sequential => "sequential",
            Self::Dependency => "dependency",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for GroupMode {
    type Err = CigateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            "dependency" => Ok(Self::Dependency),
            other => Err(CigateError::Internal(format!("unknown group mode: {}", other))),
        }
    }
}

/// Terminal state of one handle in a group, recorded exactly once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Exited on its own with this code (negative: killed by that signal)
    Completed(i32),
    /// Killed after producing no output for the stuck threshold
    KilledStuck,
    /// Killed by its own hard timeout
    KilledTimeout,
    /// Killed because the whole group ran out of time
    KilledGlobalTimeout,
    /// Killed because the group aborted or was interrupted
    Aborted,
}

impl HandleOutcome {
    /// Whether this outcome counts as success
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(0))
    }
}

/// Lifecycle of a handle inside a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Pending,
    Running,
    Finished(HandleOutcome),
}

/// Why an item counted against the failure budget
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Exited with a non-zero code
    NonZeroExit(i32),
    /// No output for this long
    Stuck { idle: Duration },
    /// Hard timeout elapsed
    Timeout(Duration),
    /// Killed when the group's global timeout elapsed
    GlobalTimeout,
    /// Could not be started
    SpawnFailed(String),
}

impl FailureReason {
    /// Sort key: hangs first, then crashes, then plain exits
    pub fn rank(&self) -> u8 {
        match self {
            Self::Stuck { .. } => 0,
            Self::Timeout(_) => 1,
            Self::GlobalTimeout => 2,
            Self::SpawnFailed(_) => 3,
            Self::NonZeroExit(code) if *code < 0 => 4,
            Self::NonZeroExit(_) => 5,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonZeroExit(code) if *code < 0 => write!(f, "killed by signal {}", -code),
            Self::NonZeroExit(code) => write!(f, "exit code {}", code),
            Self::Stuck { idle } => write!(f, "stuck (no output for {:.1}s)", idle.as_secs_f64()),
            Self::Timeout(limit) => write!(f, "timed out after {:.1}s", limit.as_secs_f64()),
            Self::GlobalTimeout => write!(f, "killed by group timeout"),
            Self::SpawnFailed(reason) => write!(f, "failed to start: {}", reason),
        }
    }
}

/// Structured record of one failed item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub id: String,
    pub command: String,
    pub reason: FailureReason,
    /// Tail of the captured output
    pub snippet: Vec<String>,
    /// Debugger dump taken before a timeout kill
    pub stack_trace: Option<String>,
    pub duration: Duration,
}

/// Per-item result: exit code, captured output, duration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub id: String,
    pub outcome: HandleOutcome,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub duration: Duration,
}

/// Aggregate result of a group that did not abort
#[derive(Debug, Clone, Default)]
pub struct GroupResult {
    pub name: String,
    /// One record per finished item, in completion order
    pub reports: Vec<JobReport>,
    pub failures: Vec<FailureRecord>,
    pub duration: Duration,
}

impl GroupResult {
    /// Number of items that exited zero
    pub fn passed(&self) -> usize {
        self.reports.iter().filter(|r| r.outcome.is_success()).count()
    }

    /// Number of items counted as failures
    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    /// Whether every item succeeded
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}
