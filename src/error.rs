//! Error types for cigate
//!
//! All modules use `CigateResult<T>` as their return type.

use crate::process::FailureRecord;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for cigate operations
pub type CigateResult<T> = Result<T, CigateError>;

/// All errors that can occur in cigate
#[derive(Error, Debug)]
pub enum CigateError {
    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create directory {path}: {source}")]
    DirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid jobs file {path}: {reason}")]
    JobsInvalid { path: PathBuf, reason: String },

    // Cache errors
    #[error("No pending fingerprint for cache '{cache}': commit called without a preceding check")]
    NoPendingFingerprint { cache: String },

    #[error("Unknown cache strategy: {0}")]
    UnknownStrategy(String),

    // Lock errors
    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    // Process errors
    #[error("Failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Process `{command}` timed out after {timeout:?}")]
    ProcessTimeout { command: String, timeout: Duration },

    #[error("Empty command for job '{0}'")]
    EmptyCommand(String),

    // Group errors
    #[error("Group '{group}' aborted after {} failure(s)", .failures.len())]
    GroupAborted {
        group: String,
        failures: Vec<FailureRecord>,
    },

    #[error("Group '{group}' exceeded its global timeout of {timeout:?} ({} process(es) killed)", .failures.len())]
    GlobalTimeout {
        group: String,
        timeout: Duration,
        failures: Vec<FailureRecord>,
    },

    #[error("Group '{group}' finished with {failed} failed job(s)")]
    GroupFailed { group: String, failed: usize },

    #[error("Group '{group}' cannot make progress: no runnable job among {}", .remaining.join(", "))]
    DependencyDeadlock { group: String, remaining: Vec<String> },

    #[error("Job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Duplicate job id: {0}")]
    DuplicateJob(String),

    #[error("Interrupted")]
    Interrupted,

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CigateError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a spawn error
    pub fn spawn_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            command: command.into(),
            source,
        }
    }

    /// Orchestration-level failures that leave no meaningful partial progress
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout { .. }
                | Self::GlobalTimeout { .. }
                | Self::DependencyDeadlock { .. }
                | Self::Interrupted
        )
    }

    /// Per-incident records carried by aggregate group failures
    pub fn failures(&self) -> &[FailureRecord] {
        match self {
            Self::GroupAborted { failures, .. } | Self::GlobalTimeout { failures, .. } => failures,
            _ => &[],
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoPendingFingerprint { .. } => {
                Some("Run `cigate check` for this cache before committing")
            }
            Self::LockTimeout { .. } => {
                Some("Another build holds the lock; wait for it or raise lock.timeout_secs")
            }
            Self::DependencyDeadlock { .. } => Some("Check depends_on entries for cycles"),
            Self::UnknownStrategy(_) => Some("Valid strategies: per-file, batch, aggregate"),
            _ => None,
        }
    }
}
