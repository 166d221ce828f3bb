//! Configuration schema for cigate
//!
//! Global configuration lives at `~/.config/cigate/config.toml`; a
//! project-local `.cigate.toml` overrides individual keys.

use crate::cache::CacheStrategy;
use crate::process::{GdbStackCapture, GroupMode, GroupOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Fingerprint cache settings
    pub cache: CacheConfig,

    /// Process group defaults
    pub group: GroupConfig,

    /// Resource lock settings
    pub lock: LockConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
        }
    }
}

/// Fingerprint cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding `<name>.json` cache files
    pub dir: PathBuf,

    /// Seconds to wait for a cache file lock (0 waits forever)
    pub lock_timeout_secs: u64,

    /// Strategy used when a command does not name one
    pub default_strategy: CacheStrategy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".cigate/cache"),
            lock_timeout_secs: 60,
            default_strategy: CacheStrategy::default(),
        }
    }
}

impl CacheConfig {
    pub fn lock_timeout(&self) -> Option<Duration> {
        secs(self.lock_timeout_secs)
    }
}

/// Process group defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Failures that abort a group
    pub failure_threshold: usize,

    /// Kill processes silent for this long (0 disables)
    pub stuck_threshold_secs: u64,

    /// Wall-clock limit per group (0 disables)
    pub global_timeout_secs: u64,

    /// Per-process limit for jobs without their own (0 disables)
    pub default_timeout_secs: u64,

    /// Control loop poll interval
    pub poll_interval_ms: u64,

    /// Attach gdb to timed-out processes before killing them
    pub capture_stack_traces: bool,

    /// Failures shown with full output in summaries
    pub failure_detail_limit: usize,

    /// Output lines kept per failure
    pub snippet_lines: usize,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 1,
            stuck_threshold_secs: 600,
            global_timeout_secs: 0,
            default_timeout_secs: 0,
            poll_interval_ms: 50,
            capture_stack_traces: false,
            failure_detail_limit: 3,
            snippet_lines: 20,
        }
    }
}

impl GroupConfig {
    /// Group options for `mode` built from these defaults
    pub fn options(&self, mode: GroupMode) -> GroupOptions {
        GroupOptions {
            mode,
            failure_threshold: self.failure_threshold.max(1),
            stuck_threshold: secs(self.stuck_threshold_secs),
            global_timeout: secs(self.global_timeout_secs),
            default_timeout: secs(self.default_timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            snippet_lines: self.snippet_lines,
            stack_capture: self
                .capture_stack_traces
                .then(|| Arc::new(GdbStackCapture::default()) as _),
        }
    }
}

/// Resource lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Directory for `<name>.lock` files (system temp dir when unset)
    pub dir: Option<PathBuf>,

    /// Seconds to wait for a resource lock (0 waits forever)
    pub timeout_secs: u64,

    /// Seconds before warning that a lock is taking long
    pub warn_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: None,
            timeout_secs: 3600,
            warn_after_secs: 30,
        }
    }
}

impl LockConfig {
    /// Lock directory, shared by every checkout on the machine by default
    pub fn resolved_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("cigate-locks"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        secs(self.timeout_secs)
    }

    pub fn warn_after(&self) -> Duration {
        Duration::from_secs(self.warn_after_secs)
    }
}

/// Zero means "no limit"
fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::StackTraceCapture;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[group]"));
        assert!(toml.contains("default_strategy = \"batch\""));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.general.log_format, "text");
        assert_eq!(config.group.failure_threshold, 1);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
[cache]
default_strategy = "per-file"

[group]
failure_threshold = 5
global_timeout_secs = 900
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.cache.default_strategy, CacheStrategy::PerFile);
        assert_eq!(config.cache.lock_timeout_secs, 60);
        assert_eq!(config.group.failure_threshold, 5);
        assert_eq!(config.group.stuck_threshold_secs, 600);
    }

    #[test]
    fn zero_disables_limits() {
        let group = GroupConfig {
            stuck_threshold_secs: 0,
            global_timeout_secs: 30,
            ..GroupConfig::default()
        };
        let options = group.options(GroupMode::Sequential);
        assert_eq!(options.mode, GroupMode::Sequential);
        assert_eq!(options.stuck_threshold, None);
        assert_eq!(options.global_timeout, Some(Duration::from_secs(30)));
        assert!(options.stack_capture.is_none());
    }

    #[test]
    fn stack_capture_is_opt_in() {
        let group = GroupConfig {
            capture_stack_traces: true,
            ..GroupConfig::default()
        };
        let capture = group.options(GroupMode::Parallel).stack_capture.unwrap();
        assert_eq!(capture.name(), "gdb");
    }
}
