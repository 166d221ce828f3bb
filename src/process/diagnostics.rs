//! Stack-trace capture for hung processes

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Captures a diagnostic dump of a live process before it is killed
#[async_trait]
pub trait StackTraceCapture: Send + Sync {
    /// Tool name for logs
    fn name(&self) -> &'static str;

    /// Dump the stacks of `pid`, or `None` if nothing could be captured
    async fn capture(&self, pid: u32) -> Option<String>;
}

/// Attaches gdb in batch mode and prints every thread's backtrace
#[derive(Debug, Clone)]
pub struct GdbStackCapture {
    timeout: Duration,
}

impl GdbStackCapture {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for GdbStackCapture {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl StackTraceCapture for GdbStackCapture {
    fn name(&self) -> &'static str {
        "gdb"
    }

    async fn capture(&self, pid: u32) -> Option<String> {
        let pid_arg = pid.to_string();
        let run = Command::new("gdb")
            .args([
                "-p",
                pid_arg.as_str(),
                "-batch",
                "-ex",
                "thread apply all bt",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(output)) if output.status.success() => {
                let trace = String::from_utf8_lossy(&output.stdout).into_owned();
                debug!("Captured {} bytes of stack trace for pid {}", trace.len(), pid);
                Some(trace)
            }
            Ok(Ok(output)) => {
                warn!(
                    "gdb exited with {:?} while attaching to pid {}",
                    output.status.code(),
                    pid
                );
                None
            }
            Ok(Err(e)) => {
                warn!("Could not run gdb for pid {}: {}", pid, e);
                None
            }
            Err(_) => {
                warn!(
                    "gdb did not finish within {}s for pid {}",
                    self.timeout.as_secs(),
                    pid
                );
                None
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records calls instead of attaching a debugger
    #[derive(Debug, Default)]
    pub(crate) struct RecordingCapture {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl StackTraceCapture for RecordingCapture {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn capture(&self, pid: u32) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(format!("stack of {}", pid))
        }
    }

    #[tokio::test]
    async fn trait_object_is_usable() {
        let capture: Arc<dyn StackTraceCapture> = Arc::new(RecordingCapture::default());
        assert_eq!(capture.capture(12).await.as_deref(), Some("stack of 12"));
        assert_eq!(capture.name(), "recording");
    }
}
