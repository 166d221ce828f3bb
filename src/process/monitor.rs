//! Stuck-process detection
//!
//! One coordinator task watches every handle of a group. It keeps a
//! min-heap of "idle deadlines" (last output + threshold) and sleeps until
//! the earliest one. When a deadline fires it re-reads the handle's last
//! activity: if output arrived meanwhile the entry is pushed back with the
//! new deadline, otherwise a [`StuckSignal`] is sent. The coordinator never
//! kills anything; the group's control loop decides.

use crate::process::output::OutputQueue;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A watched handle went quiet for longer than the threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StuckSignal {
    /// Key passed to [`StuckMonitor::watch`]
    pub key: usize,
    /// Time since the handle's last output line
    pub idle: Duration,
}

enum MonitorCommand {
    Watch { key: usize, output: Arc<OutputQueue> },
    Forget { key: usize },
}

/// Handle to the coordinator task
#[derive(Debug)]
pub struct StuckMonitor {
    threshold: Duration,
    commands: mpsc::UnboundedSender<MonitorCommand>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl StuckMonitor {
    /// Start the coordinator. Signals arrive on the returned receiver.
    pub fn spawn(
        threshold: Duration,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<StuckSignal>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let shutdown = cancel.child_token();

        let task = tokio::spawn(coordinate(
            threshold,
            command_rx,
            signal_tx,
            shutdown.clone(),
        ));

        let monitor = Self {
            threshold,
            commands: command_tx,
            shutdown,
            task,
        };
        (monitor, signal_rx)
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Start watching `output` under `key`
    pub fn watch(&self, key: usize, output: Arc<OutputQueue>) {
        self.send(MonitorCommand::Watch { key, output });
    }

    /// Stop watching `key` (its handle finished or was killed)
    pub fn forget(&self, key: usize) {
        self.send(MonitorCommand::Forget { key });
    }

    fn send(&self, command: MonitorCommand) {
        if self.commands.send(command).is_err() {
            warn!("Stuck monitor is no longer running");
        }
    }

    /// Stop the coordinator and wait for it to exit
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn coordinate(
    threshold: Duration,
    mut commands: mpsc::UnboundedReceiver<MonitorCommand>,
    signals: mpsc::UnboundedSender<StuckSignal>,
    shutdown: CancellationToken,
) {
    let mut watched: HashMap<usize, Arc<OutputQueue>> = HashMap::new();
    let mut deadlines: BinaryHeap<Reverse<(Instant, usize)>> = BinaryHeap::new();

    loop {
        let next = deadlines.peek().map(|Reverse((deadline, _))| *deadline);

        tokio::select! {
            _ = shutdown.cancelled() => break,
            command = commands.recv() => match command {
                Some(MonitorCommand::Watch { key, output }) => {
                    if let Some(deadline) = output.last_activity().checked_add(threshold) {
                        deadlines.push(Reverse((deadline, key)));
                        watched.insert(key, output);
                    }
                }
                Some(MonitorCommand::Forget { key }) => {
                    watched.remove(&key);
                }
                None => break,
            },
            _ = sleep_until(next) => {
                let now = Instant::now();
                while let Some(&Reverse((deadline, key))) = deadlines.peek() {
                    if deadline > now {
                        break;
                    }
                    deadlines.pop();

                    // Entries for forgotten keys are dropped lazily here.
                    let Some(output) = watched.get(&key) else {
                        continue;
                    };
                    let last = output.last_activity();
                    let idle = now.saturating_duration_since(last);
                    if idle >= threshold {
                        watched.remove(&key);
                        debug!("Handle {} idle for {:.1}s", key, idle.as_secs_f64());
                        if signals.send(StuckSignal { key, idle }).is_err() {
                            return;
                        }
                    } else if let Some(deadline) = last.checked_add(threshold) {
                        deadlines.push(Reverse((deadline, key)));
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
