//! Multi-process scheduling with failure budget and timeouts

use crate::error::{CigateError, CigateResult};
use crate::process::diagnostics::StackTraceCapture;
use crate::process::handle::{ProcessHandle, ProcessOptions, DEFAULT_POLL_INTERVAL};
use crate::process::monitor::{StuckMonitor, StuckSignal};
use crate::process::registry::ProcessRegistry;
use crate::process::{
    FailureReason, FailureRecord, GroupMode, GroupResult, HandleOutcome, HandleState, JobReport,
    WorkItem,
};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code recorded for items that could not be started
const SPAWN_FAILED_CODE: i32 = 127;

/// Scheduling and failure policy for a group
#[derive(Clone)]
pub struct GroupOptions {
    pub mode: GroupMode,
    /// Failures (of any kind) that abort the group; at least 1
    pub failure_threshold: usize,
    /// Kill a handle after this long without output
    pub stuck_threshold: Option<Duration>,
    /// Wall-clock limit for the whole group
    pub global_timeout: Option<Duration>,
    /// Per-process limit for items without their own
    pub default_timeout: Option<Duration>,
    pub poll_interval: Duration,
    /// Output lines kept in each failure record
    pub snippet_lines: usize,
    pub stack_capture: Option<Arc<dyn StackTraceCapture>>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            mode: GroupMode::Parallel,
            failure_threshold: 1,
            stuck_threshold: None,
            global_timeout: None,
            default_timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            snippet_lines: 20,
            stack_capture: None,
        }
    }
}

impl fmt::Debug for GroupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupOptions")
            .field("mode", &self.mode)
            .field("failure_threshold", &self.failure_threshold)
            .field("stuck_threshold", &self.stuck_threshold)
            .field("global_timeout", &self.global_timeout)
            .field("default_timeout", &self.default_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("snippet_lines", &self.snippet_lines)
            .finish_non_exhaustive()
    }
}

/// Point-in-time counts for a live status display
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStatusSnapshot {
    pub total: usize,
    pub pending: usize,
    pub running: Vec<String>,
    pub passed: usize,
    pub failed: usize,
}

/// Shared per-handle state of a running group
#[derive(Debug, Clone, Default)]
pub struct GroupStatus {
    states: Arc<Mutex<Vec<(String, HandleState)>>>,
}

impl GroupStatus {
    fn new(items: &[WorkItem]) -> Self {
        let states = items
            .iter()
            .map(|item| (item.id.clone(), HandleState::Pending))
            .collect();
        Self {
            states: Arc::new(Mutex::new(states)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, HandleState)>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move item `index` to `state`. A finished item never changes again.
    fn transition(&self, index: usize, state: HandleState) -> bool {
        let mut states = self.lock();
        match states.get_mut(index) {
            Some((_, HandleState::Finished(_))) | None => false,
            Some((_, current)) => {
                *current = state;
                true
            }
        }
    }

    /// Current state of item `index`
    pub fn state(&self, index: usize) -> Option<HandleState> {
        self.lock().get(index).map(|(_, state)| *state)
    }

    /// Aggregate counts
    pub fn snapshot(&self) -> GroupStatusSnapshot {
        let states = self.lock();
        let mut snapshot = GroupStatusSnapshot {
            total: states.len(),
            ..GroupStatusSnapshot::default()
        };
        for (id, state) in states.iter() {
            match state {
                HandleState::Pending => snapshot.pending += 1,
                HandleState::Running => snapshot.running.push(id.clone()),
                HandleState::Finished(outcome) if outcome.is_success() => snapshot.passed += 1,
                HandleState::Finished(_) => snapshot.failed += 1,
            }
        }
        snapshot
    }
}

struct Running {
    index: usize,
    handle: ProcessHandle,
}

#[derive(Default)]
struct Tally {
    reports: Vec<JobReport>,
    failures: Vec<FailureRecord>,
}

/// A named batch of work items run under one policy
pub struct ProcessGroup {
    name: String,
    items: Vec<WorkItem>,
    options: GroupOptions,
    registry: ProcessRegistry,
    cancel: CancellationToken,
    status: GroupStatus,
}

impl ProcessGroup {
    /// Build a group; item ids must be unique
    pub fn new(
        name: impl Into<String>,
        items: Vec<WorkItem>,
        options: GroupOptions,
        registry: ProcessRegistry,
        cancel: CancellationToken,
    ) -> CigateResult<Self> {
        let mut seen = HashSet::new();
        for item in &items {
            if !seen.insert(item.id.as_str()) {
                return Err(CigateError::DuplicateJob(item.id.clone()));
            }
        }

        let status = GroupStatus::new(&items);
        Ok(Self {
            name: name.into(),
            items,
            options,
            registry,
            cancel,
            status,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared status for progress display
    pub fn status(&self) -> GroupStatus {
        self.status.clone()
    }

    /// Run every item according to the group's mode.
    ///
    /// Failures below the threshold come back inside the [`GroupResult`].
    /// Reaching the threshold yields `GroupAborted`; running out of global
    /// time yields `GlobalTimeout`. Both carry every failure record.
    pub async fn run(self) -> CigateResult<GroupResult> {
        let started = Instant::now();
        let deadline = self
            .options
            .global_timeout
            .and_then(|t| started.checked_add(t));
        let mut tally = Tally::default();

        info!(
            "Running group '{}' ({} item(s), {} mode)",
            self.name,
            self.items.len(),
            self.options.mode
        );

        match self.options.mode {
            GroupMode::Parallel => {
                let indices: Vec<usize> = (0..self.items.len()).collect();
                let threshold = self.options.failure_threshold.max(1);
                self.run_batch(&indices, threshold, deadline, &mut tally)
                    .await?;
            }
            GroupMode::Sequential => {
                for index in 0..self.items.len() {
                    self.run_batch(&[index], 1, deadline, &mut tally).await?;
                }
            }
            GroupMode::Dependency => self.run_by_dependency(deadline, &mut tally).await?,
        }

        let result = GroupResult {
            name: self.name.clone(),
            reports: tally.reports,
            failures: tally.failures,
            duration: started.elapsed(),
        };
        info!(
            "Group '{}' finished: {} passed, {} failed in {:.1}s",
            self.name,
            result.passed(),
            result.failed(),
            result.duration.as_secs_f64()
        );
        Ok(result)
    }

    async fn run_by_dependency(
        &self,
        deadline: Option<Instant>,
        tally: &mut Tally,
    ) -> CigateResult<()> {
        let mut remaining: Vec<usize> = (0..self.items.len()).collect();
        let mut succeeded: HashSet<&str> = HashSet::new();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|&index| {
                self.items[index]
                    .depends_on
                    .iter()
                    .all(|dep| succeeded.contains(dep.as_str()))
            });
            let Some(position) = ready else {
                return Err(CigateError::DependencyDeadlock {
                    group: self.name.clone(),
                    remaining: remaining
                        .iter()
                        .map(|&index| self.items[index].id.clone())
                        .collect(),
                });
            };

            let index = remaining.remove(position);
            self.run_batch(&[index], 1, deadline, tally).await?;
            succeeded.insert(self.items[index].id.as_str());
        }
        Ok(())
    }

    /// Start `indices` together and drive them to completion.
    ///
    /// Whatever is still running when this returns an error is killed and
    /// recorded as aborted.
    async fn run_batch(
        &self,
        indices: &[usize],
        threshold: usize,
        deadline: Option<Instant>,
        tally: &mut Tally,
    ) -> CigateResult<()> {
        let (monitor, mut signals) = match self.options.stuck_threshold {
            Some(limit) => {
                let (monitor, signals) = StuckMonitor::spawn(limit, &self.cancel);
                (Some(monitor), Some(signals))
            }
            None => (None, None),
        };

        let mut active = Vec::with_capacity(indices.len());
        for &index in indices {
            match self.spawn(index) {
                Ok(handle) => {
                    if let Some(monitor) = &monitor {
                        monitor.watch(index, Arc::clone(handle.output()));
                    }
                    self.status.transition(index, HandleState::Running);
                    active.push(Running { index, handle });
                }
                Err(e @ (CigateError::SpawnFailed { .. } | CigateError::EmptyCommand(_))) => {
                    warn!("Could not start '{}': {}", self.items[index].id, e);
                    self.record_spawn_failure(index, e.to_string(), tally);
                }
                Err(e) => return Err(e),
            }
        }

        let result = self
            .drive(
                &mut active,
                monitor.as_ref(),
                signals.as_mut(),
                threshold,
                deadline,
                tally,
            )
            .await;

        self.abort_remaining(&mut active, tally).await;
        if let Some(monitor) = monitor {
            monitor.shutdown().await;
        }
        result
    }

    /// Control loop: one scan per poll interval until nothing is active
    async fn drive(
        &self,
        active: &mut Vec<Running>,
        monitor: Option<&StuckMonitor>,
        mut signals: Option<&mut mpsc::UnboundedReceiver<StuckSignal>>,
        threshold: usize,
        deadline: Option<Instant>,
        tally: &mut Tally,
    ) -> CigateResult<()> {
        loop {
            if tally.failures.len() >= threshold {
                warn!(
                    "Group '{}' reached {} failure(s), aborting",
                    self.name,
                    tally.failures.len()
                );
                return Err(CigateError::GroupAborted {
                    group: self.name.clone(),
                    failures: tally.failures.clone(),
                });
            }
            if active.is_empty() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(CigateError::Interrupted);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(self.global_timeout(active, tally).await);
            }

            if let Some(signals) = signals.as_deref_mut() {
                while let Ok(signal) = signals.try_recv() {
                    self.handle_stuck(active, signal, tally).await?;
                }
            }

            let mut i = 0;
            while i < active.len() {
                self.forward_output(&active[i]);
                if active[i].handle.is_running() {
                    i += 1;
                    continue;
                }
                let run = active.remove(i);
                if let Some(monitor) = monitor {
                    monitor.forget(run.index);
                }
                self.complete(run, tally)?;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                _ = self.cancel.cancelled() => {}
            }
        }
    }

    async fn handle_stuck(
        &self,
        active: &mut Vec<Running>,
        signal: StuckSignal,
        tally: &mut Tally,
    ) -> CigateResult<()> {
        let Some(position) = active.iter().position(|run| run.index == signal.key) else {
            return Ok(());
        };
        let run = active.remove(position);

        if !run.handle.is_running() {
            return self.complete(run, tally);
        }

        warn!(
            "'{}' produced no output for {:.1}s, killing",
            self.items[run.index].id,
            signal.idle.as_secs_f64()
        );
        run.handle.kill().await;
        self.forward_output(&run);
        self.record(
            &run,
            HandleOutcome::KilledStuck,
            Some(FailureReason::Stuck { idle: signal.idle }),
            tally,
        );
        Ok(())
    }

    async fn global_timeout(&self, active: &mut Vec<Running>, tally: &mut Tally) -> CigateError {
        let timeout = self.options.global_timeout.unwrap_or_default();
        warn!(
            "Group '{}' exceeded its global timeout of {:.1}s; live processes:\n{}",
            self.name,
            timeout.as_secs_f64(),
            self.registry.dump()
        );

        join_all(active.iter().map(|run| run.handle.kill())).await;
        for run in active.drain(..) {
            self.forward_output(&run);
            self.record(
                &run,
                HandleOutcome::KilledGlobalTimeout,
                Some(FailureReason::GlobalTimeout),
                tally,
            );
        }

        CigateError::GlobalTimeout {
            group: self.name.clone(),
            timeout,
            failures: tally.failures.clone(),
        }
    }

    async fn abort_remaining(&self, active: &mut Vec<Running>, tally: &mut Tally) {
        if active.is_empty() {
            return;
        }
        debug!("Killing {} remaining process(es)", active.len());
        join_all(active.iter().map(|run| run.handle.kill())).await;
        for run in active.drain(..) {
            self.record(&run, HandleOutcome::Aborted, None, tally);
        }
    }

    /// Record a handle that exited on its own
    fn complete(&self, run: Running, tally: &mut Tally) -> CigateResult<()> {
        let Some(result) = run.handle.exit_result() else {
            return Err(CigateError::Internal(format!(
                "'{}' completed without an exit status",
                self.items[run.index].id
            )));
        };
        self.forward_output(&run);

        match result {
            Ok(0) => self.record(&run, HandleOutcome::Completed(0), None, tally),
            Ok(code) => self.record(
                &run,
                HandleOutcome::Completed(code),
                Some(FailureReason::NonZeroExit(code)),
                tally,
            ),
            Err(CigateError::ProcessTimeout { timeout, .. }) => self.record(
                &run,
                HandleOutcome::KilledTimeout,
                Some(FailureReason::Timeout(timeout)),
                tally,
            ),
            Err(e) => {
                self.record(&run, HandleOutcome::Aborted, None, tally);
                return Err(e);
            }
        }
        Ok(())
    }

    fn record(
        &self,
        run: &Running,
        outcome: HandleOutcome,
        failure: Option<FailureReason>,
        tally: &mut Tally,
    ) {
        if !self
            .status
            .transition(run.index, HandleState::Finished(outcome))
        {
            return;
        }

        let item = &self.items[run.index];
        let duration = run.handle.duration();
        debug!(
            "'{}' finished as {:?} after {:.1}s",
            item.id,
            outcome,
            duration.as_secs_f64()
        );

        tally.reports.push(JobReport {
            id: item.id.clone(),
            outcome,
            exit_code: run.handle.exit_code(),
            output: run.handle.output_lines(),
            duration,
        });
        if let Some(reason) = failure {
            tally.failures.push(FailureRecord {
                id: item.id.clone(),
                command: item.display_command(),
                reason,
                snippet: run.handle.output().tail(self.options.snippet_lines),
                stack_trace: run.handle.stack_trace(),
                duration,
            });
        }
    }

    fn record_spawn_failure(&self, index: usize, message: String, tally: &mut Tally) {
        let outcome = HandleOutcome::Completed(SPAWN_FAILED_CODE);
        if !self.status.transition(index, HandleState::Finished(outcome)) {
            return;
        }
        let item = &self.items[index];
        tally.reports.push(JobReport {
            id: item.id.clone(),
            outcome,
            exit_code: Some(SPAWN_FAILED_CODE),
            output: Vec::new(),
            duration: Duration::ZERO,
        });
        tally.failures.push(FailureRecord {
            id: item.id.clone(),
            command: item.display_command(),
            reason: FailureReason::SpawnFailed(message),
            snippet: Vec::new(),
            stack_trace: None,
            duration: Duration::ZERO,
        });
    }

    fn spawn(&self, index: usize) -> CigateResult<ProcessHandle> {
        let item = &self.items[index];
        let options = ProcessOptions {
            cwd: item.cwd.clone(),
            timeout: item.timeout.or(self.options.default_timeout),
            poll_interval: self.options.poll_interval,
            stack_capture: self.options.stack_capture.clone(),
        };
        if item.command.is_empty() {
            return Err(CigateError::EmptyCommand(item.id.clone()));
        }
        ProcessHandle::spawn(item.command.clone(), options, &self.registry, &self.cancel)
    }

    fn forward_output(&self, run: &Running) {
        let id = &self.items[run.index].id;
        for line in run.handle.output().drain() {
            debug!(job = %id, "{}", line);
        }
    }
}
