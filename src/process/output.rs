//! Line queue between a reader task and its consumers

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct QueueInner {
    pending: VecDeque<String>,
    history: Vec<String>,
    closed: bool,
    last_activity: Instant,
}

/// Thread-safe FIFO of output lines with a sticky end-of-stream marker.
///
/// End-of-stream is a flag, not a queue element: checking it never
/// consumes it, so `has_more` can be asked any number of times.
#[derive(Debug)]
pub struct OutputQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl OutputQueue {
    /// Create an open, empty queue
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                history: Vec::new(),
                closed: false,
                last_activity: Instant::now(),
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a line (ignored once closed)
    pub fn push(&self, line: String) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            inner.history.push(line.clone());
            inner.pending.push_back(line);
            inner.last_activity = Instant::now();
        }
        self.notify.notify_waiters();
    }

    /// Mark end-of-stream. Only the first call has an effect.
    pub fn close(&self) -> bool {
        let first = {
            let mut inner = self.lock();
            !std::mem::replace(&mut inner.closed, true)
        };
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    /// Whether end-of-stream was reached
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// More lines are queued or may still arrive
    pub fn has_more(&self) -> bool {
        let inner = self.lock();
        !inner.pending.is_empty() || !inner.closed
    }

    /// Pop a queued line without waiting
    pub fn try_next(&self) -> Option<String> {
        self.lock().pending.pop_front()
    }

    /// Pop every queued line without waiting
    pub fn drain(&self) -> Vec<String> {
        self.lock().pending.drain(..).collect()
    }

    /// Wait for the next line.
    ///
    /// Returns `None` at end-of-stream or when `timeout` elapses first;
    /// `None` for `timeout` waits until one of those happens.
    pub async fn next(&self, timeout: Option<Duration>) -> Option<String> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.lock();
                if let Some(line) = inner.pending.pop_front() {
                    return Some(line);
                }
                if inner.closed {
                    return None;
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Every line ever pushed, in order
    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }

    /// The last `n` lines pushed
    pub fn tail(&self, n: usize) -> Vec<String> {
        let inner = self.lock();
        let start = inner.history.len().saturating_sub(n);
        inner.history[start..].to_vec()
    }

    /// Number of lines pushed so far
    pub fn line_count(&self) -> usize {
        self.lock().history.len()
    }

    /// When the last line arrived (queue creation if none yet)
    pub fn last_activity(&self) -> Instant {
        self.lock().last_activity
    }
}

impl Default for OutputQueue {
    fn default() -> Self {
        Self::new()
    }
}
