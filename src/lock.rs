//! Named cross-process resource locks
//!
//! A resource lock serializes access to something shared by every job on a
//! machine (a device, a port range, a build directory). The lock file is
//! created on acquisition and unlinked on release, so a lock file that
//! exists but is not flocked by anyone was left behind by a crashed holder
//! and is removed.
//!
//! After taking the flock we check that the path still names the inode we
//! locked. A releaser (or stale-lock remover) may have unlinked it while we
//! were waiting, in which case we retry against the new file.

use crate::error::{CigateError, CigateResult};
use crate::fslock::{try_lock_exclusive, LockedFile};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default poll interval while the lock is held elsewhere
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default wait before warning about slow acquisition
pub const DEFAULT_WARN_AFTER: Duration = Duration::from_secs(30);

enum Attempt {
    Acquired(LockGuard),
    Held { holder: Option<u32> },
    Retry,
}

/// A named lock file under a lock directory
#[derive(Debug, Clone)]
pub struct ResourceLock {
    name: String,
    path: PathBuf,
    poll_interval: Duration,
    warn_after: Duration,
}

impl ResourceLock {
    /// Lock `<dir>/<name>.lock`
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: dir.join(format!("{}.lock", name)),
            poll_interval: DEFAULT_POLL_INTERVAL,
            warn_after: DEFAULT_WARN_AFTER,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_warn_after(mut self, grace: Duration) -> Self {
        self.warn_after = grace;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the lock, giving up after `timeout` (`None` waits forever)
    /// or when `cancel` fires.
    pub async fn acquire(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> CigateResult<LockGuard> {
        let start = Instant::now();
        let mut warned = false;

        loop {
            match self.attempt()? {
                Attempt::Acquired(guard) => {
                    if warned {
                        info!(
                            "Acquired lock '{}' after {:.1}s",
                            self.name,
                            start.elapsed().as_secs_f64()
                        );
                    } else {
                        debug!("Acquired lock '{}'", self.name);
                    }
                    return Ok(guard);
                }
                Attempt::Retry => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Attempt::Held { holder } => {
                    let waited = start.elapsed();
                    if !warned && waited >= self.warn_after {
                        warned = true;
                        let holder = holder
                            .map(|pid| format!("pid {}", pid))
                            .unwrap_or_else(|| "an unknown process".to_string());
                        warn!(
                            "Still waiting for lock '{}' after {:.0}s; held by {} ({})",
                            self.name,
                            waited.as_secs_f64(),
                            holder,
                            self.path.display()
                        );
                    }
                    if timeout.is_some_and(|t| waited >= t) {
                        return Err(CigateError::LockTimeout {
                            path: self.path.clone(),
                            waited,
                        });
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = cancel.cancelled() => return Err(CigateError::Interrupted),
                    }
                }
            }
        }
    }

    /// Take the lock only if it is free right now
    pub fn try_acquire(&self) -> CigateResult<Option<LockGuard>> {
        loop {
            match self.attempt()? {
                Attempt::Acquired(guard) => return Ok(Some(guard)),
                Attempt::Held { .. } => return Ok(None),
                Attempt::Retry => continue,
            }
        }
    }

    /// Run `body` while holding the lock.
    ///
    /// The lock is released when `body` finishes or when the returned
    /// future is dropped.
    pub async fn with_lock<F, Fut, T>(
        &self,
        timeout: Option<Duration>,
        cancel: &CancellationToken,
        body: F,
    ) -> CigateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CigateResult<T>>,
    {
        let _guard = self.acquire(timeout, cancel).await?;
        body().await
    }

    fn attempt(&self) -> CigateResult<Attempt> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CigateError::DirCreate {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let existed = self.path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.io_error("opening", e))?;

        if !try_lock_exclusive(&file).map_err(|e| self.io_error("locking", e))? {
            return Ok(Attempt::Held {
                holder: holder_pid(&file),
            });
        }

        if !still_linked(&file, &self.path).map_err(|e| self.io_error("checking", e))? {
            debug!("Lock file {} was replaced, retrying", self.path.display());
            return Ok(Attempt::Retry);
        }

        if existed {
            warn!(
                "Removing stale lock file {} (no process holds it)",
                self.path.display()
            );
            remove_lock_file(&self.path);
            return Ok(Attempt::Retry);
        }

        Ok(Attempt::Acquired(LockGuard {
            name: self.name.clone(),
            locked: LockedFile::from_locked(file, self.path.clone()),
        }))
    }

    fn io_error(&self, action: &str, source: io::Error) -> CigateError {
        CigateError::io(
            format!("{} lock file {}", action, self.path.display()),
            source,
        )
    }
}

/// Held resource lock; unlinks the lock file and unlocks on drop
#[derive(Debug)]
pub struct LockGuard {
    name: String,
    locked: LockedFile,
}

impl LockGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        self.locked.path()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Unlink before unlocking so waiters see a fresh file and retry.
        if still_linked(self.locked.file(), self.locked.path()).unwrap_or(false) {
            remove_lock_file(self.locked.path());
        }
        debug!("Released lock '{}'", self.name);
    }
}

fn remove_lock_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove lock file {}: {}", path.display(), e);
        }
    }
}

#[cfg(unix)]
fn still_linked(file: &File, path: &Path) -> io::Result<bool> {
    use crate::fslock::{inode_at_path, inode_of_file};
    Ok(inode_at_path(path)? == Some(inode_of_file(file)?))
}

#[cfg(not(unix))]
fn still_linked(_file: &File, path: &Path) -> io::Result<bool> {
    Ok(path.exists())
}

#[cfg(unix)]
fn holder_pid(file: &File) -> Option<u32> {
    let inode = crate::fslock::inode_of_file(file).ok()?;
    crate::fslock::lock_holder_pid(inode)
}

#[cfg(not(unix))]
fn holder_pid(_file: &File) -> Option<u32> {
    None
}
