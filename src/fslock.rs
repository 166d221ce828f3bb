//! Advisory file locking via `flock(2)`
//!
//! Shared by the cache store (guarding full-snapshot rewrites) and the
//! build lock. Locks are per open file description, so two handles opened
//! in the same process exclude each other just like two processes do.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{CigateError, CigateResult};

/// Interval between non-blocking lock attempts
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Try to take an exclusive flock without blocking.
///
/// Returns `Ok(false)` when another open file description holds the lock.
pub fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        // SAFETY: flock only reads the descriptor, which `file` keeps open
        // for the duration of the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Ok(false);
        }
        Err(err)
    }

    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

/// Release a flock held on `file`. Closing the file also releases it.
pub fn unlock(file: &File) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        // SAFETY: see `try_lock_exclusive`.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(unix))]
    let _ = file;

    Ok(())
}

/// Guard over an exclusively locked file; unlocks on drop.
#[derive(Debug)]
pub struct LockedFile {
    file: File,
    path: PathBuf,
}

impl LockedFile {
    /// Open (creating if needed) `path` and poll for an exclusive lock,
    /// giving up after `timeout`. `None` waits forever.
    pub fn acquire_blocking(path: &Path, timeout: Option<Duration>) -> CigateResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CigateError::DirCreate {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| CigateError::io(format!("opening lock file {}", path.display()), e))?;

        let start = Instant::now();
        loop {
            let acquired = try_lock_exclusive(&file)
                .map_err(|e| CigateError::io(format!("locking {}", path.display()), e))?;
            if acquired {
                debug!("Locked {}", path.display());
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            let waited = start.elapsed();
            if timeout.is_some_and(|t| waited >= t) {
                return Err(CigateError::LockTimeout {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    /// Wrap a file whose lock the caller already holds
    pub(crate) fn from_locked(file: File, path: PathBuf) -> Self {
        Self { file, path }
    }

    /// The underlying file
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockedFile {
    fn drop(&mut self) {
        if let Err(e) = unlock(&self.file) {
            warn!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Inode of an open file, used to detect a lock file replaced underneath us
#[cfg(unix)]
pub fn inode_of_file(file: &File) -> io::Result<u64> {
    use std::os::unix::fs::MetadataExt;
    Ok(file.metadata()?.ino())
}

/// Inode currently linked at `path`, if any
#[cfg(unix)]
pub fn inode_at_path(path: &Path) -> io::Result<Option<u64>> {
    use std::os::unix::fs::MetadataExt;
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.ino())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Find the PID holding a flock on `inode` by scanning the kernel lock table.
///
/// Only available on Linux; returns `None` elsewhere or when no holder is listed.
pub fn lock_holder_pid(inode: u64) -> Option<u32> {
    let table = std::fs::read_to_string("/proc/locks").ok()?;
    parse_lock_holder(&table, inode)
}

/// Parse `/proc/locks` lines of the form
/// `1: FLOCK  ADVISORY  WRITE 4242 08:01:131090 0 EOF`
fn parse_lock_holder(table: &str, inode: u64) -> Option<u32> {
    table.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // Blocked waiters are listed with a "->" marker and shift the columns
        let fields: Vec<&str> = fields.into_iter().filter(|f| *f != "->").collect();
        if fields.len() < 6 || fields[1] != "FLOCK" {
            return None;
        }
        let ino: u64 = fields[5].rsplit(':').next()?.parse().ok()?;
        if ino != inode {
            return None;
        }
        fields[4].parse().ok()
    })
}
