//! JSON-backed persistence for one named cache
//!
//! Each cache name owns three files in the cache directory:
//!
//! | File | Purpose |
//! |------|---------|
//! | `<name>.json` | committed snapshot |
//! | `<name>.json.pending` | fingerprint observed by the last check, awaiting commit |
//! | `<name>.json.lock` | advisory lock guarding every rewrite of the snapshot |
//!
//! The committed snapshot is only ever replaced whole: read under the lock,
//! compute the next snapshot, write it to a temp file and rename it over
//! the old one before releasing the lock.

use crate::error::{CigateError, CigateResult};
use crate::fslock::LockedFile;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Default bound on waiting for another process's snapshot rewrite
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Persistence for one cache name with snapshot type `T`
#[derive(Debug, Clone)]
pub struct CacheStore<T> {
    name: String,
    path: PathBuf,
    lock_timeout: Option<Duration>,
    _snapshot: PhantomData<fn() -> T>,
}

impl<T> CacheStore<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Create a store for `name` inside `cache_dir`
    pub fn new(cache_dir: &Path, name: &str) -> Self {
        Self {
            name: name.to_string(),
            path: cache_dir.join(format!("{}.json", name)),
            lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
            _snapshot: PhantomData,
        }
    }

    /// Override the lock wait bound (`None` waits forever)
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the committed snapshot
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the pending sidecar
    pub fn pending_path(&self) -> PathBuf {
        sibling(&self.path, "pending")
    }

    /// Path of the advisory lock file
    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, "lock")
    }

    /// Read the committed snapshot without locking.
    ///
    /// Missing or corrupted files read as the empty snapshot.
    pub fn load(&self) -> CigateResult<T> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    /// Whether a committed snapshot exists on disk
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read-modify-write the committed snapshot under the lock
    pub fn update<R>(&self, mutate: impl FnOnce(&mut T) -> R) -> CigateResult<R> {
        let _lock = self.lock()?;
        let mut snapshot: T = read_json(&self.path)?.unwrap_or_default();
        let result = mutate(&mut snapshot);
        write_json_atomic(&self.path, &snapshot)?;
        debug!("Rewrote cache snapshot {}", self.path.display());
        Ok(result)
    }

    /// Replace the committed snapshot under the lock
    pub fn replace(&self, snapshot: &T) -> CigateResult<()> {
        let _lock = self.lock()?;
        write_json_atomic(&self.path, snapshot)
    }

    /// Delete the committed snapshot and any pending sidecar
    pub fn remove(&self) -> CigateResult<()> {
        let _lock = self.lock()?;
        remove_if_exists(&self.path)?;
        remove_if_exists(&self.pending_path())?;
        debug!("Removed cache {}", self.name);
        Ok(())
    }

    /// Persist a pending fingerprint to the sidecar
    pub fn write_pending(&self, pending: &T) -> CigateResult<()> {
        write_json_atomic(&self.pending_path(), pending)
    }

    /// Read the pending sidecar, if present and parseable
    pub fn read_pending(&self) -> CigateResult<Option<T>> {
        read_json(&self.pending_path())
    }

    /// Delete the pending sidecar
    pub fn clear_pending(&self) -> CigateResult<()> {
        remove_if_exists(&self.pending_path())
    }

    /// Promote `pending` to the committed snapshot and drop the sidecar
    pub fn commit_pending(&self, pending: &T) -> CigateResult<()> {
        let _lock = self.lock()?;
        write_json_atomic(&self.path, pending)?;
        remove_if_exists(&self.pending_path())
    }

    fn lock(&self) -> CigateResult<LockedFile> {
        LockedFile::acquire_blocking(&self.lock_path(), self.lock_timeout)
    }
}

/// `<file>.<suffix>` next to `path`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Read and parse a JSON file; missing → `None`, corrupted → `None` with a warning
fn read_json<T: DeserializeOwned>(path: &Path) -> CigateResult<Option<T>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            warn!("Cache file {} is not valid UTF-8, ignoring", path.display());
            return Ok(None);
        }
        Err(e) => {
            return Err(CigateError::io(
                format!("reading cache file {}", path.display()),
                e,
            ))
        }
    };

    match serde_json::from_str(&content) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            warn!("Cache file {} is corrupted ({}), treating as miss", path.display(), e);
            Ok(None)
        }
    }
}

/// Serialize `value` to a temp file and rename it over `path`
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> CigateResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| CigateError::DirCreate {
            path: parent.to_path_buf(),
            source: e,
        })?;
    }

    let content = serde_json::to_string_pretty(value)?;
    let tmp = sibling(path, &format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, content)
        .map_err(|e| CigateError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CigateError::io(format!("replacing {}", path.display()), e)
    })
}

fn remove_if_exists(path: &Path) -> CigateResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CigateError::io(format!("removing {}", path.display()), e)),
    }
}
