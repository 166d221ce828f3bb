//! Change detection over monitored files
//!
//! A detector answers "did these inputs change since the last successful
//! run?" and remembers the answer's fingerprint until the caller confirms
//! the guarded work succeeded.
//!
//! # Commit Protocol
//!
//! 1. `check_needs_update` snapshots the files and writes the snapshot to
//!    `<cache>.json.pending` before any build work starts, so outputs the
//!    build generates later cannot leak into the fingerprint.
//! 2. The caller runs its work.
//! 3. `commit` promotes the pending snapshot, possibly from another process.
//!
//! # Strategies
//!
//! | Strategy | Unit | Hashing | Touch-optimized |
//! |----------|------|---------|-----------------|
//! | `per-file` | path | MD5 on mtime mismatch | implicit |
//! | `batch` | file set | SHA-256 on mtime mismatch | explicit, persisted immediately |
//! | `aggregate` | file set | SHA-256 of everything, every call | no |

pub mod aggregate;
pub mod batch;
pub mod hashing;
pub mod per_file;
pub mod store;

pub use aggregate::{AggregateHashCache, AggregateRecord, FingerprintStatus};
pub use batch::{BatchEntry, BatchSnapshot, BatchTwoLayerCache};
pub use per_file::{HashMode, PerFileCache, PerFileEntry};
pub use store::CacheStore;

use crate::error::{CigateError, CigateResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Shared contract of all fingerprint caches
pub trait ChangeDetector: Send {
    /// Cache name this detector persists under
    fn name(&self) -> &str;

    /// Fingerprint `files`, store the result as pending, and report whether
    /// it differs from the last committed successful fingerprint
    fn check_needs_update(&mut self, files: &[PathBuf]) -> CigateResult<bool>;

    /// Persist the pending fingerprint as the committed state
    fn commit(&mut self) -> CigateResult<()>;

    /// Drop committed state so the next check reports a change
    fn invalidate(&mut self) -> CigateResult<()>;
}

/// Which detector implementation backs a cache name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CacheStrategy {
    /// Per-path mtime + MD5
    PerFile,
    /// File-set mtime fast path with SHA-256 verification
    #[default]
    Batch,
    /// One SHA-256 over the whole file set
    Aggregate,
}

impl CacheStrategy {
    /// Open a detector of this strategy for `name` in `cache_dir`
    pub fn open(
        self,
        cache_dir: &Path,
        name: &str,
        lock_timeout: Option<Duration>,
    ) -> Box<dyn ChangeDetector> {
        match self {
            Self::PerFile => Box::new(PerFileCache::new(cache_dir, name).with_lock_timeout(lock_timeout)),
            Self::Batch => {
                Box::new(BatchTwoLayerCache::new(cache_dir, name).with_lock_timeout(lock_timeout))
            }
            Self::Aggregate => {
                Box::new(AggregateHashCache::new(cache_dir, name).with_lock_timeout(lock_timeout))
            }
        }
    }
}

impl fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PerFile => "per-file",
            Self::Batch => "batch",
            Self::Aggregate => "aggregate",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for CacheStrategy {
    type Err = CigateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "per-file" | "per_file" | "perfile" => Ok(Self::PerFile),
            "batch" => Ok(Self::Batch),
            "aggregate" => Ok(Self::Aggregate),
            other => Err(CigateError::UnknownStrategy(other.to_string())),
        }
    }
}

/// Resolve the pending fingerprint for a commit.
///
/// The sidecar wins when present; the in-memory copy covers the case where
/// another process already consumed the sidecar.
pub(crate) fn resolve_pending<T>(
    store: &CacheStore<T>,
    in_memory: Option<T>,
) -> CigateResult<T>
where
    T: Serialize + serde::de::DeserializeOwned + Default,
{
    if let Some(pending) = store.read_pending()? {
        return Ok(pending);
    }
    in_memory.ok_or_else(|| CigateError::NoPendingFingerprint {
        cache: store.name().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::{Arc, Barrier};
    use tempfile::TempDir;

    #[test]
    fn strategy_parse_and_display() {
        assert_eq!("per-file".parse::<CacheStrategy>().unwrap(), CacheStrategy::PerFile);
        assert_eq!("aggregate".parse::<CacheStrategy>().unwrap(), CacheStrategy::Aggregate);
        assert_eq!(CacheStrategy::Batch.to_string(), "batch");
        assert!("bogus".parse::<CacheStrategy>().is_err());
    }

    #[test]
    fn every_strategy_reports_first_check_then_settles() {
        for strategy in [
            CacheStrategy::PerFile,
            CacheStrategy::Batch,
            CacheStrategy::Aggregate,
        ] {
            let dir = TempDir::new().unwrap();
            let src = dir.path().join("main.cpp");
            fs::write(&src, "int main() {}").unwrap();
            let files = vec![src];

            let mut detector = strategy.open(&dir.path().join("cache"), "idem", None);
            assert!(detector.check_needs_update(&files).unwrap(), "{strategy}");
            detector.commit().unwrap();
            assert!(!detector.check_needs_update(&files).unwrap(), "{strategy}");
        }
    }

    #[test]
    fn every_strategy_survives_crash_before_commit() {
        for strategy in [
            CacheStrategy::PerFile,
            CacheStrategy::Batch,
            CacheStrategy::Aggregate,
        ] {
            let dir = TempDir::new().unwrap();
            let cache_dir = dir.path().join("cache");
            let src = dir.path().join("lib.h");
            fs::write(&src, "#pragma once").unwrap();
            let files = vec![src];

            let mut first = strategy.open(&cache_dir, "crash", None);
            assert!(first.check_needs_update(&files).unwrap());
            drop(first);

            let mut fresh = strategy.open(&cache_dir, "crash", None);
            assert!(fresh.check_needs_update(&files).unwrap(), "{strategy}");
        }
    }

    #[test]
    fn every_strategy_rejects_commit_without_check() {
        for strategy in [
            CacheStrategy::PerFile,
            CacheStrategy::Batch,
            CacheStrategy::Aggregate,
        ] {
            let dir = TempDir::new().unwrap();
            let mut detector = strategy.open(dir.path(), "nocheck", None);
            let err = detector.commit().unwrap_err();
            assert!(matches!(err, CigateError::NoPendingFingerprint { .. }));
        }
    }

    #[test]
    fn every_strategy_detects_deletion() {
        for strategy in [
            CacheStrategy::PerFile,
            CacheStrategy::Batch,
            CacheStrategy::Aggregate,
        ] {
            let dir = TempDir::new().unwrap();
            let src = dir.path().join("gone.cpp");
            fs::write(&src, "x").unwrap();
            let files = vec![src.clone()];

            let mut detector = strategy.open(&dir.path().join("cache"), "del", None);
            detector.check_needs_update(&files).unwrap();
            detector.commit().unwrap();

            fs::remove_file(&src).unwrap();
            assert!(detector.check_needs_update(&files).unwrap(), "{strategy}");
        }
    }

    #[test]
    fn invalidate_forces_change() {
        for strategy in [
            CacheStrategy::PerFile,
            CacheStrategy::Batch,
            CacheStrategy::Aggregate,
        ] {
            let dir = TempDir::new().unwrap();
            let src = dir.path().join("a.cpp");
            fs::write(&src, "a").unwrap();
            let files = vec![src];

            let mut detector = strategy.open(&dir.path().join("cache"), "inv", None);
            detector.check_needs_update(&files).unwrap();
            detector.commit().unwrap();
            detector.invalidate().unwrap();
            assert!(detector.check_needs_update(&files).unwrap(), "{strategy}");
        }
    }

    #[test]
    fn every_strategy_settles_after_concurrent_commits() {
        const INSTANCES: usize = 6;

        for strategy in [
            CacheStrategy::PerFile,
            CacheStrategy::Batch,
            CacheStrategy::Aggregate,
        ] {
            let dir = TempDir::new().unwrap();
            let files: Vec<PathBuf> = (0..4)
                .map(|i| {
                    let p = dir.path().join(format!("unit{}.cpp", i));
                    fs::write(&p, format!("int u{};", i)).unwrap();
                    p
                })
                .collect();
            let cache_dir = dir.path().join("cache");

            let barrier = Arc::new(Barrier::new(INSTANCES));
            let handles: Vec<_> = (0..INSTANCES)
                .map(|_| {
                    let files = files.clone();
                    let cache_dir = cache_dir.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let mut detector = strategy.open(&cache_dir, "shared", None);
                        let changed = detector.check_needs_update(&files).unwrap();
                        barrier.wait();
                        detector.commit().unwrap();
                        changed
                    })
                })
                .collect();

            let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(results.iter().all(|changed| *changed), "{strategy}");

            let raw = fs::read_to_string(cache_dir.join("shared.json")).unwrap();
            assert!(serde_json::from_str::<serde_json::Value>(&raw).is_ok(), "{strategy}");
            assert!(!cache_dir.join("shared.json.pending").exists(), "{strategy}");

            let mut fresh = strategy.open(&cache_dir, "shared", None);
            assert!(!fresh.check_needs_update(&files).unwrap(), "{strategy}");
        }
    }
}
