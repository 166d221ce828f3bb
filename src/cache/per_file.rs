//! Per-path fingerprint cache
//!
//! Each path is compared on its own: equal mtime means unchanged, otherwise
//! the MD5 of the contents decides. A touched-but-identical file therefore
//! never counts as a change.
//!
//! The committed snapshot describes exactly the last committed path set. A
//! committed path missing from the next request is a change, and commit
//! replaces the snapshot, so its entry is dropped.

use crate::cache::hashing::{md5_file, mtime_secs, path_key};
use crate::cache::store::CacheStore;
use crate::cache::{resolve_pending, ChangeDetector};
use crate::error::CigateResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Stored fingerprint of one path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerFileEntry {
    pub modification_time: f64,
    pub md5_hash: String,
}

/// On-disk layout: absolute path → entry
pub type PerFileSnapshot = BTreeMap<String, PerFileEntry>;

/// How a changed mtime is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashMode {
    /// Hash contents when the mtime differs
    #[default]
    Content,
    /// Trust the mtime alone; directories are accepted
    MtimeOnly,
}

enum Observation {
    Missing,
    Unchanged(PerFileEntry),
    Changed(PerFileEntry),
}

/// Detector keyed per path with mtime + MD5 entries
#[derive(Debug)]
pub struct PerFileCache {
    store: CacheStore<PerFileSnapshot>,
    mode: HashMode,
    pending: Option<PerFileSnapshot>,
}

impl PerFileCache {
    /// Create a detector for `name` in `cache_dir`
    pub fn new(cache_dir: &Path, name: &str) -> Self {
        Self {
            store: CacheStore::new(cache_dir, name),
            mode: HashMode::default(),
            pending: None,
        }
    }

    /// Select content hashing or mtime-only comparison
    pub fn with_mode(mut self, mode: HashMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the cache lock timeout
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store = self.store.with_lock_timeout(timeout);
        self
    }

    /// Check a single path
    pub fn check_file(&mut self, path: &Path) -> CigateResult<bool> {
        self.check_needs_update(&[path.to_path_buf()])
    }

    fn observe(&self, path: &Path, stored: Option<&PerFileEntry>) -> CigateResult<Observation> {
        let Some(mtime) = mtime_secs(path)? else {
            return Ok(Observation::Missing);
        };

        if let Some(prev) = stored {
            if prev.modification_time == mtime {
                return Ok(Observation::Unchanged(prev.clone()));
            }
        }

        let entry = PerFileEntry {
            modification_time: mtime,
            md5_hash: match self.mode {
                HashMode::Content => md5_file(path)?,
                HashMode::MtimeOnly => String::new(),
            },
        };

        match stored {
            Some(prev) if self.mode == HashMode::Content && prev.md5_hash == entry.md5_hash => {
                debug!("{} touched without content change", path.display());
                Ok(Observation::Unchanged(entry))
            }
            _ => Ok(Observation::Changed(entry)),
        }
    }
}

impl ChangeDetector for PerFileCache {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn check_needs_update(&mut self, files: &[PathBuf]) -> CigateResult<bool> {
        let committed = self.store.load()?;
        let mut current = PerFileSnapshot::new();
        let mut changed = !self.store.exists();

        for path in files {
            let key = path_key(path);
            match self.observe(path, committed.get(&key))? {
                Observation::Missing => {
                    debug!("{} is missing", key);
                    changed = true;
                }
                Observation::Unchanged(entry) => {
                    current.insert(key, entry);
                }
                Observation::Changed(entry) => {
                    debug!("{} changed", key);
                    current.insert(key, entry);
                    changed = true;
                }
            }
        }

        if let Some(dropped) = committed.keys().find(|key| !current.contains_key(*key)) {
            debug!("{} left the monitored set of {}", dropped, self.name());
            changed = true;
        }

        self.store.write_pending(&current)?;
        self.pending = Some(current);
        Ok(changed)
    }

    fn commit(&mut self) -> CigateResult<()> {
        let pending = resolve_pending(&self.store, self.pending.take())?;

        self.store.commit_pending(&pending)?;

        info!("Committed {} path(s) to cache {}", pending.len(), self.name());
        Ok(())
    }

    fn invalidate(&mut self) -> CigateResult<()> {
        self.pending = None;
        self.store.remove()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn bump_mtime(path: &Path) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(5))
            .unwrap();
    }

    #[test]
    fn touch_is_not_a_change() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.cpp");
        fs::write(&src, "int a;").unwrap();

        let mut cache = PerFileCache::new(dir.path(), "pf");
        assert!(cache.check_file(&src).unwrap());
        cache.commit().unwrap();

        bump_mtime(&src);
        assert!(!cache.check_file(&src).unwrap());
    }

    #[test]
    fn content_change_detected() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.cpp");
        fs::write(&src, "int a;").unwrap();

        let mut cache = PerFileCache::new(dir.path(), "pf");
        cache.check_file(&src).unwrap();
        cache.commit().unwrap();

        fs::write(&src, "int b;").unwrap();
        bump_mtime(&src);
        assert!(cache.check_file(&src).unwrap());
    }

    #[test]
    fn on_disk_format() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("fmt.h");
        fs::write(&src, "hello").unwrap();

        let mut cache = PerFileCache::new(dir.path(), "format");
        cache.check_file(&src).unwrap();
        cache.commit().unwrap();

        let raw = fs::read_to_string(dir.path().join("format.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let entry = &value[path_key(&src)];
        assert_eq!(entry["md5_hash"], "5d41402abc4b2a76b9719d911017c592");
        assert!(entry["modification_time"].is_f64());
    }

    #[test]
    fn dropping_a_path_is_a_change() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.cpp");
        let b = dir.path().join("b.cpp");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let mut cache = PerFileCache::new(dir.path(), "set");
        cache.check_needs_update(&[a.clone(), b.clone()]).unwrap();
        cache.commit().unwrap();

        // b still exists on disk; it is only no longer monitored.
        assert!(cache.check_needs_update(&[a.clone()]).unwrap());
        cache.commit().unwrap();

        let snapshot = CacheStore::<PerFileSnapshot>::new(dir.path(), "set")
            .load()
            .unwrap();
        assert_eq!(snapshot.keys().collect::<Vec<_>>(), vec![&path_key(&a)]);
        assert!(!cache.check_needs_update(&[a]).unwrap());
    }

    #[test]
    fn empty_set_without_history_is_a_change() {
        let dir = TempDir::new().unwrap();
        let mut cache = PerFileCache::new(dir.path(), "empty");
        assert!(cache.check_needs_update(&[]).unwrap());
        cache.commit().unwrap();
        assert!(!cache.check_needs_update(&[]).unwrap());
    }

    #[test]
    fn directory_needs_mtime_only_mode() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("include");
        fs::create_dir(&sub).unwrap();

        let mut hashing = PerFileCache::new(dir.path(), "dirs");
        assert!(hashing.check_file(&sub).is_err());

        let mut mtime_only = PerFileCache::new(dir.path(), "dirs").with_mode(HashMode::MtimeOnly);
        assert!(mtime_only.check_file(&sub).unwrap());
        mtime_only.commit().unwrap();
        assert!(!mtime_only.check_file(&sub).unwrap());
    }
}
