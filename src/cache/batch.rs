//! Two-layer cache over a file set
//!
//! Layer one compares mtimes for every file; layer two hashes only the
//! files whose mtime moved. When the hash still matches, the stored mtime
//! is refreshed immediately so the next run takes the fast path again.

use crate::cache::hashing::{mtime_secs, path_key, sha256_file};
use crate::cache::store::CacheStore;
use crate::cache::{resolve_pending, ChangeDetector};
use crate::error::CigateResult;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Stored fingerprint of one file in the set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub mtime: f64,
    pub hash: String,
}

/// On-disk layout: `{"files": {path: entry}}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    #[serde(default)]
    pub files: BTreeMap<String, BatchEntry>,
}

/// File-set detector with mtime fast path and hash verification
#[derive(Debug)]
pub struct BatchTwoLayerCache {
    store: CacheStore<BatchSnapshot>,
    pending: Option<BatchSnapshot>,
}

impl BatchTwoLayerCache {
    /// Create a detector for `name` in `cache_dir`
    pub fn new(cache_dir: &Path, name: &str) -> Self {
        Self {
            store: CacheStore::new(cache_dir, name),
            pending: None,
        }
    }

    /// Override the cache lock timeout
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store = self.store.with_lock_timeout(timeout);
        self
    }

    /// Write refreshed mtimes for touched files into the committed snapshot.
    ///
    /// An entry is only refreshed if its hash is still the one we verified
    /// against; a concurrent commit may have replaced it meanwhile.
    fn refresh_touched(&self, touched: &[(String, BatchEntry)]) -> CigateResult<()> {
        let refreshed = self.store.update(|snapshot| {
            let mut refreshed = 0;
            for (key, entry) in touched {
                if let Some(stored) = snapshot.files.get_mut(key) {
                    if stored.hash == entry.hash {
                        stored.mtime = entry.mtime;
                        refreshed += 1;
                    }
                }
            }
            refreshed
        })?;
        debug!("Refreshed mtime of {} touched file(s) in {}", refreshed, self.name());
        Ok(())
    }
}

impl ChangeDetector for BatchTwoLayerCache {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn check_needs_update(&mut self, files: &[PathBuf]) -> CigateResult<bool> {
        let committed = self.store.load()?;
        let mut current = BatchSnapshot::default();
        let mut touched = Vec::new();
        let mut changed = !self.store.exists();

        for path in files {
            let key = path_key(path);
            let Some(mtime) = mtime_secs(path)? else {
                debug!("{} is missing", key);
                changed = true;
                continue;
            };

            let entry = match committed.files.get(&key) {
                Some(stored) if stored.mtime == mtime => stored.clone(),
                Some(stored) => {
                    let entry = BatchEntry {
                        mtime,
                        hash: sha256_file(path)?,
                    };
                    if entry.hash == stored.hash {
                        touched.push((key.clone(), entry.clone()));
                    } else {
                        debug!("{} changed", key);
                        changed = true;
                    }
                    entry
                }
                None => {
                    debug!("{} is new", key);
                    changed = true;
                    BatchEntry {
                        mtime,
                        hash: sha256_file(path)?,
                    }
                }
            };
            current.files.insert(key, entry);
        }

        if committed
            .files
            .keys()
            .any(|key| !current.files.contains_key(key))
        {
            debug!("Monitored set of {} shrank", self.name());
            changed = true;
        }

        if !touched.is_empty() {
            self.refresh_touched(&touched)?;
        }

        self.store.write_pending(&current)?;
        self.pending = Some(current);
        Ok(changed)
    }

    fn commit(&mut self) -> CigateResult<()> {
        let pending = resolve_pending(&self.store, self.pending.take())?;
        self.store.commit_pending(&pending)?;
        info!("Committed {} file(s) to cache {}", pending.files.len(), self.name());
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
    use std::sync::{Arc, Barrier};
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn set_mtime(path: &Path, offset_secs: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(offset_secs))
            .unwrap();
    }

    fn stored(dir: &Path, name: &str) -> BatchSnapshot {
        CacheStore::<BatchSnapshot>::new(dir, name).load().unwrap()
    }

    #[test]
    fn three_file_scenario() {
        let dir = TempDir::new().unwrap();
        let cache_dir = dir.path().join("cache");
        let files: Vec<PathBuf> = (1..=3)
            .map(|i| {
                let p = dir.path().join(format!("file{}.cpp", i));
                fs::write(&p, format!("content {}", i)).unwrap();
                p
            })
            .collect();

        let mut cache = BatchTwoLayerCache::new(&cache_dir, "scenario");

        // (1) first sight
        assert!(cache.check_needs_update(&files).unwrap());
        cache.commit().unwrap();
        let before = stored(&cache_dir, "scenario");

        // (2) touch everything, contents untouched
        for f in &files {
            set_mtime(f, 10);
        }
        assert!(!cache.check_needs_update(&files).unwrap());
        let after = stored(&cache_dir, "scenario");
        for f in &files {
            let key = path_key(f);
            assert_ne!(before.files[&key].mtime, after.files[&key].mtime);
            assert_eq!(before.files[&key].hash, after.files[&key].hash);
        }

        // (3) rewrite file #2
        fs::write(&files[1], "different").unwrap();
        set_mtime(&files[1], 20);
        assert!(cache.check_needs_update(&files).unwrap());
        cache.commit().unwrap();

        // (4) delete file #1
        fs::remove_file(&files[0]).unwrap();
        assert!(cache.check_needs_update(&files).unwrap());
    }

    #[test]
    fn removing_path_from_set_is_a_change() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.h");
        let b = dir.path().join("b.h");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();

        let mut cache = BatchTwoLayerCache::new(dir.path(), "shrink");
        cache.check_needs_update(&[a.clone(), b.clone()]).unwrap();
        cache.commit().unwrap();

        assert!(cache.check_needs_update(&[a.clone()]).unwrap());
        cache.commit().unwrap();
        assert!(!stored(dir.path(), "shrink").files.contains_key(&path_key(&b)));
        assert!(!cache.check_needs_update(&[a]).unwrap());
    }

    #[test]
    fn pending_sidecar_written_before_commit() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("gen.h");
        fs::write(&a, "v1").unwrap();
        let v1_hash = sha256_file(&a).unwrap();

        let mut cache = BatchTwoLayerCache::new(dir.path(), "sidecar");
        cache.check_needs_update(&[a.clone()]).unwrap();

        // The build rewrites the file after the check; the snapshot must not move.
        fs::write(&a, "v2").unwrap();
        set_mtime(&a, 10);
        let pending: BatchSnapshot = serde_json::from_str(
            &fs::read_to_string(dir.path().join("sidecar.json.pending")).unwrap(),
        )
        .unwrap();
        assert_eq!(pending.files[&path_key(&a)].hash, v1_hash);

        // A different instance (another process in practice) commits it.
        let mut committer = BatchTwoLayerCache::new(dir.path(), "sidecar");
        committer.commit().unwrap();
        assert!(!dir.path().join("sidecar.json.pending").exists());

        // The committed snapshot reflects v1, so v2 is reported as a change.
        assert!(cache.check_needs_update(&[a]).unwrap());
    }

    #[test]
    fn empty_set_on_empty_cache_reports_change() {
        let dir = TempDir::new().unwrap();
        let mut cache = BatchTwoLayerCache::new(dir.path(), "empty");
        assert!(cache.check_needs_update(&[]).unwrap());
        cache.commit().unwrap();
        assert!(!cache.check_needs_update(&[]).unwrap());
    }

    #[test]
    fn concurrent_instances_commit_consistently() {
        let dir = TempDir::new().unwrap();
        let files: Vec<PathBuf> = (0..5)
            .map(|i| {
                let p = dir.path().join(format!("src{}.cpp", i));
                fs::write(&p, format!("{}", i)).unwrap();
                p
            })
            .collect();
        let cache_dir = dir.path().join("cache");

        let barrier = Arc::new(Barrier::new(6));
        let handles: Vec<_> = (0..6)
            .map(|_| {
                let files = files.clone();
                let cache_dir = cache_dir.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut cache = BatchTwoLayerCache::new(&cache_dir, "concurrent");
                    let changed = cache.check_needs_update(&files).unwrap();
                    barrier.wait();
                    cache.commit().unwrap();
                    changed
                })
            })
            .collect();

        let results: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|changed| *changed));

        let raw = fs::read_to_string(cache_dir.join("concurrent.json")).unwrap();
        let snapshot: BatchSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot.files.len(), files.len());

        let mut fresh = BatchTwoLayerCache::new(&cache_dir, "concurrent");
        assert!(!fresh.check_needs_update(&files).unwrap());
    }
}
