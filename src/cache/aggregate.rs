//! Single-digest cache over a whole file set
//!
//! Every check hashes every file. The digest input includes each path, its
//! mtime and its content digest, so touching a file changes the aggregate.
//! This keeps the committed state to one record no matter how large the
//! tree is.

use crate::cache::hashing::{mtime_secs, now_secs, path_key, sha256_file};
use crate::cache::store::CacheStore;
use crate::cache::{resolve_pending, ChangeDetector};
use crate::error::CigateResult;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Outcome recorded with a fingerprint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintStatus {
    Success,
    Failure,
    #[default]
    Unknown,
}

/// On-disk layout: `{"hash", "status", "timestamp", ...metadata}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub status: FingerprintStatus,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl AggregateRecord {
    /// Whether this record represents a usable committed success
    pub fn is_success(&self) -> bool {
        !self.hash.is_empty() && self.status == FingerprintStatus::Success
    }
}

/// Detector storing one SHA-256 over the whole file set
#[derive(Debug)]
pub struct AggregateHashCache {
    store: CacheStore<AggregateRecord>,
    metadata: serde_json::Map<String, serde_json::Value>,
    pending: Option<AggregateRecord>,
}

impl AggregateHashCache {
    /// Create a detector for `name` in `cache_dir`
    pub fn new(cache_dir: &Path, name: &str) -> Self {
        Self {
            store: CacheStore::new(cache_dir, name),
            metadata: serde_json::Map::new(),
            pending: None,
        }
    }

    /// Override the cache lock timeout
    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.store = self.store.with_lock_timeout(timeout);
        self
    }

    /// Attach metadata (test counts, tool versions) stored beside the hash
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// The committed record, if any
    pub fn committed(&self) -> CigateResult<Option<AggregateRecord>> {
        let record = self.store.load()?;
        Ok((!record.hash.is_empty()).then_some(record))
    }

    /// Commit the pending fingerprint with a failure status.
    ///
    /// The next check reports a change regardless of the digest.
    pub fn record_failure(&mut self) -> CigateResult<()> {
        self.finish(FingerprintStatus::Failure)
    }

    fn finish(&mut self, status: FingerprintStatus) -> CigateResult<()> {
        let mut record = resolve_pending(&self.store, self.pending.take())?;
        record.status = status;
        record.timestamp = now_secs();
        self.store.commit_pending(&record)?;
        info!("Committed {:?} fingerprint for cache {}", status, self.name());
        Ok(())
    }
}

/// Digest of a file set: sorted paths, each folded with mtime and content
pub fn aggregate_digest(files: &[PathBuf]) -> CigateResult<String> {
    let mut hasher = Sha256::new();
    let paths: BTreeSet<(String, &PathBuf)> = files.iter().map(|p| (path_key(p), p)).collect();

    for (key, path) in paths {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        match mtime_secs(path)? {
            Some(mtime) => {
                hasher.update(mtime.to_bits().to_le_bytes());
                hasher.update(sha256_file(path)?.as_bytes());
            }
            None => hasher.update(b"<missing>"),
        }
        hasher.update([0u8]);
    }

    Ok(hex::encode(hasher.finalize()))
}

impl ChangeDetector for AggregateHashCache {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn check_needs_update(&mut self, files: &[PathBuf]) -> CigateResult<bool> {
        let hash = aggregate_digest(files)?;
        let committed = self.store.load()?;
        let changed = !committed.is_success() || committed.hash != hash;
        debug!(
            "Aggregate digest for {} is {} ({})",
            self.name(),
            &hash[..12],
            if changed { "changed" } else { "unchanged" }
        );

        let pending = AggregateRecord {
            hash,
            status: FingerprintStatus::Unknown,
            timestamp: now_secs(),
            metadata: self.metadata.clone(),
        };
        self.store.write_pending(&pending)?;
        self.pending = Some(pending);
        Ok(changed)
    }

    fn commit(&mut self) -> CigateResult<()> {
        self.finish(FingerprintStatus::Success)
    }

    fn invalidate(&mut self) -> CigateResult<()> {
        self.pending = None;
        self.store.remove()
    }
}
