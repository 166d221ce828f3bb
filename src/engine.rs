//! Engine facade
//!
//! Ties configuration, fingerprint caches, the process registry and the
//! root cancellation token together behind the calls a CI script makes:
//!
//! ```rust,ignore
//! let engine = Engine::new(config, cancel);
//! if engine.should_run("unit-tests", &inputs, None)? {
//!     engine
//!         .with_lock("test-device", None, || engine.run_group("tests", items, options))
//!         .await?;
//!     engine.commit("unit-tests", None)?;
//! }
//! ```

use crate::cache::{AggregateHashCache, CacheStrategy, ChangeDetector};
use crate::config::Config;
use crate::error::{CigateError, CigateResult};
use crate::lock::ResourceLock;
use crate::process::{
    GroupMode, GroupOptions, GroupResult, ProcessGroup, ProcessRegistry, WorkItem,
};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct OpenDetector {
    strategy: CacheStrategy,
    detector: Box<dyn ChangeDetector>,
}

/// Detectors opened so far, keyed by cache name
struct Caches {
    dir: PathBuf,
    default_strategy: CacheStrategy,
    lock_timeout: Option<Duration>,
    open: Mutex<HashMap<String, OpenDetector>>,
}

impl Caches {
    fn new(dir: PathBuf, config: &Config) -> Self {
        Self {
            dir,
            default_strategy: config.cache.default_strategy,
            lock_timeout: config.cache.lock_timeout(),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn open(&self) -> MutexGuard<'_, HashMap<String, OpenDetector>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` on the detector for `cache`, opening it on first use
    fn with_detector<R>(
        &self,
        cache: &str,
        strategy: Option<CacheStrategy>,
        f: impl FnOnce(&mut dyn ChangeDetector) -> CigateResult<R>,
    ) -> CigateResult<R> {
        let strategy = strategy.unwrap_or(self.default_strategy);
        let mut detectors = self.open();

        let reopen = detectors
            .get(cache)
            .is_none_or(|open| open.strategy != strategy);
        if reopen {
            debug!("Opening {} cache '{}'", strategy, cache);
            let detector = strategy.open(&self.dir, cache, self.lock_timeout);
            detectors.insert(cache.to_string(), OpenDetector { strategy, detector });
        }

        let open = detectors
            .get_mut(cache)
            .ok_or_else(|| CigateError::Internal(format!("cache '{}' not open", cache)))?;
        f(open.detector.as_mut())
    }

    fn should_run(
        &self,
        cache: &str,
        files: &[PathBuf],
        strategy: Option<CacheStrategy>,
    ) -> CigateResult<bool> {
        let changed = self.with_detector(cache, strategy, |d| d.check_needs_update(files))?;
        info!(
            "Cache '{}': {}",
            cache,
            if changed { "changed" } else { "unchanged" }
        );
        Ok(changed)
    }

    fn commit(&self, cache: &str, strategy: Option<CacheStrategy>) -> CigateResult<()> {
        self.with_detector(cache, strategy, |d| d.commit())
    }
}

/// Run cache I/O on the blocking pool; cache locks are waited on by polling
async fn off_runtime<R, F>(f: F) -> CigateResult<R>
where
    R: Send + 'static,
    F: FnOnce() -> CigateResult<R> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CigateError::Internal(format!("cache task failed: {}", e)))?
}

/// Incremental execution engine
pub struct Engine {
    config: Config,
    caches: Arc<Caches>,
    registry: ProcessRegistry,
    cancel: CancellationToken,
}

impl Engine {
    /// Create an engine; `cancel` is the root token for everything it runs
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        let caches = Arc::new(Caches::new(config.cache.dir.clone(), &config));
        Self {
            config,
            caches,
            registry: ProcessRegistry::new(),
            cancel,
        }
    }

    /// Override the cache directory from configuration
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.caches = Arc::new(Caches::new(dir.into(), &self.config));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.caches.dir
    }

    /// Live processes started through this engine
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the work guarded by `cache` must run for `files`.
    ///
    /// Blocks while another process holds the cache lock; async callers
    /// use [`Engine::should_run_async`].
    pub fn should_run(
        &self,
        cache: &str,
        files: &[PathBuf],
        strategy: Option<CacheStrategy>,
    ) -> CigateResult<bool> {
        self.caches.should_run(cache, files, strategy)
    }

    /// [`Engine::should_run`] on the blocking thread pool
    pub async fn should_run_async(
        &self,
        cache: &str,
        files: Vec<PathBuf>,
        strategy: Option<CacheStrategy>,
    ) -> CigateResult<bool> {
        let caches = Arc::clone(&self.caches);
        let cache = cache.to_string();
        off_runtime(move || caches.should_run(&cache, &files, strategy)).await
    }

    /// Commit the fingerprint taken by the last `should_run` for `cache`
    pub fn commit(&self, cache: &str, strategy: Option<CacheStrategy>) -> CigateResult<()> {
        self.caches.commit(cache, strategy)
    }

    /// [`Engine::commit`] on the blocking thread pool
    pub async fn commit_async(
        &self,
        cache: &str,
        strategy: Option<CacheStrategy>,
    ) -> CigateResult<()> {
        let caches = Arc::clone(&self.caches);
        let cache = cache.to_string();
        off_runtime(move || caches.commit(&cache, strategy)).await
    }

    /// Forget everything committed for `cache`
    pub fn invalidate(&self, cache: &str, strategy: Option<CacheStrategy>) -> CigateResult<()> {
        self.caches
            .with_detector(cache, strategy, |d| d.invalidate())?;
        info!("Invalidated cache '{}'", cache);
        Ok(())
    }

    /// Record a failed run for an aggregate cache
    pub fn record_failure(&self, cache: &str) -> CigateResult<()> {
        self.caches.open().remove(cache);
        AggregateHashCache::new(&self.caches.dir, cache)
            .with_lock_timeout(self.caches.lock_timeout)
            .record_failure()
    }

    /// [`Engine::record_failure`] on the blocking thread pool
    pub async fn record_failure_async(&self, cache: &str) -> CigateResult<()> {
        self.caches.open().remove(cache);
        let dir = self.caches.dir.clone();
        let lock_timeout = self.caches.lock_timeout;
        let cache = cache.to_string();
        off_runtime(move || {
            AggregateHashCache::new(&dir, &cache)
                .with_lock_timeout(lock_timeout)
                .record_failure()
        })
        .await
    }

    /// Group options for `mode` from configured defaults
    pub fn group_options(&self, mode: GroupMode) -> GroupOptions {
        self.config.group.options(mode)
    }

    /// Build a group bound to this engine's registry and cancellation
    pub fn group(
        &self,
        name: &str,
        items: Vec<WorkItem>,
        options: GroupOptions,
    ) -> CigateResult<ProcessGroup> {
        ProcessGroup::new(
            name,
            items,
            options,
            self.registry.clone(),
            self.cancel.child_token(),
        )
    }

    /// Run `items` as one group and wait for the outcome
    pub async fn run_group(
        &self,
        name: &str,
        items: Vec<WorkItem>,
        options: GroupOptions,
    ) -> CigateResult<GroupResult> {
        self.group(name, items, options)?.run().await
    }

    /// A named resource lock in the configured lock directory
    pub fn resource_lock(&self, name: &str) -> ResourceLock {
        ResourceLock::new(&self.config.lock.resolved_dir(), name)
            .with_warn_after(self.config.lock.warn_after())
    }

    /// Run `body` while holding resource lock `name`.
    ///
    /// `timeout` overrides the configured lock timeout.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        timeout: Option<Duration>,
        body: F,
    ) -> CigateResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CigateResult<T>>,
    {
        let timeout = timeout.or_else(|| self.config.lock.timeout());
        self.resource_lock(name)
            .with_lock(timeout, &self.cancel, body)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn engine(dir: &TempDir) -> Engine {
        let mut config = Config::default();
        config.cache.dir = dir.path().join("cache");
        config.lock.dir = Some(dir.path().join("locks"));
        Engine::new(config, CancellationToken::new())
    }

    #[test]
    fn should_run_then_commit_settles() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("main.cpp");
        fs::write(&src, "int main() {}").unwrap();
        let files = vec![src];
        let engine = engine(&dir);

        for strategy in [CacheStrategy::PerFile, CacheStrategy::Batch, CacheStrategy::Aggregate] {
            let name = format!("build-{}", strategy);
            assert!(engine.should_run(&name, &files, Some(strategy)).unwrap());
            engine.commit(&name, Some(strategy)).unwrap();
            assert!(!engine.should_run(&name, &files, Some(strategy)).unwrap());
        }
    }

    #[test]
    fn commit_from_fresh_engine_uses_sidecar() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("lib.cpp");
        fs::write(&src, "void f() {}").unwrap();
        let files = vec![src];

        assert!(engine(&dir).should_run("lib", &files, None).unwrap());
        engine(&dir).commit("lib", None).unwrap();
        assert!(!engine(&dir).should_run("lib", &files, None).unwrap());
    }

    #[test]
    fn invalidate_forces_rerun() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("x.cpp");
        fs::write(&src, "x").unwrap();
        let files = vec![src];
        let engine = engine(&dir);

        engine.should_run("x", &files, None).unwrap();
        engine.commit("x", None).unwrap();
        engine.invalidate("x", None).unwrap();
        assert!(engine.should_run("x", &files, None).unwrap());
    }

    #[test]
    fn failure_record_keeps_aggregate_dirty() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("t.cpp");
        fs::write(&src, "t").unwrap();
        let files = vec![src];
        let engine = engine(&dir);

        let aggregate = Some(CacheStrategy::Aggregate);
        assert!(engine.should_run("tests", &files, aggregate).unwrap());
        engine.record_failure("tests").unwrap();
        assert!(engine.should_run("tests", &files, aggregate).unwrap());
    }

    #[tokio::test]
    async fn async_cache_calls_wait_off_the_runtime() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("held.cpp");
        fs::write(&src, "held").unwrap();
        let files = vec![src];
        let engine = engine(&dir);

        assert!(engine.should_run_async("held", files.clone(), None).await.unwrap());

        // Hold the cache lock from another thread; the commit has to wait
        // for it without stalling this single-threaded runtime.
        let lock_path = dir.path().join("cache").join("held.json.lock");
        let guard = crate::fslock::LockedFile::acquire_blocking(&lock_path, None).unwrap();
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&released);
        let holder = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            drop(guard);
        });

        let ticker = tokio::spawn(async {
            let mut ticks = 0u32;
            for _ in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ticks += 1;
            }
            ticks
        });

        engine.commit_async("held", None).await.unwrap();
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
        assert!(ticker.is_finished());
        assert_eq!(ticker.await.unwrap(), 5);
        holder.join().unwrap();

        assert!(!engine.should_run_async("held", files, None).await.unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn run_group_under_lock() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let items = vec![WorkItem::shell("hello", "echo hello")];
        let options = engine.group_options(GroupMode::Parallel);

        let result = engine
            .with_lock("device", Some(Duration::from_secs(5)), || {
                engine.run_group("smoke", items, options)
            })
            .await
            .unwrap();
        assert!(result.is_success());
        assert_eq!(result.reports[0].output, vec!["hello"]);
        assert!(engine.registry().is_empty());
        assert!(!dir.path().join("locks").join("device.lock").exists());
    }
}
