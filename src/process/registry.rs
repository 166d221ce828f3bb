//! Live-process registry for hang diagnostics

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A child currently running under some handle
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveProcess {
    pub id: u64,
    pub pid: u32,
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct RegistryInner {
    processes: Mutex<BTreeMap<u64, ActiveProcess>>,
    next_id: AtomicU64,
}

/// Registry of live children, constructed once by the orchestrator and
/// shared by every handle it creates. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<u64, ActiveProcess>> {
        self.inner
            .processes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Record a started child and return its registry id
    pub fn register(&self, pid: u32, command: &str, cwd: Option<PathBuf>) -> u64 {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.table().insert(
            id,
            ActiveProcess {
                id,
                pid,
                command: command.to_string(),
                cwd,
                started_at: Utc::now(),
            },
        );
        id
    }

    /// Forget a child once it has been reaped
    pub fn unregister(&self, id: u64) {
        self.table().remove(&id);
    }

    /// Snapshot of live children, oldest first
    pub fn active(&self) -> Vec<ActiveProcess> {
        self.table().values().cloned().collect()
    }

    /// Number of live children
    pub fn len(&self) -> usize {
        self.table().len()
    }

    /// Whether no child is live
    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Human-readable listing of every live command
    pub fn dump(&self) -> String {
        let now = Utc::now();
        self.active()
            .iter()
            .map(|p| {
                let running = (now - p.started_at).num_seconds();
                format!("pid {} ({}s): {}", p.pid, running, p.command)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ProcessRegistry::new();
        let a = registry.register(100, "ninja -C build", None);
        let b = registry.register(101, "ctest", Some(PathBuf::from("/build")));
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.unregister(a);
        let active = registry.active();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].pid, 101);
    }

    #[test]
    fn clones_share_state() {
        let registry = ProcessRegistry::new();
        let clone = registry.clone();
        clone.register(7, "sleep 100", None);
        assert!(!registry.is_empty());
        assert!(registry.dump().contains("sleep 100"));
    }
}
