use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

pub const JOBS_IN_FLIGHT: &str = "bus_adapter_jobs_in_flight";

/// Registry of in-flight job identifiers.
///
/// Mutation and size queries go through the same lock, so a size read can be
/// stale but never misses a job that was added before the read started.
#[derive(Debug, Default)]
pub struct JobTracker {
    pool: RwLock<HashSet<String>>,
}

impl JobTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Inserts `id`. Adding an id that is already present is a no-op.
    pub fn add(&self, id: &str) {
        let size = {
            let mut pool = self.write();
            pool.insert(id.to_owned());
            pool.len()
        };
        metrics::gauge!(JOBS_IN_FLIGHT).set(size as f64);
        debug!(entity = "bus.jobs", correlation_id = %id, "job added");
    }

    /// Removes `id` if present.
    pub fn remove(&self, id: &str) {
        let size = {
            let mut pool = self.write();
            pool.remove(id);
            pool.len()
        };
        metrics::gauge!(JOBS_IN_FLIGHT).set(size as f64);
        debug!(entity = "bus.jobs", correlation_id = %id, "job removed");
    }

    pub fn size(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains(id)
    }

    /// Ids present at the time of the call, sorted.
    pub fn snapshot(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Registers `id` and releases it when the guard is dropped, including on unwind.
    pub fn track(self: &Arc<Self>, id: impl Into<String>) -> JobGuard {
        let id = id.into();
        self.add(&id);
        JobGuard {
            tracker: self.clone(),
            id,
        }
    }

    // A panic while holding the lock cannot leave the set half-updated, so a
    // poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashSet<String>> {
        self.pool.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashSet<String>> {
        self.pool.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Holds one registered job id.
#[must_use = "dropping the guard releases the job immediately"]
#[derive(Debug)]
pub struct JobGuard {
    tracker: Arc<JobTracker>,
    id: String,
}

impl JobGuard {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn release(self) {}
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.tracker.remove(&self.id);
    }
}
