use crate::{WorkloadKey, WorkloadRecord};
use parking_lot::RwLock;
use std::sync::Arc;

/// A read-only view of the locally cached workloads.
pub trait WorkloadCache: Send + Sync {
    /// Returns a snapshot of the workload, if it is currently known.
    fn get(&self, key: &WorkloadKey) -> Option<WorkloadRecord>;
}

impl<T: WorkloadCache> WorkloadCache for Arc<RwLock<T>> {
    fn get(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.read().get(key)
    }
}
