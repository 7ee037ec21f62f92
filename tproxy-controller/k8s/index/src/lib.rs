//! Pod cache for the redirect controller.
//!
//! The index is driven by `kubert::index::namespaced` over a pod watch. Every apply or delete
//! stores (or drops) a [`WorkloadRecord`] snapshot and enqueues the pod's key; the reconciler
//! then reads the snapshot back when it dequeues the key. Because only keys are queued, a worker
//! always acts on the latest snapshot rather than on the event that triggered it.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod workload;

pub use self::workload::record;
use ahash::AHashMap as HashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use kubert::index::NamespacedRemoved;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tproxy_controller_core::{WorkloadCache, WorkloadKey, WorkloadRecord};
use tproxy_controller_queue::WorkQueue;
use tracing::{debug, warn};


pub type SharedIndex = Arc<RwLock<Index>>;

#[derive(Debug)]
pub struct Index {
    pods: HashMap<WorkloadKey, WorkloadRecord>,
    queue: WorkQueue<WorkloadKey>,

    /// Flips to true once the initial listing has been indexed.
    synced: watch::Sender<bool>,
}

// === impl Index ===

impl Index {
    pub fn new(queue: WorkQueue<WorkloadKey>) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            pods: HashMap::new(),
            queue,
            synced,
        }
    }

    pub fn shared(queue: WorkQueue<WorkloadKey>) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(queue)))
    }

    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    pub fn len(&self) -> usize {
        self.pods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pods.is_empty()
    }
}

impl WorkloadCache for Index {
    fn get(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.pods.get(key).cloned()
    }
}

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        let Some(namespace) = pod.namespace() else {
            warn!(name = %pod.name_any(), "Ignoring pod without a namespace");
            return;
        };
        let key = WorkloadKey::new(namespace, pod.name_unchecked());
        let record = record(&pod);
        debug!(%key, ?record, "Applied");
        self.pods.insert(key.clone(), record);
        self.queue.add(key);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let key = WorkloadKey { namespace, name };
        debug!(%key, "Deleted");
        self.pods.remove(&key);
        self.queue.add(key);
    }

    fn reset(&mut self, pods: Vec<Pod>, removed: NamespacedRemoved) {
        for pod in pods {
            self.apply(pod);
        }
        for (namespace, names) in removed {
            for name in names {
                self.delete(namespace.clone(), name);
            }
        }
        if !self.synced.send_replace(true) {
            debug!(pods = self.pods.len(), "Initial sync complete");
        }
    }
}
