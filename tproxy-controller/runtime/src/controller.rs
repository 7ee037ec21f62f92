use crate::metrics::ControllerMetrics;
use std::sync::Arc;
use tokio::{sync::watch, task::JoinSet};
use tproxy_controller_core::{
    sync, Config, Decision, RuleStore, SyncError, WorkloadCache, WorkloadKey,
};
use tproxy_controller_queue::WorkQueue;
use tracing::{debug, debug_span, error, info, warn, Instrument};

#[cfg(test)]
mod tests;

/// The number of times a failing pod is requeued before it is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Drains the work queue with a fixed pool of workers.
///
/// The queue never hands a key to two workers at once, so every pod's rules are reconciled by at
/// most one worker at a time.
pub struct Controller<C, S> {
    queue: WorkQueue<WorkloadKey>,
    cache: C,
    store: Arc<S>,
    config: Arc<Config>,
    metrics: ControllerMetrics,
    max_retries: u32,
}

// === impl Controller ===

impl<C, S> Controller<C, S>
where
    C: WorkloadCache + Clone + 'static,
    S: RuleStore + 'static,
{
    pub fn new(
        queue: WorkQueue<WorkloadKey>,
        cache: C,
        store: Arc<S>,
        config: Config,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            queue,
            cache,
            store,
            config: Arc::new(config),
            metrics,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Waits for the pod cache to sync and then processes keys until the queue is shut down.
    pub async fn run(self, workers: usize, synced: watch::Receiver<bool>) {
        info!("Waiting for the pod cache to sync");
        tokio::select! {
            biased;
            () = self.queue.closed() => {
                info!("Shut down before the pod cache synced");
                return;
            }
            synced = wait_synced(synced) => {
                if !synced {
                    warn!("Pod cache closed before it synced");
                    return;
                }
            }
        }

        let workers = workers.max(1);
        info!(workers, "Starting workers");
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            self.spawn_worker(&mut tasks, id);
        }

        let mut next_id = workers;
        while let Some(res) = tasks.join_next().await {
            match res {
                Ok(()) => {}
                Err(error) if error.is_panic() && !self.queue.is_shutting_down() => {
                    error!(%error, "Worker panicked; replacing it");
                    self.spawn_worker(&mut tasks, next_id);
                    next_id += 1;
                }
                Err(error) => error!(%error, "Worker failed"),
            }
        }
        info!("Workers stopped");
    }

    fn spawn_worker(&self, tasks: &mut JoinSet<()>, id: usize) {
        let worker = self.clone();
        tasks.spawn(
            async move { while worker.process_next_item().await {} }
                .instrument(debug_span!("worker", id)),
        );
    }

    /// Processes a single key, returning false once the queue is shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };
        let claim = Claim {
            queue: &self.queue,
            key,
        };

        let record = self.cache.get(&claim.key);
        let result = sync(
            &claim.key,
            record.as_ref(),
            &self.config,
            self.store.as_ref(),
        )
        .await;
        self.handle_result(&claim.key, result);
        true
    }

    fn handle_result(&self, key: &WorkloadKey, result: Result<Decision, SyncError>) {
        let error = match result {
            Ok(decision) => {
                debug!(%key, decision = decision.as_str(), "Synced");
                self.metrics.synced(&decision);
                self.queue.forget(key);
                return;
            }
            Err(error) => error,
        };

        self.metrics.failed();
        if self.queue.num_requeues(key) < self.max_retries {
            info!(%key, %error, "Failed to sync pod; requeueing");
            self.metrics.requeued();
            self.queue.add_rate_limited(key.clone());
            return;
        }

        self.queue.forget(key);
        self.metrics.dropped();
        error!(%key, %error, retries = self.max_retries, "Dropping pod out of the queue");
    }
}

impl<C: Clone, S> Clone for Controller<C, S> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            cache: self.cache.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            max_retries: self.max_retries,
        }
    }
}

/// Marks a key done when dropped, including when the worker unwinds.
struct Claim<'a> {
    queue: &'a WorkQueue<WorkloadKey>,
    key: WorkloadKey,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}

async fn wait_synced(mut synced: watch::Receiver<bool>) -> bool {
    synced.wait_for(|s| *s).await.is_ok()
}
