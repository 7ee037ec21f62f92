use super::*;
use maplit::btreemap;
use parking_lot::RwLock;
use prometheus_client::registry::Registry;
use std::{
    collections::HashMap,
    net::IpAddr,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::time;
use tproxy_controller_core::{
    fake::{Call, FakeTable},
    RuleTag, WorkloadRecord,
};
use tproxy_controller_queue::RateLimiter;

const MARKER: &str = "initializer.kubernetes.io/tproxy";
const NODE_IP: &str = "192.0.2.10";
const POD_IP: &str = "10.1.0.7";

#[derive(Default)]
struct Pods(HashMap<WorkloadKey, WorkloadRecord>);

impl WorkloadCache for Pods {
    fn get(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        self.0.get(key).cloned()
    }
}

struct Harness {
    queue: WorkQueue<WorkloadKey>,
    pods: Arc<RwLock<Pods>>,
    table: Arc<FakeTable>,
    metrics: ControllerMetrics,
    synced: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn marked() -> WorkloadRecord {
    WorkloadRecord {
        pod_ip: Some(ip(POD_IP)),
        host_ip: Some(ip(NODE_IP)),
        annotations: btreemap! { MARKER.to_string() => "true".to_string() },
        terminating: false,
    }
}

fn key() -> WorkloadKey {
    WorkloadKey::new("default", "pod-a")
}

fn inspections(table: &FakeTable) -> usize {
    table
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Inspect(_)))
        .count()
}

impl Harness {
    fn spawn(table: FakeTable, workers: usize, synced: bool) -> Self {
        let queue = WorkQueue::new(RateLimiter::default());
        let pods = Arc::new(RwLock::new(Pods::default()));
        pods.write().0.insert(key(), marked());
        let table = Arc::new(table);
        let metrics = ControllerMetrics::register(&mut Registry::default());
        let (synced_tx, synced_rx) = watch::channel(synced);

        let controller = Controller::new(
            queue.clone(),
            pods.clone(),
            table.clone(),
            Config::new(ip(NODE_IP), MARKER),
            metrics.clone(),
        );
        let task = tokio::spawn(controller.run(workers, synced_rx));

        Self {
            queue,
            pods,
            table,
            metrics,
            synced: synced_tx,
            task,
        }
    }

    async fn stop(self) {
        self.queue.shut_down();
        time::timeout(Duration::from_secs(1), self.task)
            .await
            .expect("controller must stop")
            .expect("controller must not panic");
    }
}

#[tokio::test(start_paused = true)]
async fn adds_rules_for_a_marked_pod() {
    let h = Harness::spawn(FakeTable::new(), 1, true);
    h.queue.add(key());
    time::sleep(Duration::from_millis(10)).await;

    assert_eq!(
        h.table.mutations(),
        vec![Call::Add(ip(POD_IP), RuleTag::for_workload("pod-a"))]
    );
    assert_eq!(h.table.rows().len(), 2);
    assert_eq!(h.metrics.syncs("add"), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn coalesces_notifications_for_a_waiting_pod() {
    let h = Harness::spawn(FakeTable::new(), 1, false);
    h.queue.add(key());
    h.queue.add(key());
    h.queue.add(key());
    h.synced.send_replace(true);
    time::sleep(Duration::from_millis(10)).await;

    assert_eq!(inspections(&h.table), 1);
    assert_eq!(h.table.mutations().len(), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn never_reconciles_a_pod_on_two_workers() {
    let table = FakeTable::new().with_mutation_delay(Duration::from_millis(100));
    let h = Harness::spawn(table, 2, true);

    h.queue.add(key());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.queue.in_flight(), 1);

    // Arrives while the first pass is still adding rules.
    h.queue.add(key());
    time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.table.max_in_flight(), 1);
    assert_eq!(inspections(&h.table), 2, "the deferred key must be processed again");
    assert_eq!(h.table.mutations().len(), 1, "rules must be added exactly once");
    assert_eq!(h.metrics.syncs("add"), 1);
    assert_eq!(h.metrics.syncs("present"), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn drops_a_pod_after_exhausting_retries() {
    let table = FakeTable::new();
    table.fail_inspect(true);
    let h = Harness::spawn(table, 1, true);

    h.queue.add(key());
    time::sleep(Duration::from_secs(60)).await;

    assert_eq!(inspections(&h.table), 1 + DEFAULT_MAX_RETRIES as usize);
    assert_eq!(h.metrics.counts(), (6, 5, 1));
    assert_eq!(h.queue.num_requeues(&key()), 0, "retry history must be cleared");
    assert!(h.queue.is_empty());

    // Nothing happens until the pod is notified again.
    h.table.fail_inspect(false);
    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(inspections(&h.table), 6);

    h.queue.add(key());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(inspections(&h.table), 7);
    assert_eq!(h.metrics.syncs("add"), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn success_clears_retry_history() {
    let table = FakeTable::new();
    table.fail_inspect(true);
    let h = Harness::spawn(table, 1, true);

    h.queue.add(key());
    time::sleep(Duration::from_millis(1)).await;
    assert_eq!(h.queue.num_requeues(&key()), 1);

    h.table.fail_inspect(false);
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(inspections(&h.table), 2);
    assert_eq!(h.queue.num_requeues(&key()), 0);
    assert_eq!(h.metrics.counts(), (1, 1, 0));
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn sweeps_rules_once_a_pod_is_gone() {
    let h = Harness::spawn(FakeTable::new(), 1, true);
    h.queue.add(key());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.table.rows().len(), 2);

    h.pods.write().0.remove(&key());
    h.queue.add(key());
    time::sleep(Duration::from_millis(10)).await;

    assert!(h.table.rows().is_empty());
    assert_eq!(h.metrics.syncs("sweep"), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn waits_for_the_cache_to_sync() {
    let h = Harness::spawn(FakeTable::new(), 1, false);
    h.queue.add(key());
    time::sleep(Duration::from_secs(1)).await;
    assert!(h.table.calls().is_empty());

    h.synced.send_replace(true);
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(inspections(&h.table), 1);
    h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stops_when_shut_down_before_sync() {
    let h = Harness::spawn(FakeTable::new(), 2, false);
    h.queue.add(key());
    h.stop().await;
}

/// Panics on its first lookup.
struct PanicsOnce {
    pods: Pods,
    armed: AtomicBool,
}

impl WorkloadCache for PanicsOnce {
    fn get(&self, key: &WorkloadKey) -> Option<WorkloadRecord> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("lookup failed");
        }
        self.pods.get(key)
    }
}

#[tokio::test(start_paused = true)]
async fn a_panicking_pass_releases_the_pod_and_the_worker() {
    let mut pods = Pods::default();
    pods.0.insert(key(), marked());
    let cache = Arc::new(RwLock::new(PanicsOnce {
        pods,
        armed: AtomicBool::new(true),
    }));
    let queue = WorkQueue::new(RateLimiter::default());
    let table = Arc::new(FakeTable::new());
    let metrics = ControllerMetrics::register(&mut Registry::default());
    let (_synced, synced_rx) = watch::channel(true);
    let controller = Controller::new(
        queue.clone(),
        cache,
        table.clone(),
        Config::new(ip(NODE_IP), MARKER),
        metrics.clone(),
    );
    let task = tokio::spawn(controller.run(1, synced_rx));

    queue.add(key());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.in_flight(), 0, "the key must be released");
    assert!(table.calls().is_empty());

    queue.add(key());
    time::sleep(Duration::from_millis(10)).await;
    assert_eq!(inspections(&table), 1, "a replacement worker must pick up the key");
    assert_eq!(table.rows().len(), 2);
    assert_eq!(metrics.syncs("add"), 1);

    queue.shut_down();
    time::timeout(Duration::from_secs(1), task)
        .await
        .expect("controller must stop")
        .expect("controller must not panic");
}
