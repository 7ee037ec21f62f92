use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use tproxy_controller_core::Decision;

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    syncs: Family<DecisionLabels, Counter>,
    failures: Counter,
    requeues: Counter,
    drops: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DecisionLabels {
    decision: &'static str,
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let syncs = Family::<DecisionLabels, Counter>::default();
        reg.register(
            "syncs",
            "Count of completed reconciliations by decision",
            syncs.clone(),
        );

        let failures = Counter::default();
        reg.register(
            "sync_failures",
            "Count of reconciliations that failed",
            failures.clone(),
        );

        let requeues = Counter::default();
        reg.register(
            "requeues",
            "Count of failed pods requeued with backoff",
            requeues.clone(),
        );

        let drops = Counter::default();
        reg.register(
            "drops",
            "Count of pods dropped after exhausting their retries",
            drops.clone(),
        );

        Self {
            syncs,
            failures,
            requeues,
            drops,
        }
    }

    pub(crate) fn synced(&self, decision: &Decision) {
        self.syncs
            .get_or_create(&DecisionLabels {
                decision: decision.as_str(),
            })
            .inc();
    }

    pub(crate) fn failed(&self) {
        self.failures.inc();
    }

    pub(crate) fn requeued(&self) {
        self.requeues.inc();
    }

    pub(crate) fn dropped(&self) {
        self.drops.inc();
    }

    #[cfg(test)]
    pub(crate) fn syncs(&self, decision: &'static str) -> u64 {
        self.syncs.get_or_create(&DecisionLabels { decision }).get()
    }

    #[cfg(test)]
    pub(crate) fn counts(&self) -> (u64, u64, u64) {
        (self.failures.get(), self.requeues.get(), self.drops.get())
    }
}
