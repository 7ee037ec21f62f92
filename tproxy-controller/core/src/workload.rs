use std::{collections::BTreeMap, net::IpAddr};

/// A snapshot of a workload as observed in the local cache.
///
/// Records are produced by the cache and only ever read by the reconciler.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadRecord {
    /// The IP assigned to the workload, if it has been assigned one.
    pub pod_ip: Option<IpAddr>,

    /// The address of the node the workload is scheduled to.
    pub host_ip: Option<IpAddr>,

    pub annotations: BTreeMap<String, String>,

    /// Set once the workload has a deletion in progress.
    pub terminating: bool,
}

impl WorkloadRecord {
    /// Only the presence of the marker matters; its value is ignored.
    pub fn has_marker(&self, marker: &str) -> bool {
        self.annotations.contains_key(marker)
    }
}
