use std::net::IpAddr;

/// Process-wide reconciliation settings, read once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The address of the node this controller runs on.
    pub node_ip: IpAddr,

    /// The annotation whose presence opts a workload into redirection.
    pub marker: String,

    pub unmarked: UnmarkedPolicy,

    pub ip_change: IpChangePolicy,
}

/// What to do with existing rules when a workload loses its marker.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum UnmarkedPolicy {
    /// Rules stay in place until the workload is deleted.
    #[default]
    Retain,

    /// Rules are removed as soon as the marker is gone.
    Remove,
}

/// What to do with existing rules whose source no longer matches the workload's IP.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum IpChangePolicy {
    /// Rules stay in place until the workload is deleted.
    #[default]
    Retain,

    /// Stale rules are removed and a fresh pair is added for the current IP.
    Resync,
}

impl Config {
    pub fn new(node_ip: IpAddr, marker: impl ToString) -> Self {
        Self {
            node_ip,
            marker: marker.to_string(),
            unmarked: UnmarkedPolicy::default(),
            ip_change: IpChangePolicy::default(),
        }
    }
}
