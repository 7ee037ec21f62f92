use crate::{
    Config, FirewallRule, IpChangePolicy, RuleStore, RuleTag, StoreError, UnmarkedPolicy,
    WorkloadKey, WorkloadRecord, REDIRECT_PORTS,
};
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};


/// The outcome of comparing a workload's cached state against the rules tagged for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// The workload is gone; all of its rules are removed.
    Sweep { positions: Vec<u32> },

    /// The workload is gone and nothing is tagged for it.
    Absent,

    /// The workload is scheduled to another node.
    ForeignNode,

    /// The workload has not been assigned an IP yet.
    PendingIp,

    /// The workload does not carry the marker. Any existing rules are left in place.
    Unmarked { rules: usize },

    /// The workload lost its marker and its rules are removed.
    Revoke { positions: Vec<u32> },

    /// The workload is eligible and has no rules.
    Add { ip: IpAddr },

    /// The workload's rules point at a stale source and are replaced.
    Resync { ip: IpAddr, positions: Vec<u32> },

    /// The workload's rules are not exactly one per redirected port, as after an add that
    /// failed partway. They are removed and the pair is added again.
    Repair { ip: IpAddr, positions: Vec<u32> },

    /// The workload's tag cannot be stored as a rule comment, so it can never have rules.
    TagTooLong { len: usize },

    /// The workload already has rules.
    Present { terminating: bool },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to inspect rules tagged {tag}: {source}")]
    Inspect {
        tag: RuleTag,
        #[source]
        source: StoreError,
    },

    #[error("failed to remove rule {position} tagged {tag}: {source}")]
    Remove {
        tag: RuleTag,
        position: u32,
        #[source]
        source: StoreError,
    },

    #[error("failed to add rules tagged {tag}: {source}")]
    Add {
        tag: RuleTag,
        #[source]
        source: StoreError,
    },
}

// === impl Decision ===

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sweep { .. } => "sweep",
            Self::Absent => "absent",
            Self::ForeignNode => "foreign_node",
            Self::PendingIp => "pending_ip",
            Self::Unmarked { .. } => "unmarked",
            Self::Revoke { .. } => "revoke",
            Self::Add { .. } => "add",
            Self::Resync { .. } => "resync",
            Self::Repair { .. } => "repair",
            Self::TagTooLong { .. } => "tag_too_long",
            Self::Present { .. } => "present",
        }
    }
}

/// Decides how a workload's rules must change.
///
/// Deleted workloads are swept regardless of node: a deleted record no longer says where it was
/// scheduled, so every node removes whatever it has tagged for it.
pub fn decide(
    record: Option<&WorkloadRecord>,
    config: &Config,
    existing: &[FirewallRule],
) -> Decision {
    let Some(record) = record else {
        if existing.is_empty() {
            return Decision::Absent;
        }
        return Decision::Sweep {
            positions: descending(existing),
        };
    };

    if record.host_ip != Some(config.node_ip) {
        return Decision::ForeignNode;
    }

    let Some(ip) = record.pod_ip else {
        return Decision::PendingIp;
    };

    if !record.has_marker(&config.marker) {
        if !existing.is_empty() && config.unmarked == UnmarkedPolicy::Remove {
            return Decision::Revoke {
                positions: descending(existing),
            };
        }
        return Decision::Unmarked {
            rules: existing.len(),
        };
    }

    if existing.is_empty() {
        return Decision::Add { ip };
    }

    if !record.terminating
        && config.ip_change == IpChangePolicy::Resync
        && existing
            .iter()
            .any(|rule| rule.source.is_some_and(|src| src != ip))
    {
        return Decision::Resync {
            ip,
            positions: descending(existing),
        };
    }

    if !record.terminating && !is_complete(existing) {
        return Decision::Repair {
            ip,
            positions: descending(existing),
        };
    }

    Decision::Present {
        terminating: record.terminating,
    }
}

/// Reconciles the rules for a single workload.
///
/// The rule store is inspected on every call so that a retry always acts on the current table.
#[instrument(skip_all, name = "sync", fields(namespace = %key.namespace, name = %key.name))]
pub async fn sync<S>(
    key: &WorkloadKey,
    record: Option<&WorkloadRecord>,
    config: &Config,
    store: &S,
) -> Result<Decision, SyncError>
where
    S: RuleStore + ?Sized,
{
    let tag = RuleTag::from(key);
    if !tag.fits_comment() {
        let len = tag.as_str().len();
        warn!(
            %tag,
            len,
            max = RuleTag::MAX_LEN,
            "Workload name is too long to tag rules; skipping"
        );
        return Ok(Decision::TagTooLong { len });
    }

    let existing = store
        .inspect(&tag)
        .await
        .map_err(|source| SyncError::Inspect {
            tag: tag.clone(),
            source,
        })?;
    trace!(?existing);

    let decision = decide(record, config, &existing);
    match &decision {
        Decision::Sweep { positions } => {
            info!(%tag, ?positions, "Removing rules for deleted workload");
            remove_positions(store, &tag, positions).await?;
        }
        Decision::Revoke { positions } => {
            info!(%tag, ?positions, marker = %config.marker, "Removing rules for unmarked workload");
            remove_positions(store, &tag, positions).await?;
        }
        Decision::Add { ip } => {
            info!(%tag, %ip, "Adding rules");
            add(store, *ip, &tag).await?;
        }
        Decision::Resync { ip, positions } => {
            info!(%tag, %ip, ?positions, "Replacing rules with a stale source");
            remove_positions(store, &tag, positions).await?;
            add(store, *ip, &tag).await?;
        }
        Decision::Repair { ip, positions } => {
            info!(%tag, %ip, ?positions, "Rebuilding an incomplete rule set");
            remove_positions(store, &tag, positions).await?;
            add(store, *ip, &tag).await?;
        }
        Decision::Unmarked { rules } => {
            info!(marker = %config.marker, rules, "Workload is missing the marker annotation; skipping");
        }
        Decision::Present { terminating: false } => {
            debug!(%tag, "Rules already exist; skipping");
        }
        Decision::Present { terminating: true } => {
            debug!(%tag, "Workload is terminating; waiting for deletion");
        }
        Decision::Absent
        | Decision::ForeignNode
        | Decision::PendingIp
        | Decision::TagTooLong { .. } => {
            debug!(decision = decision.as_str(), "Nothing to do");
        }
    }

    Ok(decision)
}

/// Removes the given positions, highest first.
///
/// All positions must come from a single inspection of the table. The first failure aborts the
/// remaining removals.
pub async fn remove_positions<S>(
    store: &S,
    tag: &RuleTag,
    positions: &[u32],
) -> Result<usize, SyncError>
where
    S: RuleStore + ?Sized,
{
    let mut positions = positions.to_vec();
    positions.sort_unstable_by(|a, b| b.cmp(a));
    positions.dedup();

    for &position in &positions {
        store
            .remove(position)
            .await
            .map_err(|source| SyncError::Remove {
                tag: tag.clone(),
                position,
                source,
            })?;
        debug!(%tag, position, "Removed rule");
    }

    Ok(positions.len())
}

async fn add<S>(store: &S, ip: IpAddr, tag: &RuleTag) -> Result<(), SyncError>
where
    S: RuleStore + ?Sized,
{
    store.add(ip, tag).await.map_err(|source| SyncError::Add {
        tag: tag.clone(),
        source,
    })
}

/// Holds when there is exactly one rule per redirected port. Rules whose port could not be read
/// may stand in for any port.
fn is_complete(existing: &[FirewallRule]) -> bool {
    let unknown = existing.iter().filter(|r| r.dport.is_none()).count();
    let missing = REDIRECT_PORTS
        .iter()
        .filter(|&&port| !existing.iter().any(|r| r.dport == Some(port)))
        .count();
    existing.len() == REDIRECT_PORTS.len() && missing <= unknown
}

fn descending(rules: &[FirewallRule]) -> Vec<u32> {
    let mut positions = rules.iter().map(|r| r.position).collect::<Vec<_>>();
    positions.sort_unstable_by(|a, b| b.cmp(a));
    positions.dedup();
    positions
}
