use crate::WorkloadKey;
use std::{fmt, net::IpAddr, num::ParseIntError, sync::Arc, time::Duration};
use thiserror::Error;

/// The destination ports redirected for each workload, in the order they are appended.
pub const REDIRECT_PORTS: [u16; 2] = [443, 80];

/// The comment embedded in each of a workload's rules.
///
/// Tags are derived from the workload name alone, so they are only unique within the single
/// namespace that a controller watches. A tag longer than [`RuleTag::MAX_LEN`] bytes cannot be
/// stored as a rule comment; workloads with such names are never redirected.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct RuleTag(String);

/// A tagged row of the redirect chain, as rendered by the rule store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FirewallRule {
    /// The 1-based line number of the rule. Removing a rule renumbers every rule below it.
    pub position: u32,
    pub tag: RuleTag,
    pub source: Option<IpAddr>,
    pub dport: Option<u16>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("{command} failed with {status}: {stderr}")]
    Exit {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("invalid rule position {text:?}: {source}")]
    Position {
        text: String,
        #[source]
        source: ParseIntError,
    },
}

/// Reads and mutates the redirect chain.
///
/// Every call is a single, independent invocation against the host; implementations hold no state
/// between calls.
#[async_trait::async_trait]
pub trait RuleStore: Send + Sync {
    /// Lists the rules carrying `tag`, most recent position first.
    async fn inspect(&self, tag: &RuleTag) -> Result<Vec<FirewallRule>, StoreError>;

    /// Appends a redirect rule for each of [`REDIRECT_PORTS`] with `ip` as the source.
    async fn add(&self, ip: IpAddr, tag: &RuleTag) -> Result<(), StoreError>;

    /// Deletes the rule at the given 1-based position.
    async fn remove(&self, position: u32) -> Result<(), StoreError>;
}

// === impl RuleTag ===

impl RuleTag {
    pub const PREFIX: &'static str = "tproxy-";

    /// The longest comment the kernel's comment match accepts.
    pub const MAX_LEN: usize = 255;

    pub fn for_workload(name: &str) -> Self {
        Self(format!("{}{}", Self::PREFIX, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn fits_comment(&self) -> bool {
        self.0.len() <= Self::MAX_LEN
    }
}

impl From<&WorkloadKey> for RuleTag {
    fn from(key: &WorkloadKey) -> Self {
        Self::for_workload(&key.name)
    }
}

impl fmt::Display for RuleTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// === impl RuleStore ===

#[async_trait::async_trait]
impl<S: RuleStore + ?Sized> RuleStore for Arc<S> {
    async fn inspect(&self, tag: &RuleTag) -> Result<Vec<FirewallRule>, StoreError> {
        (**self).inspect(tag).await
    }

    async fn add(&self, ip: IpAddr, tag: &RuleTag) -> Result<(), StoreError> {
        (**self).add(ip, tag).await
    }

    async fn remove(&self, position: u32) -> Result<(), StoreError> {
        (**self).remove(position).await
    }
}
