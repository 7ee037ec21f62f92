//! Core types for the transparent-proxy redirect controller.
//!
//! Each node runs a controller that keeps the node's NAT redirect chain in line with the pods
//! scheduled onto it. A pod opts in by carrying a marker annotation; the controller then installs a
//! pair of `REDIRECT` rules (ports 443 and 80) whose source is the pod's IP and whose comment is the
//! pod's [`RuleTag`]. There is no persisted mapping between pods and rules: every reconciliation
//! lists the chain and correlates rows by tag.
//!
//! ```text
//! [ WorkloadCache ] -> [ decide ] <- [ RuleStore::inspect ]
//!                          |
//!                          v
//!                [ RuleStore::add / remove ]
//! ```

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod config;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod key;
mod reconcile;
mod rules;
mod workload;

pub use self::{
    cache::WorkloadCache,
    config::{Config, IpChangePolicy, UnmarkedPolicy},
    key::WorkloadKey,
    reconcile::{decide, remove_positions, sync, Decision, SyncError},
    rules::{FirewallRule, RuleStore, RuleTag, StoreError, REDIRECT_PORTS},
    workload::WorkloadRecord,
};
