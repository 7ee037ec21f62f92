#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use tproxy_controller_core as core;
pub use tproxy_controller_iptables as iptables;
pub use tproxy_controller_k8s_index as index;
pub use tproxy_controller_queue as queue;

mod args;
mod controller;
mod metrics;
pub mod trigger;

pub use self::{
    args::Args,
    controller::{Controller, DEFAULT_MAX_RETRIES},
    metrics::ControllerMetrics,
};
