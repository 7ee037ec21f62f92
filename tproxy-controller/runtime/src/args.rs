use crate::{
    controller::Controller,
    core::{Config, IpChangePolicy, UnmarkedPolicy},
    index::Index,
    iptables::{Iptables, IptablesConfig},
    metrics::ControllerMetrics,
    queue::{self, RateLimiter, WorkQueue},
    trigger,
};
use anyhow::{bail, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tracing::{error, info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "tproxy-controller",
    about = "Redirects annotated pods' traffic through a local transparent proxy"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "tproxy=info,warn",
        env = "TPROXY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace whose pods are watched.
    #[clap(long, default_value = "default", env = "TPROXY_NAMESPACE")]
    namespace: String,

    /// The annotation that opts a pod into redirection.
    #[clap(
        long,
        default_value = "initializer.kubernetes.io/tproxy",
        env = "TPROXY_ANNOTATION"
    )]
    annotation: String,

    /// The address of the node this controller runs on.
    #[clap(long, env = "NODE_IP")]
    node_ip: IpAddr,

    /// The local port that redirected traffic is sent to.
    #[clap(long, default_value = "8080")]
    redirect_port: u16,

    #[clap(long, default_value = "PREROUTING")]
    chain: String,

    #[clap(long, default_value = "iptables")]
    iptables: String,

    #[clap(long, default_value = "10000")]
    iptables_timeout_ms: u64,

    #[clap(long, default_value = "1")]
    workers: usize,

    /// The number of times a failing pod is retried before it is dropped.
    #[clap(long, default_value = "5")]
    max_retries: u32,

    #[clap(long, default_value = "5")]
    retry_base_delay_ms: u64,

    #[clap(long, default_value = "1000000")]
    retry_max_delay_ms: u64,

    /// Removes a pod's rules as soon as it loses the annotation.
    #[clap(long)]
    remove_unmarked: bool,

    /// Replaces a pod's rules when its IP no longer matches their source.
    #[clap(long)]
    resync_on_ip_change: bool,

    /// Serves the manual trigger endpoint on this address.
    #[clap(long)]
    trigger_addr: Option<SocketAddr>,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            namespace,
            annotation,
            node_ip,
            redirect_port,
            chain,
            iptables,
            iptables_timeout_ms,
            workers,
            max_retries,
            retry_base_delay_ms,
            retry_max_delay_ms,
            remove_unmarked,
            resync_on_ip_change,
            trigger_addr,
        } = self;

        let queue = WorkQueue::new(RateLimiter::exponential(
            Duration::from_millis(retry_base_delay_ms),
            Duration::from_millis(retry_max_delay_ms),
        ));

        let mut prom = <Registry>::default();
        let controller_metrics =
            ControllerMetrics::register(prom.sub_registry_with_prefix("controller"));
        queue::metrics::register(prom.sub_registry_with_prefix("queue"), queue.clone());
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let config = Config {
            node_ip,
            marker: annotation,
            unmarked: if remove_unmarked {
                UnmarkedPolicy::Remove
            } else {
                UnmarkedPolicy::Retain
            },
            ip_change: if resync_on_ip_change {
                IpChangePolicy::Resync
            } else {
                IpChangePolicy::Retain
            },
        };
        info!(%node_ip, %namespace, marker = %config.marker, "Processing pods on this node");

        let store = Arc::new(Iptables::new(IptablesConfig {
            program: iptables,
            chain,
            redirect_port,
            timeout: Duration::from_millis(iptables_timeout_ms),
            ..IptablesConfig::default()
        }));

        // Build the pod index and feed it from a watch on the configured namespace.
        let index = Index::shared(queue.clone());
        let synced = index.read().synced();
        let pods = runtime.watch_namespaced::<Pod>(namespace, watcher::Config::default());
        tokio::spawn(
            kubert::index::namespaced(index.clone(), pods).instrument(info_span!("pods")),
        );

        if let Some(addr) = trigger_addr {
            let store = store.clone();
            let shutdown = runtime.shutdown_handle();
            tokio::spawn(
                async move {
                    if let Err(error) = trigger::serve(addr, store, shutdown).await {
                        error!(%error, "Trigger server failed");
                    }
                }
                .instrument(info_span!("trigger")),
            );
        }

        let controller = Controller::new(queue.clone(), index, store, config, controller_metrics)
            .with_max_retries(max_retries);
        let workers = tokio::spawn(
            controller
                .run(workers, synced)
                .instrument(info_span!("controller")),
        );

        // Once shutdown is signaled, stop handing out keys and hold the process open until every
        // worker has finished its current pass.
        let shutdown = runtime.shutdown_handle();
        tokio::spawn(async move {
            let release = shutdown.signaled().await;
            queue.shut_down();
            if let Err(error) = release.release_after(workers).await {
                error!(%error, "Controller failed");
            }
        });

        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
