use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use std::net::IpAddr;
use tproxy_controller_core::WorkloadRecord;
use tracing::warn;

/// Captures the parts of a pod that the reconciler reads.
pub fn record(pod: &Pod) -> WorkloadRecord {
    let status = pod.status.as_ref();
    WorkloadRecord {
        pod_ip: parse_ip(pod, "podIP", status.and_then(|s| s.pod_ip.as_deref())),
        host_ip: parse_ip(pod, "hostIP", status.and_then(|s| s.host_ip.as_deref())),
        annotations: pod.annotations().clone(),
        terminating: pod.metadata.deletion_timestamp.is_some(),
    }
}

fn parse_ip(pod: &Pod, field: &str, value: Option<&str>) -> Option<IpAddr> {
    let value = value.filter(|v| !v.is_empty())?;
    match value.parse() {
        Ok(ip) => Some(ip),
        Err(error) => {
            warn!(name = %pod.name_any(), field, value, %error, "Ignoring invalid address");
            None
        }
    }
}
