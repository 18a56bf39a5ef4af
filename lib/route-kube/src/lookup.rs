//! VPN pod and load balancer service lookups

use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

use route_api::PENDING_LOAD_BALANCER;
use route_core::{CoreError, Result};

use crate::KubeClient;

const POD_RETRY_COUNT: u32 = 10;
const SERVICE_RETRY_COUNT: u32 = 5;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Addresses of a scheduled pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodInfo {
    pub pod_ip: IpAddr,
    pub host_ip: IpAddr,
}

/// How the VPN pod asks for its load balancer IP
#[derive(Clone, Debug, Default)]
pub struct LoadBalancerRequest {
    /// Specific IP requested for the service, if any
    pub requested_ip: Option<String>,
    /// `ipsec.conf` auto value: `start` connects out, `add` waits for peers
    pub ipsec_auto: String,
    pub connect_using_lb: bool,
}

impl LoadBalancerRequest {
    /// An outbound connection that neither requested an IP nor connects
    /// through the load balancer does not wait for one
    pub fn waits_for_ip(&self) -> bool {
        !(self.ipsec_auto == "start" && self.requested_ip.is_none() && !self.connect_using_lb)
    }

    /// Outcome once no IP was assigned
    pub fn unassigned(&self) -> Result<String> {
        if let Some(requested) = &self.requested_ip {
            return Err(CoreError::Internal(format!(
                "Load balancer service was not assigned the requested external IP: {}",
                requested
            )));
        }
        if self.ipsec_auto == "add" {
            return Err(CoreError::Internal(
                "Load balancer VPN service was not assigned a public IP".to_string(),
            ));
        }
        Ok(PENDING_LOAD_BALANCER.to_string())
    }
}

/// The last attempt accepts the pod in any phase
fn pod_ready(phase: Option<&str>, attempt: u32) -> bool {
    phase == Some("Running") || attempt >= POD_RETRY_COUNT
}

fn parse_ip(value: Option<&String>, what: &str, pod: &str) -> Result<IpAddr> {
    value
        .and_then(|ip| ip.parse().ok())
        .ok_or_else(|| CoreError::Internal(format!("pod {} has no valid {}: {:?}", pod, what, value)))
}

impl KubeClient {
    /// Wait for the pod to run and return its IP and its node's IP
    pub async fn pod_info(&self, name: &str) -> Result<PodInfo> {
        let api = self.pods();
        let mut attempt = 1;
        loop {
            let pod = api.get(name).await?;
            let status = pod.status.unwrap_or_default();
            if pod_ready(status.phase.as_deref(), attempt) {
                return Ok(PodInfo {
                    pod_ip: parse_ip(status.pod_ip.as_ref(), "pod IP", name)?,
                    host_ip: parse_ip(status.host_ip.as_ref(), "host IP", name)?,
                });
            }
            info!("   pod <{}> has status: {}", name, status.phase.unwrap_or_default());
            attempt += 1;
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// External IP of the VPN service, or `<pending>` when none is needed yet
    pub async fn load_balancer_ip(&self, service: &str, request: &LoadBalancerRequest) -> Result<String> {
        let api = self.services();
        for _ in 0..SERVICE_RETRY_COUNT {
            let svc = api.get(service).await?;
            let ingress_ip = svc
                .status
                .and_then(|s| s.load_balancer)
                .and_then(|lb| lb.ingress)
                .and_then(|ingress| ingress.into_iter().next())
                .and_then(|ingress| ingress.ip);
            if let Some(ip) = ingress_ip {
                return Ok(ip);
            }
            if !request.waits_for_ip() {
                break;
            }
            info!("   load balancer ip: {}", PENDING_LOAD_BALANCER);
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
        request.unassigned()
    }
}
