use anyhow::Context;
use clap::Parser;
use ipnetwork::IpNetwork;

use route_api::SubnetNat;
use route_core::topology::split_list;
use route_core::{PodSettings, PodSnat};
use route_kube::{routes_config_map_name, LoadBalancerRequest};

/// Sets up routing for the VPN pod and publishes its placement
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct PodArgs {
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "RELEASE_NAME")]
    pub release_name: String,

    /// Name of this pod
    #[arg(long, env = "POD_NAME")]
    pub pod_name: String,

    /// Load balancer service; defaults to `<release>-strongswan`
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: Option<String>,

    /// External IP requested for the load balancer service
    #[arg(long, env = "LOAD_BALANCER_IP")]
    pub load_balancer_ip: Option<String>,

    /// Connect to the remote gateway from the load balancer IP
    #[arg(long, env = "CONNECT_USING_LB_IP", default_value_t = false)]
    pub connect_using_lb_ip: bool,

    /// true, false or auto; unset behaves like true
    #[arg(long, env = "ENABLE_POD_SNAT", default_value = "")]
    pub enable_pod_snat: String,

    /// SNAT to the single /32 local subnet
    #[arg(long, env = "ENABLE_SINGLE_IP", default_value_t = false)]
    pub enable_single_ip: bool,

    #[arg(long, env = "LOCAL_SUBNET_NAT", default_value = "")]
    pub local_subnet_nat: String,

    #[arg(long, env = "REMOTE_SUBNET_NAT", default_value = "")]
    pub remote_subnet_nat: String,

    /// leftsubnet of the connection
    #[arg(long, env = "LOCAL_SUBNET")]
    pub local_subnet: String,

    /// rightsubnet of the connection
    #[arg(long, env = "REMOTE_SUBNET")]
    pub remote_subnet: String,

    /// right of the connection
    #[arg(long, env = "REMOTE_GATEWAY", default_value = "")]
    pub remote_gateway: String,

    /// auto of the connection: `add` waits for peers, `start` connects out
    #[arg(long, env = "IPSEC_AUTO", default_value = "start")]
    pub ipsec_auto: String,

    #[arg(long, env = "SNAT_SIGNAL_PORT", default_value_t = 4500)]
    pub signal_port: u16,

    /// Log in JSON
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

fn parse_subnets(list: &str, what: &str) -> anyhow::Result<Vec<IpNetwork>> {
    split_list(list)
        .map(|s| {
            s.parse::<IpNetwork>()
                .with_context(|| format!("{} {} is not a valid subnet", what, s))
        })
        .collect()
}

impl PodArgs {
    pub fn config_map_name(&self) -> String {
        routes_config_map_name(&self.release_name)
    }

    pub fn service_name(&self) -> String {
        self.service_name
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| format!("{}-strongswan", self.release_name))
    }

    /// Inbound (`add`) connections never dial out through the load balancer
    pub fn connect_using_lb(&self) -> bool {
        self.connect_using_lb_ip && self.ipsec_auto != "add"
    }

    pub fn load_balancer_request(&self) -> LoadBalancerRequest {
        LoadBalancerRequest {
            requested_ip: self.load_balancer_ip.clone().filter(|ip| !ip.is_empty()),
            ipsec_auto: self.ipsec_auto.clone(),
            connect_using_lb: self.connect_using_lb(),
        }
    }

    pub fn pod_settings(&self) -> anyhow::Result<PodSettings> {
        Ok(PodSettings {
            local_subnets: parse_subnets(&self.local_subnet, "local subnet")?,
            remote_subnets: parse_subnets(&self.remote_subnet, "remote subnet")?,
            remote_gateway: self.remote_gateway.clone(),
            local_subnet_nat: SubnetNat::parse(&self.local_subnet_nat, "local")?,
            remote_subnet_nat: SubnetNat::parse(&self.remote_subnet_nat, "remote")?,
            single_source_ip: self.enable_single_ip,
            pod_snat: self.enable_pod_snat.parse::<PodSnat>()?,
        })
    }
}
