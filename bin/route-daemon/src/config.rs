use std::net::IpAddr;

use clap::Parser;

use route_api::SubnetNat;
use route_core::facts::parse_non_cluster_subnets;
use route_core::NodeConfig;
use route_kube::routes_config_map_name;

/// Keeps this node's routes pointed at the VPN pod
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct DaemonArgs {
    /// IP of this node; the daemon runs with host networking
    #[arg(long, env = "POD_IP")]
    pub pod_ip: IpAddr,

    /// Namespace of the VPN release
    #[arg(long, env = "NAMESPACE")]
    pub namespace: String,

    #[arg(long, env = "RELEASE_NAME")]
    pub release_name: String,

    /// Local subnets outside the cluster network, comma separated
    #[arg(long, env = "NON_CLUSTER_SUBNET", default_value = "")]
    pub non_cluster_subnet: String,

    /// Local subnet NAT rules, `original=mapped,...`
    #[arg(long, env = "LOCAL_SUBNET_NAT", default_value = "")]
    pub local_subnet_nat: String,

    /// Remote subnet NAT rules, `original=mapped,...`
    #[arg(long, env = "REMOTE_SUBNET_NAT", default_value = "")]
    pub remote_subnet_nat: String,

    /// Overlay device between nodes
    #[arg(long, env = "TUNNEL_DEVICE", default_value = "tunl0")]
    pub tunnel_device: String,

    /// Port the VPN pod listens on for the SNAT ready signal
    #[arg(long, env = "SNAT_SIGNAL_PORT", default_value_t = 4500)]
    pub signal_port: u16,

    /// Log in JSON
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl DaemonArgs {
    pub fn config_map_name(&self) -> String {
        routes_config_map_name(&self.release_name)
    }

    /// Malformed NAT rules are fatal; a bad non-cluster subnet only disables that setting
    pub fn node_config(&self) -> anyhow::Result<NodeConfig> {
        Ok(NodeConfig {
            tunnel_device: self.tunnel_device.clone(),
            non_cluster_subnets: parse_non_cluster_subnets(&self.non_cluster_subnet),
            local_subnet_nat: SubnetNat::parse(&self.local_subnet_nat, "local")?,
            remote_subnet_nat: SubnetNat::parse(&self.remote_subnet_nat, "remote")?,
            signal_port: self.signal_port,
        })
    }
}
