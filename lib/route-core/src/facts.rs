//! What the daemon knows about the node it runs on

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::{error, info, warn};

use route_api::nat::is_single_host;
use route_api::SubnetNat;

use crate::host::{HostNetwork, TopologyProvider};
use crate::topology::{normalize, split_list};
use crate::Result;

/// Route kinds `ip route` prints ahead of the destination
const ROUTE_TYPES: &[&str] = &["unicast", "local", "broadcast", "multicast", "throw", "unreachable", "prohibit", "blackhole", "nat"];

/// One line of `ip route list`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteEntry {
    /// `None` for the default route
    pub destination: Option<IpNetwork>,
    pub via: Option<IpAddr>,
    pub device: Option<String>,
    pub line: String,
}

impl RouteEntry {
    /// Parse one output line; lines with fewer than three words are skipped
    pub fn parse(line: &str) -> Option<Self> {
        let mut words: Vec<&str> = line.split_whitespace().collect();
        if words.len() < 3 {
            return None;
        }
        if ROUTE_TYPES.contains(&words[0]) {
            words.remove(0);
        }

        let destination = match words[0] {
            "default" => None,
            dest => dest.parse::<IpNetwork>().ok(),
        };

        let mut via = None;
        let mut device = None;
        for pair in words.windows(2) {
            match pair[0] {
                "via" => via = pair[1].parse().ok(),
                "dev" => device = Some(pair[1].to_string()),
                _ => {}
            }
        }

        Some(Self {
            destination,
            via,
            device,
            line: line.trim().to_string(),
        })
    }

    pub fn uses_device(&self, device: &str) -> bool {
        self.device.as_deref() == Some(device)
    }
}

/// Parse the full output of `ip route list`
pub fn parse_routes(output: &str) -> Vec<RouteEntry> {
    output.lines().filter_map(RouteEntry::parse).collect()
}

/// One line of `ip rule list`, e.g. `213:\tfrom all lookup 213`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleEntry {
    pub priority: u32,
    pub source: String,
    pub line: String,
}

impl RuleEntry {
    pub fn parse(line: &str) -> Option<Self> {
        let (priority, rest) = line.trim().split_once(':')?;
        let priority = priority.trim().parse().ok()?;
        let words: Vec<&str> = rest.split_whitespace().collect();
        let source = words
            .windows(2)
            .find(|pair| pair[0] == "from")
            .map(|pair| pair[1].to_string())?;
        Some(Self {
            priority,
            source,
            line: line.trim().to_string(),
        })
    }
}

/// Parse the full output of `ip rule list`
pub fn parse_rules(output: &str) -> Vec<RuleEntry> {
    output.lines().filter_map(RuleEntry::parse).collect()
}

/// Static configuration of the route daemon
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Overlay device carrying encapsulated traffic between nodes
    pub tunnel_device: String,
    /// Local subnets outside the cluster that need masquerading
    pub non_cluster_subnets: Vec<IpNetwork>,
    pub local_subnet_nat: SubnetNat,
    pub remote_subnet_nat: SubnetNat,
    /// Port the VPN pod listens on for the SNAT ready signal
    pub signal_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tunnel_device: "tunl0".to_string(),
            non_cluster_subnets: Vec::new(),
            local_subnet_nat: SubnetNat::default(),
            remote_subnet_nat: SubnetNat::default(),
            signal_port: 4500,
        }
    }
}

/// Parse `NON_CLUSTER_SUBNET`. One bad entry disables the whole setting.
pub fn parse_non_cluster_subnets(list: &str) -> Vec<IpNetwork> {
    let mut subnets = Vec::new();
    for subnet in split_list(list) {
        match subnet.parse::<IpNetwork>() {
            Ok(net) => subnets.push(net),
            Err(_) => {
                warn!("Local non cluster subnet {} is not a valid subnet", subnet);
                return Vec::new();
            }
        }
    }
    subnets
}

/// Facts about the local node, gathered once at startup
#[derive(Clone, Debug)]
pub struct NodeFacts {
    pub local_ip: IpAddr,
    pub local_subnet: IpNetwork,
    /// Main routing table as seen at startup
    pub routes: Vec<RouteEntry>,
    /// Whether any startup route used the tunnel device
    pub tunnel_present: bool,
}

impl NodeFacts {
    pub fn new(local_ip: IpAddr, local_subnet: IpNetwork, routes: Vec<RouteEntry>, tunnel_device: &str) -> Self {
        let tunnel_present = routes.iter().any(|r| r.uses_device(tunnel_device));
        Self {
            local_ip,
            local_subnet: normalize(local_subnet),
            routes,
            tunnel_present,
        }
    }

    /// Read the routing table and ask calico for the local subnet
    pub async fn discover<H, P>(host: &H, provider: &P, local_ip: IpAddr, config: &NodeConfig) -> Result<Self>
    where
        H: HostNetwork + ?Sized,
        P: TopologyProvider + ?Sized,
    {
        let routes = match host.list_routes(None).await {
            Ok(routes) => routes,
            Err(e) => {
                error!("Failed to retrieve routing table: {}", e);
                Vec::new()
            }
        };
        info!("Routing Table:");
        for route in &routes {
            info!("\t{}", route.line);
        }

        info!("local IP: {}", local_ip);
        let local_subnet = provider.node_subnet(local_ip).await?;
        info!("local subnet: {}", local_subnet);

        Ok(Self::new(local_ip, local_subnet, routes, &config.tunnel_device))
    }

    /// A subnet needs the tunnel when some tunnel route's gateway sits inside it
    pub fn tunnel_needed_to_reach(&self, subnet: &IpNetwork, tunnel_device: &str) -> bool {
        self.routes.iter().any(|route| {
            route.uses_device(tunnel_device) && route.via.map(|via| subnet.contains(via)).unwrap_or(false)
        })
    }
}

/// Device the node uses to reach `worker`, taken from the last matching route
pub fn device_to_worker_node(routes: &[RouteEntry], worker: IpAddr) -> Option<String> {
    routes
        .iter()
        .filter(|route| {
            route.via == Some(worker)
                || route
                    .destination
                    .map(|dest| dest.ip() == worker && is_single_host(&dest))
                    .unwrap_or(false)
        })
        .filter_map(|route| route.device.clone())
        .last()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = "default via 10.10.1.1 dev eth0 proto dhcp metric 100
10.10.1.0/24 dev eth0 proto kernel scope link src 10.10.1.5
172.30.12.0/26 via 10.10.2.4 dev tunl0 proto bird onlink
172.30.13.0/26 via 10.10.1.6 dev eth0 proto bird
blackhole 172.30.4.0/26 proto bird
172.30.4.9 dev cali1234 scope link
";

    #[test]
    fn test_parse_routes() {
        let routes = parse_routes(ROUTES);
        assert_eq!(routes.len(), 6);
        assert_eq!(routes[0].destination, None);
        assert_eq!(routes[0].via, Some("10.10.1.1".parse().unwrap()));
        assert_eq!(routes[2].device.as_deref(), Some("tunl0"));
        assert_eq!(routes[4].destination, Some("172.30.4.0/26".parse().unwrap()));
        assert_eq!(routes[5].destination, Some("172.30.4.9/32".parse().unwrap()));
    }

    #[test]
    fn test_parse_rules() {
        let rules = parse_rules("0:\tfrom all lookup local\n213:\tfrom all lookup 213\n199:\tfrom 192.168.10.0/24 lookup 199\n\n");
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1].priority, 213);
        assert_eq!(rules[1].source, "all");
        assert_eq!(rules[2].source, "192.168.10.0/24");
    }

    #[test]
    fn test_tunnel_detection() {
        let facts = NodeFacts::new(
            "10.10.1.5".parse().unwrap(),
            "10.10.1.0/24".parse().unwrap(),
            parse_routes(ROUTES),
            "tunl0",
        );
        assert!(facts.tunnel_present);
        assert!(facts.tunnel_needed_to_reach(&"10.10.2.0/24".parse().unwrap(), "tunl0"));
        assert!(!facts.tunnel_needed_to_reach(&"10.10.1.0/24".parse().unwrap(), "tunl0"));

        let facts = NodeFacts::new(
            "10.10.1.5".parse().unwrap(),
            "10.10.1.0/24".parse().unwrap(),
            parse_routes(ROUTES),
            "vxlan.calico",
        );
        assert!(!facts.tunnel_present);
    }

    #[test]
    fn test_device_to_worker_node() {
        let routes = parse_routes(ROUTES);
        assert_eq!(device_to_worker_node(&routes, "10.10.2.4".parse().unwrap()).as_deref(), Some("tunl0"));
        assert_eq!(device_to_worker_node(&routes, "10.10.1.6".parse().unwrap()).as_deref(), Some("eth0"));
        assert_eq!(device_to_worker_node(&routes, "10.10.9.9".parse().unwrap()), None);
    }

    #[test]
    fn test_non_cluster_subnets() {
        assert_eq!(parse_non_cluster_subnets("10.20.0.0/16,10.30.0.0/16").len(), 2);
        assert!(parse_non_cluster_subnets("10.20.0.0/16,nope").is_empty());
        assert!(parse_non_cluster_subnets("").is_empty());
    }
}
