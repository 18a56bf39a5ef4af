//! VPN pod side of the routing setup
//!
//! The VPN pod decides the topology every route daemon converges on. It NATs
//! its own traffic, asks calico for IP pools so remote addresses are not
//! masqueraded, publishes the routes record and, when connecting through the
//! load balancer, waits until its node reports the SNAT rule is in place.

use ipnetwork::{IpNetwork, Ipv4Network};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use route_api::nat::is_single_host;
use route_api::{derive_route_table, RouteRecord, SubnetNat, PENDING_LOAD_BALANCER};

use crate::host::TopologyProvider;
use crate::ops::{Action, NatChain, NatRule, NatTarget, Operation, Plan};
use crate::topology::normalize;
use crate::{CoreError, Result};

/// Whether calico should SNAT the pod's traffic towards the remote subnets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PodSnat {
    #[default]
    Enabled,
    Disabled,
    /// Enabled unless the VPN pod IP is one of the local subnets
    Auto,
}

impl FromStr for PodSnat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "true" => Ok(PodSnat::Enabled),
            "false" => Ok(PodSnat::Disabled),
            "auto" => Ok(PodSnat::Auto),
            other => Err(CoreError::InvalidRecord(format!(
                "Invalid value specified for enablePodSNAT: {}",
                other
            ))),
        }
    }
}

impl PodSnat {
    pub fn resolve(self, vpn_pod_ip: IpAddr, local_subnets: &[IpNetwork]) -> bool {
        match self {
            PodSnat::Enabled => true,
            PodSnat::Disabled => false,
            PodSnat::Auto => !local_subnets.iter().any(|s| s.contains(vpn_pod_ip)),
        }
    }
}

/// Tunnel settings of the VPN pod
#[derive(Clone, Debug, Default)]
pub struct PodSettings {
    /// `leftsubnet`, after local subnet NAT
    pub local_subnets: Vec<IpNetwork>,
    /// `rightsubnet`, before remote subnet NAT
    pub remote_subnets: Vec<IpNetwork>,
    pub remote_gateway: String,
    pub local_subnet_nat: SubnetNat,
    pub remote_subnet_nat: SubnetNat,
    pub single_source_ip: bool,
    pub pod_snat: PodSnat,
}

impl PodSettings {
    /// NAT rules applied inside the VPN pod.
    ///
    /// Starts with a flush of the nat table so a restarted container never
    /// stacks a second copy of its rules.
    pub fn subnet_nat_plan(&self) -> Plan {
        let mut plan = Plan::new();
        if self.local_subnet_nat.is_empty() && self.remote_subnet_nat.is_empty() && !self.single_source_ip {
            return plan;
        }
        plan.push(Operation::FlushNat);

        let rules = if !self.local_subnet_nat.is_empty() {
            subnet_nat_rules(&self.local_subnet_nat, &self.remote_subnets)
        } else if self.single_source_ip {
            single_source_ip_rules(&self.local_subnets, &self.remote_subnets)
        } else {
            Vec::new()
        };
        for rule in rules {
            plan.push(Operation::Nat(Action::Add, rule));
        }

        if !self.remote_subnet_nat.is_empty() {
            let subjects = self.remote_nat_subjects();
            for rule in subnet_nat_rules(&self.remote_subnet_nat, &subjects) {
                plan.push(Operation::Nat(Action::Add, rule));
            }
        }
        plan
    }

    /// Local side of the remote NAT rules, in untranslated addresses.
    ///
    /// `local_subnets` carry the post-NAT addresses; map them back, and add
    /// the original side of local rules that match no local subnet.
    pub fn remote_nat_subjects(&self) -> Vec<IpNetwork> {
        if !self.local_subnet_nat.is_empty() {
            let mut subjects: Vec<IpNetwork> = self
                .local_subnet_nat
                .rules()
                .iter()
                .filter(|rule| !self.local_subnets.iter().any(|s| normalize(*s) == normalize(rule.mapped)))
                .map(|rule| rule.original)
                .collect();
            subjects.extend(
                self.local_subnets
                    .iter()
                    .map(|s| self.local_subnet_nat.unmap(s).unwrap_or(*s)),
            );
            subjects
        } else if self.single_source_ip {
            // all traffic leaves with the single source address
            Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0)
                .map(IpNetwork::V4)
                .into_iter()
                .collect()
        } else {
            self.local_subnets.clone()
        }
    }

    /// Remote subnets as the cluster sees them
    pub fn remapped_remote_subnets(&self) -> Vec<IpNetwork> {
        self.remote_subnets
            .iter()
            .map(|s| self.remote_subnet_nat.remap(s))
            .collect()
    }

    /// Subnets that need a calico IP pool
    pub fn pool_subnets(&self, vpn_pod_ip: IpAddr, connect_using_lb: bool) -> Vec<IpNetwork> {
        let mut pools = Vec::new();
        if !self.pod_snat.resolve(vpn_pod_ip, &self.local_subnets) {
            pools.extend(self.remapped_remote_subnets());
        }
        if connect_using_lb {
            match self.remote_gateway.parse::<IpAddr>() {
                Ok(gateway) => pools.push(IpNetwork::from(gateway)),
                Err(_) => warn!("Remote gateway {} is not an IP address, no IP pool created", self.remote_gateway),
            }
        }
        pools
    }

    /// Refuse placements where the pod or its node sits inside a remote subnet
    pub fn validate_placement(&self, placement: &Placement) -> Result<()> {
        for ip in [placement.vpn_pod_ip, placement.worker_node_ip] {
            if let Some(subnet) = self.remote_subnets.iter().find(|s| s.contains(ip)) {
                return Err(CoreError::LocalAddressInRemoteSubnet {
                    subnet: subnet.to_string(),
                    ip,
                });
            }
        }
        Ok(())
    }

    /// The routes record describing this placement
    pub fn route_record(&self, placement: &Placement) -> RouteRecord {
        let connect_using_lb = placement.connect_using_lb && placement.load_balancer_ip != PENDING_LOAD_BALANCER;
        RouteRecord {
            connect_using_lb: connect_using_lb.to_string(),
            load_balancer_ip: placement.load_balancer_ip.clone(),
            local_subnet: join(&self.local_subnets),
            remote_gateway: self.remote_gateway.clone(),
            remote_subnet: join(&self.remote_subnets),
            route_table: derive_route_table(&placement.load_balancer_ip).to_string(),
            vpn_pod_device: placement.vpn_pod_device.clone(),
            vpn_pod_ip: placement.vpn_pod_ip.to_string(),
            vpn_pod_name: placement.vpn_pod_name.clone(),
            worker_node_ip: placement.worker_node_ip.to_string(),
            worker_subnet: placement.worker_subnet.to_string(),
        }
    }
}

/// Where the VPN pod landed
#[derive(Clone, Debug)]
pub struct Placement {
    pub vpn_pod_name: String,
    pub vpn_pod_ip: IpAddr,
    pub vpn_pod_device: String,
    pub worker_node_ip: IpAddr,
    pub worker_subnet: IpNetwork,
    pub load_balancer_ip: String,
    pub connect_using_lb: bool,
}

/// NETMAP both directions, or SNAT when a subnet maps onto a single address
pub fn subnet_nat_rules(nat: &SubnetNat, subjects: &[IpNetwork]) -> Vec<NatRule> {
    let mut rules = Vec::new();
    for subject in subjects {
        for rule in nat.rules() {
            if rule.is_many_to_one() {
                rules.push(NatRule {
                    chain: NatChain::Postrouting,
                    source: Some(rule.original),
                    destination: Some(*subject),
                    protocol: None,
                    target: NatTarget::Snat(rule.mapped.ip()),
                });
            } else {
                rules.push(NatRule {
                    chain: NatChain::Postrouting,
                    source: Some(rule.original),
                    destination: Some(*subject),
                    protocol: None,
                    target: NatTarget::Netmap(rule.mapped),
                });
                rules.push(NatRule {
                    chain: NatChain::Prerouting,
                    source: Some(*subject),
                    destination: Some(rule.mapped),
                    protocol: None,
                    target: NatTarget::Netmap(rule.original),
                });
            }
        }
    }
    rules
}

/// SNAT everything towards the remote subnets onto the single local address
pub fn single_source_ip_rules(local_subnets: &[IpNetwork], remote_subnets: &[IpNetwork]) -> Vec<NatRule> {
    let single = match local_subnets {
        [subnet] if is_single_host(subnet) => subnet.ip(),
        _ => {
            warn!(
                "The local subnet {} is not a single /32 subnet.  Single source IP is not enabled",
                join(local_subnets)
            );
            return Vec::new();
        }
    };
    remote_subnets
        .iter()
        .map(|remote| NatRule {
            chain: NatChain::Postrouting,
            source: None,
            destination: Some(*remote),
            protocol: None,
            target: NatTarget::Snat(single),
        })
        .collect()
}

fn join(subnets: &[IpNetwork]) -> String {
    subnets.iter().map(|s| s.to_string()).collect::<Vec<_>>().join(",")
}

/// Calico IP pools created by this pod, deleted again on exit
pub struct IpPools<P: ?Sized> {
    provider: Arc<P>,
    created: Vec<IpNetwork>,
}

impl<P: TopologyProvider + ?Sized> IpPools<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            created: Vec::new(),
        }
    }

    pub fn created(&self) -> &[IpNetwork] {
        &self.created
    }

    pub async fn create(&mut self, subnets: &[IpNetwork]) -> Result<()> {
        for subnet in subnets {
            info!("   creating IPPool for subnet: {}", subnet);
            self.provider.create_ip_pool(subnet).await?;
            self.created.push(*subnet);
        }
        Ok(())
    }

    /// Delete every pool created so far; failures are logged
    pub async fn cleanup(&mut self) {
        if self.created.is_empty() {
            return;
        }
        info!("Clean up resources allocated in calico");
        for subnet in self.created.drain(..) {
            info!("   deleting IPPool for subnet: {}", subnet);
            if let Err(e) = self.provider.delete_ip_pool(&subnet).await {
                warn!("Failed to delete IPPool {}: {}", subnet, e);
            }
        }
    }
}

/// Listener the route daemon connects to once the SNAT rule exists
pub struct SnatSignal {
    listener: TcpListener,
}

impl SnatSignal {
    /// Bind before publishing the record so the daemon's connect cannot be lost
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port)).await?;
        info!("Listening on {} for the SNAT ready signal", listener.local_addr()?);
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Block until one connection arrives, then close it and the listener
    pub async fn wait(self) -> Result<()> {
        info!("Wait for the route daemon to apply iptables rules on this worker node");
        let (stream, peer) = self.listener.accept().await?;
        info!("Incoming connection from {} received.  Continue with VPN pod start up logic", peer);
        drop(stream);
        Ok(())
    }
}
