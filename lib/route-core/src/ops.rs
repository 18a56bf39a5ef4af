//! Route, rule and NAT primitives produced by the planner

use ipnetwork::IpNetwork;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// Add or delete; renders the way `ip` spells it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Action {
    Add,
    Delete,
}

impl Action {
    pub fn reversed(self) -> Self {
        match self {
            Action::Add => Action::Delete,
            Action::Delete => Action::Add,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Add => write!(f, "add"),
            Action::Delete => write!(f, "del"),
        }
    }
}

/// A kernel route in a policy routing table
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    pub destination: IpNetwork,
    /// Gateway; `None` for device routes
    pub via: Option<IpAddr>,
    pub device: String,
    pub onlink: bool,
    pub table: u32,
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(via) = self.via {
            write!(f, " via {}", via)?;
        }
        write!(f, " dev {}", self.device)?;
        if self.onlink {
            write!(f, " onlink")?;
        }
        write!(f, " table {}", self.table)
    }
}

/// A policy rule selecting `table` for traffic from `source`
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    /// `all`, a bare address, or a CIDR
    pub source: String,
    pub table: u32,
}

impl RuleSpec {
    pub fn from_all(table: u32) -> Self {
        Self {
            source: "all".to_string(),
            table,
        }
    }

    /// `ip rule list` shows /32 sources as bare addresses, so strip it here
    pub fn from_network(source: &IpNetwork, table: u32) -> Self {
        let text = source.to_string();
        let source = text.strip_suffix("/32").unwrap_or(&text).to_string();
        Self { source, table }
    }

    /// Rules are installed with priority equal to their table id
    pub fn priority(&self) -> u32 {
        self.table
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "from {} table {}", self.source, self.table)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NatChain {
    Prerouting,
    Postrouting,
}

impl fmt::Display for NatChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NatChain::Prerouting => write!(f, "PREROUTING"),
            NatChain::Postrouting => write!(f, "POSTROUTING"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NatTarget {
    Masquerade,
    Snat(IpAddr),
    Netmap(IpNetwork),
}

/// One rule in the iptables `nat` table
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NatRule {
    pub chain: NatChain,
    pub source: Option<IpNetwork>,
    pub destination: Option<IpNetwork>,
    pub protocol: Option<String>,
    pub target: NatTarget,
}

impl NatRule {
    /// Masquerade traffic to `destination`; calico does not NAT towards it
    pub fn masquerade(destination: IpNetwork) -> Self {
        Self {
            chain: NatChain::Postrouting,
            source: None,
            destination: Some(destination),
            protocol: None,
            target: NatTarget::Masquerade,
        }
    }

    /// SNAT the VPN pod's IKE/ESP traffic to the remote gateway onto the load balancer IP
    pub fn snat_to_load_balancer(remote_gateway: IpAddr, vpn_pod_ip: IpAddr, load_balancer_ip: IpAddr) -> Self {
        Self {
            chain: NatChain::Postrouting,
            source: Some(IpNetwork::from(vpn_pod_ip)),
            destination: Some(IpNetwork::from(remote_gateway)),
            protocol: Some("udp".to_string()),
            target: NatTarget::Snat(load_balancer_ip),
        }
    }
}

impl fmt::Display for NatRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.chain)?;
        if let Some(source) = &self.source {
            write!(f, " -s {}", source)?;
        }
        if let Some(destination) = &self.destination {
            write!(f, " -d {}", destination)?;
        }
        if let Some(protocol) = &self.protocol {
            write!(f, " -p {}", protocol)?;
        }
        match &self.target {
            NatTarget::Masquerade => write!(f, " -j MASQUERADE"),
            NatTarget::Snat(to) => write!(f, " -j SNAT --to {}", to),
            NatTarget::Netmap(to) => write!(f, " -j NETMAP --to {}", to),
        }
    }
}

/// One step of a plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Route(Action, RouteSpec),
    Rule(Action, RuleSpec),
    Nat(Action, NatRule),
    FlushNat,
    DeleteConntrack { source: IpAddr, destination: IpAddr },
    /// Tell the VPN pod its SNAT rule is in place
    NotifyVpnPod(SocketAddr),
    ListRules,
    ListRoutes(u32),
}

impl Operation {
    /// Operations that change kernel routing or NAT state
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::Route(..)
                | Operation::Rule(..)
                | Operation::Nat(..)
                | Operation::FlushNat
                | Operation::DeleteConntrack { .. }
        )
    }

    /// The opposite primitive, for operations that have one
    pub fn reversed(&self) -> Option<Operation> {
        match self {
            Operation::Route(a, r) => Some(Operation::Route(a.reversed(), r.clone())),
            Operation::Rule(a, r) => Some(Operation::Rule(a.reversed(), r.clone())),
            Operation::Nat(a, n) => Some(Operation::Nat(a.reversed(), n.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Route(a, r) => write!(f, "ip route {} {}", a, r),
            Operation::Rule(a, r) => write!(f, "ip rule {} {}", a, r),
            Operation::Nat(Action::Add, n) => write!(f, "iptables -t nat -A {}", n),
            Operation::Nat(Action::Delete, n) => write!(f, "iptables -t nat -D {}", n),
            Operation::FlushNat => write!(f, "iptables --flush -t nat"),
            Operation::DeleteConntrack { source, destination } => {
                write!(f, "conntrack -D -s {} -d {} -p udp", source, destination)
            }
            Operation::NotifyVpnPod(addr) => write!(f, "notify vpn pod {}", addr),
            Operation::ListRules => write!(f, "ip rule list"),
            Operation::ListRoutes(table) => write!(f, "ip route list table {}", table),
        }
    }
}

/// Ordered list of operations for one reconciliation step
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plan {
    operations: Vec<Operation>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn extend(&mut self, other: Plan) {
        self.operations.extend(other.operations);
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Route operations only
    pub fn routes(&self) -> impl Iterator<Item = (&Action, &RouteSpec)> {
        self.operations.iter().filter_map(|op| match op {
            Operation::Route(a, r) => Some((a, r)),
            _ => None,
        })
    }

    pub fn mutations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(|op| op.is_mutation())
    }
}

impl From<Vec<Operation>> for Plan {
    fn from(operations: Vec<Operation>) -> Self {
        Self { operations }
    }
}
