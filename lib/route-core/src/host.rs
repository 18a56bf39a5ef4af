//! Collaborator seams: the OS primitive executor and the topology provider

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};

use crate::facts::{RouteEntry, RuleEntry};
use crate::ops::{Action, NatRule, RouteSpec, RuleSpec};
use crate::Result;

/// Executes single kernel routing/NAT primitives.
///
/// Implementations log the literal command they run. They do not deduplicate;
/// the [`Applier`](crate::Applier) checks existing state where the kernel
/// would not.
#[async_trait]
pub trait HostNetwork: Send + Sync {
    async fn add_route(&self, route: &RouteSpec) -> Result<()>;

    async fn del_route(&self, route: &RouteSpec) -> Result<()>;

    async fn add_rule(&self, rule: &RuleSpec) -> Result<()>;

    async fn del_rule(&self, rule: &RuleSpec) -> Result<()>;

    async fn list_rules(&self) -> Result<Vec<RuleEntry>>;

    /// Routes of `table`, or of the main table for `None`
    async fn list_routes(&self, table: Option<u32>) -> Result<Vec<RouteEntry>>;

    async fn nat_rule_exists(&self, rule: &NatRule) -> Result<bool>;

    async fn apply_nat(&self, action: Action, rule: &NatRule) -> Result<()>;

    async fn flush_nat(&self) -> Result<()>;

    /// Drop tracked UDP connections from `source` to `destination`
    async fn delete_conntrack(&self, source: IpAddr, destination: IpAddr) -> Result<()>;

    /// Open and close a TCP connection to `addr`
    async fn notify(&self, addr: SocketAddr) -> Result<()>;
}

/// Node and pool facts backed by calico
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Subnet of the node owning `ip`
    async fn node_subnet(&self, ip: IpAddr) -> Result<IpNetwork>;

    /// Host side interface of the calling pod
    async fn pod_interface(&self) -> Result<String>;

    async fn create_ip_pool(&self, subnet: &IpNetwork) -> Result<()>;

    async fn delete_ip_pool(&self, subnet: &IpNetwork) -> Result<()>;
}
