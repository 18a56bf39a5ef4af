//! In-memory host used by the unit tests

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use crate::facts::{RouteEntry, RuleEntry};
use crate::host::{HostNetwork, TopologyProvider};
use crate::ops::{Action, NatRule, Operation, RouteSpec, RuleSpec};
use crate::{CoreError, Result};

#[derive(Default)]
struct State {
    main_routes: Vec<RouteEntry>,
    /// Keyed like the kernel: one route per destination and table
    routes: BTreeMap<(String, u32), RouteSpec>,
    /// The kernel keeps duplicate rules
    rules: Vec<RuleSpec>,
    nat: Vec<NatRule>,
    conntrack_deletes: Vec<(IpAddr, IpAddr)>,
    notified: Vec<SocketAddr>,
    mutations: Vec<Operation>,
    fail_routes: bool,
}

/// FakeHost models kernel routing and NAT state
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<State>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_main_routes(routes: Vec<RouteEntry>) -> Self {
        let host = Self::new();
        host.state.lock().unwrap().main_routes = routes;
        host
    }

    pub fn fail_routes(&self, fail: bool) {
        self.state.lock().unwrap().fail_routes = fail;
    }

    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state.lock().unwrap().routes.values().cloned().collect()
    }

    pub fn rules(&self) -> Vec<RuleSpec> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn nat_rules(&self) -> Vec<NatRule> {
        self.state.lock().unwrap().nat.clone()
    }

    pub fn notified(&self) -> Vec<SocketAddr> {
        self.state.lock().unwrap().notified.clone()
    }

    pub fn conntrack_deletes(&self) -> Vec<(IpAddr, IpAddr)> {
        self.state.lock().unwrap().conntrack_deletes.clone()
    }

    /// Every state changing primitive, in call order
    pub fn mutations(&self) -> Vec<Operation> {
        self.state.lock().unwrap().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.state.lock().unwrap().mutations.clear();
    }
}

fn key(route: &RouteSpec) -> (String, u32) {
    (route.destination.to_string(), route.table)
}

#[async_trait]
impl HostNetwork for FakeHost {
    async fn add_route(&self, route: &RouteSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.fail_routes {
            return Err(CoreError::CommandFailed("RTNETLINK answers: Network is unreachable".into()));
        }
        state.mutations.push(Operation::Route(Action::Add, route.clone()));
        if state.routes.contains_key(&key(route)) {
            return Err(CoreError::CommandFailed("RTNETLINK answers: File exists".into()));
        }
        state.routes.insert(key(route), route.clone());
        Ok(())
    }

    async fn del_route(&self, route: &RouteSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(Operation::Route(Action::Delete, route.clone()));
        state
            .routes
            .remove(&key(route))
            .map(|_| ())
            .ok_or_else(|| CoreError::CommandFailed("RTNETLINK answers: No such process".into()))
    }

    async fn add_rule(&self, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(Operation::Rule(Action::Add, rule.clone()));
        state.rules.push(rule.clone());
        Ok(())
    }

    async fn del_rule(&self, rule: &RuleSpec) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(Operation::Rule(Action::Delete, rule.clone()));
        match state.rules.iter().position(|r| r == rule) {
            Some(index) => {
                state.rules.remove(index);
                Ok(())
            }
            None => Err(CoreError::CommandFailed("RTNETLINK answers: No such file or directory".into())),
        }
    }

    async fn list_rules(&self) -> Result<Vec<RuleEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .rules
            .iter()
            .map(|r| RuleEntry {
                priority: r.priority(),
                source: r.source.clone(),
                line: format!("{}:\tfrom {} lookup {}", r.priority(), r.source, r.table),
            })
            .collect())
    }

    async fn list_routes(&self, table: Option<u32>) -> Result<Vec<RouteEntry>> {
        let state = self.state.lock().unwrap();
        let Some(table) = table else {
            return Ok(state.main_routes.clone());
        };
        Ok(state
            .routes
            .values()
            .filter(|r| r.table == table)
            .map(|r| RouteEntry {
                destination: Some(r.destination),
                via: r.via,
                device: Some(r.device.clone()),
                line: r.to_string(),
            })
            .collect())
    }

    async fn nat_rule_exists(&self, rule: &NatRule) -> Result<bool> {
        Ok(self.state.lock().unwrap().nat.contains(rule))
    }

    async fn apply_nat(&self, action: Action, rule: &NatRule) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(Operation::Nat(action, rule.clone()));
        match action {
            Action::Add => state.nat.push(rule.clone()),
            Action::Delete => match state.nat.iter().position(|r| r == rule) {
                Some(index) => {
                    state.nat.remove(index);
                }
                None => return Err(CoreError::CommandFailed("iptables: Bad rule".into())),
            },
        }
        Ok(())
    }

    async fn flush_nat(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(Operation::FlushNat);
        state.nat.clear();
        Ok(())
    }

    async fn delete_conntrack(&self, source: IpAddr, destination: IpAddr) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(Operation::DeleteConntrack { source, destination });
        state.conntrack_deletes.push((source, destination));
        Ok(())
    }

    async fn notify(&self, addr: SocketAddr) -> Result<()> {
        self.state.lock().unwrap().notified.push(addr);
        Ok(())
    }
}

/// FakeCalico hands out a fixed node subnet and records IP pools
#[derive(Default)]
pub struct FakeCalico {
    pub node_subnet: Option<IpNetwork>,
    pools: Mutex<Vec<IpNetwork>>,
}

impl FakeCalico {
    pub fn with_node_subnet(subnet: &str) -> Self {
        Self {
            node_subnet: subnet.parse().ok(),
            pools: Mutex::new(Vec::new()),
        }
    }

    pub fn pools(&self) -> Vec<IpNetwork> {
        self.pools.lock().unwrap().clone()
    }
}

#[async_trait]
impl TopologyProvider for FakeCalico {
    async fn node_subnet(&self, ip: IpAddr) -> Result<IpNetwork> {
        self.node_subnet
            .ok_or_else(|| CoreError::CommandFailed(format!("Failed to retrieve node subnet for {}", ip)))
    }

    async fn pod_interface(&self) -> Result<String> {
        Ok("cali1234".to_string())
    }

    async fn create_ip_pool(&self, subnet: &IpNetwork) -> Result<()> {
        self.pools.lock().unwrap().push(*subnet);
        Ok(())
    }

    async fn delete_ip_pool(&self, subnet: &IpNetwork) -> Result<()> {
        self.pools.lock().unwrap().retain(|p| p != subnet);
        Ok(())
    }
}
