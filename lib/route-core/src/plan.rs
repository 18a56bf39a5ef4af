//! Route plan computation
//!
//! Turns one routes record into the ordered primitives that install (or
//! remove) everything it implies on this node. Nothing here touches the
//! host; the caller hands in the current main routing table.
//!
//! # Cases
//!
//! - This node hosts the VPN pod: route the remote subnets to the pod, plus
//!   tunnel routes in table 199 for local subnets only reachable over tunl0.
//!   A host-networked pod needs neither the route nor the rule.
//! - Another node hosts the VPN pod: route the remote subnets to that node,
//!   `onlink` when it is in another subnet or behind the tunnel device.
//! - Load balancer connect: SNAT the pod's traffic to the remote gateway onto
//!   the load balancer IP and signal the pod once the rule exists.

use ipnetwork::IpNetwork;
use std::net::{IpAddr, SocketAddr};
use tracing::{debug, info, warn};

use route_api::{RouteRecord, TUNNEL_ROUTE_TABLE};

use crate::facts::{device_to_worker_node, NodeConfig, NodeFacts, RouteEntry};
use crate::ops::{Action, NatRule, Operation, Plan, RouteSpec, RuleSpec};
use crate::topology::{normalize, Topology};
use crate::{CoreError, Result};

/// Planner derives plans from records using fixed node facts
#[derive(Clone, Debug)]
pub struct Planner {
    facts: NodeFacts,
    config: NodeConfig,
}

impl Planner {
    pub fn new(facts: NodeFacts, config: NodeConfig) -> Self {
        Self { facts, config }
    }

    pub fn facts(&self) -> &NodeFacts {
        &self.facts
    }

    /// Tear down `old`, then build up `new`.
    ///
    /// Updates are never diffed in place; the old routes go first so the
    /// kernel never holds both sets.
    pub fn compute_plan(
        &self,
        old: Option<&RouteRecord>,
        new: Option<&RouteRecord>,
        routes: &[RouteEntry],
    ) -> Result<Plan> {
        let mut plan = Plan::new();
        if let Some(old) = old {
            plan.extend(self.plan(Action::Delete, old, routes)?);
        }
        if let Some(new) = new {
            plan.extend(self.plan(Action::Add, new, routes)?);
        }
        Ok(plan)
    }

    /// Plan one direction for one record. Incomplete records plan nothing.
    pub fn plan(&self, action: Action, record: &RouteRecord, routes: &[RouteEntry]) -> Result<Plan> {
        let mut plan = Plan::new();
        let Some(topology) = Topology::decode(record)? else {
            debug!("Route record is incomplete, nothing to {}", action);
            return Ok(plan);
        };

        let remote_subnets = self.remapped_remote_subnets(&topology);
        info!("Attempting to {} routes/rules", action);
        if action == Action::Add {
            self.validate_local_ip_not_in(&remote_subnets)?;
            // existing routes are checked against the subnets before NAT
            let unmapped: Vec<IpNetwork> = topology.remote_subnets.iter().map(|s| normalize(*s)).collect();
            validate_routes_for_remote_subnets(&unmapped, routes)?;
        }

        let on_worker = self.facts.local_ip == topology.worker_node_ip;
        let route_to_remote = if on_worker {
            info!(" - same worker node as the VPN pod: {}", self.facts.local_ip);
            if self.facts.tunnel_present {
                self.plan_vpn_node_tunnels(&mut plan, action, &topology, &remote_subnets);
            }
            if topology.uses_host_network() {
                info!("VPN pod is using host networking.  Additional route is not needed");
                return Ok(plan);
            }
            let vpn_pod_ip = topology.vpn_pod_ip.ok_or_else(|| {
                CoreError::InvalidRecord(format!("vpn pod IP {} is not valid", record.vpn_pod_ip))
            })?;
            self.plan_non_cluster_subnets(&mut plan, action, &topology);
            RouteTarget {
                via: vpn_pod_ip,
                device: topology.vpn_pod_device.clone(),
                onlink: false,
            }
        } else {
            let device = device_to_worker_node(routes, topology.worker_node_ip).ok_or_else(|| {
                info!("Current routes on the node:");
                for route in routes {
                    info!("\t{}", route.line);
                }
                CoreError::WorkerNodeUnreachable(topology.worker_node_ip)
            })?;
            let same_subnet = self.facts.local_subnet == topology.worker_subnet;
            if same_subnet {
                info!(" - same subnet as the VPN pod worker node: {}", self.facts.local_subnet);
            } else {
                info!(
                    " - different subnet than the VPN pod worker node: {} != {}",
                    self.facts.local_subnet, topology.worker_subnet
                );
            }
            let onlink = !same_subnet || device == self.config.tunnel_device;
            RouteTarget {
                via: topology.worker_node_ip,
                device,
                onlink,
            }
        };

        for subnet in &remote_subnets {
            plan.push(Operation::Route(
                action,
                RouteSpec {
                    destination: *subnet,
                    via: Some(route_to_remote.via),
                    device: route_to_remote.device.clone(),
                    onlink: route_to_remote.onlink,
                    table: topology.route_table,
                },
            ));
        }
        plan.push(Operation::Rule(action, RuleSpec::from_all(topology.route_table)));
        plan.push(Operation::ListRules);
        plan.push(Operation::ListRoutes(topology.route_table));
        if on_worker {
            plan.push(Operation::ListRoutes(TUNNEL_ROUTE_TABLE));
        }

        if topology.connect_using_lb {
            self.plan_load_balancer_snat(&mut plan, action, &topology, on_worker);
        }

        if let (Some(gateway), Some(load_balancer)) = (topology.remote_gateway, topology.load_balancer_ip) {
            plan.push(Operation::DeleteConntrack {
                source: gateway,
                destination: load_balancer,
            });
        }

        Ok(plan)
    }

    /// Remote subnets as seen from the cluster, after remote subnet NAT
    fn remapped_remote_subnets(&self, topology: &Topology) -> Vec<IpNetwork> {
        let nat = &self.config.remote_subnet_nat;
        let remapped: Vec<IpNetwork> = topology
            .remote_subnets
            .iter()
            .map(|subnet| normalize(nat.remap(subnet)))
            .collect();
        if !nat.is_empty() {
            let list: Vec<String> = remapped.iter().map(|s| s.to_string()).collect();
            info!(" - remapped remote subnets based on remoteSubnetNAT: {}", list.join(","));
        }
        remapped
    }

    fn validate_local_ip_not_in(&self, remote_subnets: &[IpNetwork]) -> Result<()> {
        match remote_subnets.iter().find(|s| s.contains(self.facts.local_ip)) {
            Some(subnet) => Err(CoreError::LocalAddressInRemoteSubnet {
                subnet: subnet.to_string(),
                ip: self.facts.local_ip,
            }),
            None => Ok(()),
        }
    }

    /// Local subnets behind other nodes that are only reachable over the
    /// tunnel need their own routes in table 199 on the VPN node.
    fn plan_vpn_node_tunnels(&self, plan: &mut Plan, action: Action, topology: &Topology, remote_subnets: &[IpNetwork]) {
        let tunnel_device = &self.config.tunnel_device;
        let candidates = topology
            .local_subnets
            .iter()
            .chain(self.config.local_subnet_nat.originals());

        let mut rule_needed = false;
        for subnet in candidates {
            if normalize(*subnet) == self.facts.local_subnet {
                continue;
            }
            if self.facts.tunnel_needed_to_reach(subnet, tunnel_device) {
                plan.push(Operation::Route(
                    action,
                    RouteSpec {
                        destination: *subnet,
                        via: None,
                        device: tunnel_device.clone(),
                        onlink: false,
                        table: TUNNEL_ROUTE_TABLE,
                    },
                ));
                rule_needed = true;
            }
        }

        if rule_needed {
            for subnet in remote_subnets {
                plan.push(Operation::Rule(action, RuleSpec::from_network(subnet, TUNNEL_ROUTE_TABLE)));
            }
        }
    }

    /// calico does not NAT towards non-cluster local subnets; masquerade them
    fn plan_non_cluster_subnets(&self, plan: &mut Plan, action: Action, topology: &Topology) {
        for subnet in &self.config.non_cluster_subnets {
            if normalize(*subnet) == topology.worker_subnet {
                warn!(
                    "localNonClusterSubnet {} contains the worker node subnet {}",
                    subnet, topology.worker_subnet
                );
                continue;
            }
            if !topology.local_subnets.contains(subnet) {
                warn!("localNonClusterSubnet specified but is not configured as a local subnet {}", subnet);
            }
            plan.push(Operation::Nat(action, NatRule::masquerade(*subnet)));
        }
    }

    fn plan_load_balancer_snat(&self, plan: &mut Plan, action: Action, topology: &Topology, on_worker: bool) {
        let Some(gateway) = topology.remote_gateway else {
            warn!("connectUsingLB set without a valid remote gateway, SNAT rules skipped");
            return;
        };

        if on_worker {
            match (topology.vpn_pod_ip, topology.load_balancer_ip) {
                (Some(pod), Some(load_balancer)) => {
                    plan.push(Operation::Nat(action, NatRule::snat_to_load_balancer(gateway, pod, load_balancer)))
                }
                _ => warn!("connectUsingLB set without a VPN pod IP and load balancer IP, SNAT rule skipped"),
            }
        }
        plan.push(Operation::Nat(action, NatRule::masquerade(IpNetwork::from(gateway))));

        if action == Action::Add && on_worker {
            if let Some(pod) = topology.vpn_pod_ip {
                let addr = SocketAddr::new(pod, self.config.signal_port);
                info!("SNAT rules have been added.  Wake up the vpnPod located here: {}", addr);
                plan.push(Operation::NotifyVpnPod(addr));
            }
        }
    }
}

struct RouteTarget {
    via: IpAddr,
    device: String,
    onlink: bool,
}

/// No route of the node may already claim a subnet we are about to route
pub fn validate_routes_for_remote_subnets(remote_subnets: &[IpNetwork], routes: &[RouteEntry]) -> Result<()> {
    for subnet in remote_subnets {
        if let Some(route) = routes
            .iter()
            .find(|r| r.destination.map(normalize) == Some(*subnet))
        {
            return Err(CoreError::RouteConflict {
                subnet: subnet.to_string(),
                route: route.line.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facts::parse_routes;
    use route_api::SubnetNat;

    const MAIN_TABLE: &str = "default via 10.10.1.1 dev eth0
10.10.1.0/24 dev eth0 proto kernel scope link src 10.10.1.5
172.30.12.0/26 via 10.10.2.4 dev tunl0 proto bird onlink
172.30.13.0/26 via 10.10.1.6 dev eth0 proto bird
";

    fn routes() -> Vec<RouteEntry> {
        parse_routes(MAIN_TABLE)
    }

    fn planner_on(local_ip: &str, local_subnet: &str) -> Planner {
        planner_with(local_ip, local_subnet, NodeConfig::default())
    }

    fn planner_with(local_ip: &str, local_subnet: &str, config: NodeConfig) -> Planner {
        let facts = NodeFacts::new(
            local_ip.parse().unwrap(),
            local_subnet.parse().unwrap(),
            routes(),
            &config.tunnel_device,
        );
        Planner::new(facts, config)
    }

    fn record(worker_ip: &str, worker_subnet: &str) -> RouteRecord {
        RouteRecord {
            connect_using_lb: "false".into(),
            load_balancer_ip: "<pending>".into(),
            local_subnet: "10.10.1.0/24,10.10.2.0/24".into(),
            remote_gateway: "198.51.100.7".into(),
            remote_subnet: "192.168.10.0/24,192.168.20.0/24".into(),
            route_table: "213".into(),
            vpn_pod_device: "cali1234".into(),
            vpn_pod_ip: "172.30.4.9".into(),
            vpn_pod_name: "vpn-strongswan-0".into(),
            worker_node_ip: worker_ip.into(),
            worker_subnet: worker_subnet.into(),
        }
    }

    fn route_ops(plan: &Plan) -> Vec<RouteSpec> {
        plan.routes().map(|(_, r)| r.clone()).collect()
    }

    #[test]
    fn test_incomplete_record_plans_nothing() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        for field in 0..4 {
            let mut r = record("10.10.1.6", "10.10.1.0/24");
            match field {
                0 => r.remote_subnet.clear(),
                1 => r.route_table.clear(),
                2 => r.worker_node_ip.clear(),
                _ => r.worker_subnet.clear(),
            }
            assert!(planner.plan(Action::Add, &r, &routes()).unwrap().is_empty());
            assert!(planner.compute_plan(Some(&r), Some(&r), &routes()).unwrap().is_empty());
        }
    }

    #[test]
    fn test_other_node_same_subnet_not_onlink() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let plan = planner.plan(Action::Add, &record("10.10.1.6", "10.10.1.0/24"), &routes()).unwrap();

        let routes = route_ops(&plan);
        assert_eq!(routes.len(), 2);
        for route in &routes {
            assert_eq!(route.via, Some("10.10.1.6".parse().unwrap()));
            assert_eq!(route.device, "eth0");
            assert!(!route.onlink);
            assert_eq!(route.table, 213);
        }
        assert!(plan.operations().contains(&Operation::Rule(Action::Add, RuleSpec::from_all(213))));
        assert!(!plan.operations().contains(&Operation::ListRoutes(199)));
    }

    #[test]
    fn test_other_node_different_subnet_is_onlink() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let mut routes = routes();
        routes.push(RouteEntry::parse("172.30.14.0/26 via 10.10.3.8 dev eth0 proto bird").unwrap());
        let plan = planner.plan(Action::Add, &record("10.10.3.8", "10.10.3.0/24"), &routes).unwrap();
        assert!(route_ops(&plan).iter().all(|r| r.onlink && r.device == "eth0"));
    }

    #[test]
    fn test_tunnel_device_is_onlink_even_in_same_subnet() {
        let planner = planner_on("10.10.2.9", "10.10.2.0/24");
        let plan = planner.plan(Action::Add, &record("10.10.2.4", "10.10.2.0/24"), &routes()).unwrap();
        assert!(route_ops(&plan).iter().all(|r| r.onlink && r.device == "tunl0"));
    }

    #[test]
    fn test_unreachable_worker_is_error() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let result = planner.plan(Action::Add, &record("10.10.7.7", "10.10.7.0/24"), &routes());
        assert!(matches!(result, Err(CoreError::WorkerNodeUnreachable(_))));
    }

    #[test]
    fn test_worker_node_routes_via_pod() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let plan = planner.plan(Action::Add, &record("10.10.1.5", "10.10.1.0/24"), &routes()).unwrap();

        let routes = route_ops(&plan);
        // 10.10.2.0/24 is behind tunl0, so it gets a table 199 route
        assert!(routes.iter().any(|r| r.table == 199 && r.destination.to_string() == "10.10.2.0/24"));
        let to_pod: Vec<_> = routes.iter().filter(|r| r.table == 213).collect();
        assert_eq!(to_pod.len(), 2);
        assert!(to_pod.iter().all(|r| r.via == Some("172.30.4.9".parse().unwrap()) && r.device == "cali1234"));
        assert!(plan
            .operations()
            .contains(&Operation::Rule(Action::Add, RuleSpec::from_network(&"192.168.10.0/24".parse().unwrap(), 199))));
        assert!(plan.operations().contains(&Operation::ListRoutes(199)));
    }

    #[test]
    fn test_host_network_short_circuit() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let mut r = record("10.10.1.5", "10.10.1.0/24");
        r.vpn_pod_ip = "10.10.1.5".into();
        r.local_subnet = "10.10.1.0/24".into();
        let plan = planner.plan(Action::Add, &r, &routes()).unwrap();
        assert_eq!(plan.routes().count(), 0);
        assert!(plan.mutations().all(|op| !matches!(op, Operation::Route(..))));
    }

    #[test]
    fn test_conflicting_local_route_is_fatal() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let mut routes = routes();
        routes.push(RouteEntry::parse("10.0.5.0/24 via 10.10.1.1 dev eth0").unwrap());
        let mut r = record("10.10.1.6", "10.10.1.0/24");
        r.remote_subnet = "10.0.5.0/24".into();

        let result = planner.plan(Action::Add, &r, &routes);
        assert!(matches!(result, Err(CoreError::RouteConflict { .. })));
        // Tear-down never validates
        assert!(planner.plan(Action::Delete, &r, &routes).is_ok());
    }

    #[test]
    fn test_local_ip_inside_remote_subnet_is_fatal() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let mut r = record("10.10.1.6", "10.10.1.0/24");
        r.remote_subnet = "10.10.0.0/16".into();
        let result = planner.plan(Action::Add, &r, &routes());
        assert!(matches!(result, Err(CoreError::LocalAddressInRemoteSubnet { .. })));
    }

    #[test]
    fn test_remote_subnet_nat_remaps_routes() {
        let config = NodeConfig {
            remote_subnet_nat: SubnetNat::parse("192.168.10.0/24=172.16.10.0/24", "remote").unwrap(),
            ..Default::default()
        };
        let planner = planner_with("10.10.1.5", "10.10.1.0/24", config);
        let plan = planner.plan(Action::Add, &record("10.10.1.6", "10.10.1.0/24"), &routes()).unwrap();
        let destinations: Vec<String> = route_ops(&plan).iter().map(|r| r.destination.to_string()).collect();
        assert_eq!(destinations, vec!["172.16.10.0/24", "192.168.20.0/24"]);
    }

    #[test]
    fn test_remote_subnet_nat_checks_unmapped_conflicts() {
        let config = NodeConfig {
            remote_subnet_nat: SubnetNat::parse("10.0.5.0/24=172.16.5.0/24", "remote").unwrap(),
            ..Default::default()
        };
        let planner = planner_with("10.10.1.5", "10.10.1.0/24", config);
        let mut routes = routes();
        routes.push(RouteEntry::parse("10.0.5.0/24 via 10.10.1.1 dev eth0").unwrap());
        let mut r = record("10.10.1.6", "10.10.1.0/24");
        r.remote_subnet = "10.0.5.0/24".into();

        let result = planner.plan(Action::Add, &r, &routes);
        assert!(matches!(result, Err(CoreError::RouteConflict { ref subnet, .. }) if subnet == "10.0.5.0/24"));

        // a route for the mapped subnet is not a conflict
        let mut routes = self::routes();
        routes.push(RouteEntry::parse("172.16.5.0/24 via 10.10.1.1 dev eth0").unwrap());
        assert!(planner.plan(Action::Add, &r, &routes).is_ok());
    }

    #[test]
    fn test_load_balancer_snat_on_worker() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let mut r = record("10.10.1.5", "10.10.1.0/24");
        r.connect_using_lb = "true".into();
        r.load_balancer_ip = "203.0.113.205".into();
        let plan = planner.plan(Action::Add, &r, &routes()).unwrap();

        let snat = NatRule::snat_to_load_balancer(
            "198.51.100.7".parse().unwrap(),
            "172.30.4.9".parse().unwrap(),
            "203.0.113.205".parse().unwrap(),
        );
        let ops = plan.operations();
        let snat_at = ops.iter().position(|op| *op == Operation::Nat(Action::Add, snat.clone())).unwrap();
        let notify_at = ops
            .iter()
            .position(|op| *op == Operation::NotifyVpnPod("172.30.4.9:4500".parse().unwrap()))
            .unwrap();
        assert!(snat_at < notify_at);
        assert!(ops.contains(&Operation::Nat(Action::Add, NatRule::masquerade("198.51.100.7/32".parse().unwrap()))));
        assert!(ops.contains(&Operation::DeleteConntrack {
            source: "198.51.100.7".parse().unwrap(),
            destination: "203.0.113.205".parse().unwrap(),
        }));

        let teardown = planner.plan(Action::Delete, &r, &routes()).unwrap();
        assert!(!teardown.operations().iter().any(|op| matches!(op, Operation::NotifyVpnPod(_))));
    }

    #[test]
    fn test_load_balancer_masquerade_on_other_nodes() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let mut r = record("10.10.1.6", "10.10.1.0/24");
        r.connect_using_lb = "true".into();
        r.load_balancer_ip = "203.0.113.205".into();
        let plan = planner.plan(Action::Add, &r, &routes()).unwrap();
        let nat: Vec<_> = plan.operations().iter().filter(|op| matches!(op, Operation::Nat(..))).collect();
        assert_eq!(nat.len(), 1);
        assert!(!plan.operations().iter().any(|op| matches!(op, Operation::NotifyVpnPod(_))));
    }

    #[test]
    fn test_non_cluster_subnets_masqueraded_on_worker() {
        let config = NodeConfig {
            non_cluster_subnets: vec!["10.20.0.0/16".parse().unwrap(), "10.10.1.0/24".parse().unwrap()],
            ..Default::default()
        };
        let planner = planner_with("10.10.1.5", "10.10.1.0/24", config);
        let plan = planner.plan(Action::Add, &record("10.10.1.5", "10.10.1.0/24"), &routes()).unwrap();
        let masquerades: Vec<_> = plan
            .operations()
            .iter()
            .filter_map(|op| match op {
                Operation::Nat(Action::Add, rule) => rule.destination,
                _ => None,
            })
            .collect();
        // The worker subnet itself is skipped
        assert_eq!(masquerades, vec!["10.20.0.0/16".parse::<IpNetwork>().unwrap()]);
    }

    #[test]
    fn test_tear_down_mirrors_build_up() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        for r in [record("10.10.1.5", "10.10.1.0/24"), record("10.10.1.6", "10.10.1.0/24")] {
            let mut r = r;
            r.connect_using_lb = "true".into();
            r.load_balancer_ip = "203.0.113.205".into();
            let up = planner.plan(Action::Add, &r, &routes()).unwrap();
            let down = planner.plan(Action::Delete, &r, &routes()).unwrap();

            let reversed: Vec<Operation> = up.operations().iter().filter_map(|op| op.reversed()).collect();
            let down_reversible: Vec<Operation> =
                down.operations().iter().filter(|op| op.reversed().is_some()).cloned().collect();
            assert_eq!(reversed, down_reversible);
        }
    }

    #[test]
    fn test_compute_plan_tears_down_before_building_up() {
        let planner = planner_on("10.10.1.5", "10.10.1.0/24");
        let old = record("10.10.1.6", "10.10.1.0/24");
        let mut new = old.clone();
        new.route_table = "202".into();
        let plan = planner.compute_plan(Some(&old), Some(&new), &routes()).unwrap();

        let actions: Vec<Action> = plan.routes().map(|(a, _)| *a).collect();
        assert_eq!(actions, vec![Action::Delete, Action::Delete, Action::Add, Action::Add]);
    }
}
