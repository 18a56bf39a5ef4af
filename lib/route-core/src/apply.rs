//! Executes plans against the host
//!
//! Each primitive is attempted once. Failures are logged and counted, never
//! retried; the next record delivery is what corrects a node.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::host::HostNetwork;
use crate::ops::{Action, NatRule, Operation, Plan, RuleSpec};

/// Outcome counts of one plan execution
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Applied,
    Skipped,
    Failed,
}

/// Applier runs operations in order against a [`HostNetwork`]
pub struct Applier<H: ?Sized> {
    host: Arc<H>,
}

impl<H: HostNetwork + ?Sized> Applier<H> {
    pub fn new(host: Arc<H>) -> Self {
        Self { host }
    }

    pub fn host(&self) -> &Arc<H> {
        &self.host
    }

    pub async fn apply(&self, plan: &Plan) -> ApplyReport {
        let mut report = ApplyReport::default();
        for operation in plan.operations() {
            match self.apply_one(operation).await {
                Outcome::Applied => report.applied += 1,
                Outcome::Skipped => report.skipped += 1,
                Outcome::Failed => report.failed += 1,
            }
        }
        report
    }

    async fn apply_one(&self, operation: &Operation) -> Outcome {
        match operation {
            Operation::Route(action, route) => {
                info!("{}", operation);
                let result = match action {
                    Action::Add => self.host.add_route(route).await,
                    Action::Delete => self.host.del_route(route).await,
                };
                self.outcome(operation, result)
            }
            Operation::Rule(action, rule) => self.apply_rule(*action, rule).await,
            Operation::Nat(action, rule) => self.apply_nat(*action, rule).await,
            Operation::FlushNat => {
                info!("{}", operation);
                let result = self.host.flush_nat().await;
                self.outcome(operation, result)
            }
            Operation::DeleteConntrack { source, destination } => {
                info!("{}", operation);
                let result = self.host.delete_conntrack(*source, *destination).await;
                self.outcome(operation, result)
            }
            Operation::NotifyVpnPod(addr) => match self.host.notify(*addr).await {
                Ok(()) => Outcome::Applied,
                Err(e) => {
                    error!("Failed to connect to the VPN pod {}: {}", addr, e);
                    Outcome::Failed
                }
            },
            Operation::ListRules => {
                info!("ip rules list");
                match self.host.list_rules().await {
                    Ok(rules) => {
                        for rule in rules {
                            info!("\t{}", rule.line);
                        }
                        Outcome::Applied
                    }
                    Err(e) => {
                        error!("Failed to retrieve rule list: {}", e);
                        Outcome::Failed
                    }
                }
            }
            Operation::ListRoutes(table) => {
                info!("ip route list table {}", table);
                match self.host.list_routes(Some(*table)).await {
                    Ok(routes) => {
                        for route in routes {
                            info!("\t{}", route.line);
                        }
                        Outcome::Applied
                    }
                    Err(e) => {
                        error!("Failed to retrieve routing table {}: {}", table, e);
                        Outcome::Failed
                    }
                }
            }
        }
    }

    /// The kernel accepts duplicate rules, so check `ip rule list` first.
    /// A `from all` rule stays while its table still holds routes.
    async fn apply_rule(&self, action: Action, rule: &RuleSpec) -> Outcome {
        let rules = match self.host.list_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Failed to retrieve routing rules: {}", e);
                return Outcome::Failed;
            }
        };
        let found = rules
            .iter()
            .any(|r| r.priority == rule.priority() && r.source == rule.source);

        match action {
            Action::Add if found => {
                info!("Rule for table {} from source {} already exists", rule.table, rule.source);
                return Outcome::Skipped;
            }
            Action::Delete if !found => {
                info!("Rule for table {} from source {} does not exist", rule.table, rule.source);
                return Outcome::Skipped;
            }
            Action::Delete if rule.source == "all" => match self.host.list_routes(Some(rule.table)).await {
                Ok(routes) if !routes.is_empty() => {
                    info!("Rule was not deleted.  Routes are still defined on table {}", rule.table);
                    return Outcome::Skipped;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to retrieve routing table {}: {}", rule.table, e);
                    return Outcome::Failed;
                }
            },
            _ => {}
        }

        let operation = Operation::Rule(action, rule.clone());
        info!("{}", operation);
        let result = match action {
            Action::Add => self.host.add_rule(rule).await,
            Action::Delete => self.host.del_rule(rule).await,
        };
        self.outcome(&operation, result)
    }

    /// iptables appends blindly, so check the rule first in both directions
    async fn apply_nat(&self, action: Action, rule: &NatRule) -> Outcome {
        let exists = match self.host.nat_rule_exists(rule).await {
            Ok(exists) => Some(exists),
            Err(e) => {
                warn!("Failed to check NAT rule {}: {}", rule, e);
                None
            }
        };
        match (action, exists) {
            (Action::Add, Some(true)) => {
                info!("NAT rule {} already exists", rule);
                return Outcome::Skipped;
            }
            (Action::Delete, Some(false)) => {
                info!("NAT rule {} does not exist", rule);
                return Outcome::Skipped;
            }
            _ => {}
        }

        let operation = Operation::Nat(action, rule.clone());
        info!("{}", operation);
        let result = self.host.apply_nat(action, rule).await;
        self.outcome(&operation, result)
    }

    fn outcome(&self, operation: &Operation, result: crate::Result<()>) -> Outcome {
        match result {
            Ok(()) => Outcome::Applied,
            Err(e) => {
                warn!("Failed <{}>: {}", operation, e);
                Outcome::Failed
            }
        }
    }
}
