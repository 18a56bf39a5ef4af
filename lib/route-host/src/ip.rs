//! Kernel routing, policy rules, NAT and conntrack through the system tools

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{info, warn};

use route_core::facts::{parse_routes, parse_rules};
use route_core::ops::{NatTarget, RouteSpec, RuleSpec};
use route_core::{Action, CoreError, HostNetwork, NatRule, Result, RouteEntry, RuleEntry};

use crate::shell::{CommandOutput, CommandRunner, ShellRunner};

pub const IP: &str = "/sbin/ip";
pub const IPTABLES: &str = "/usr/sbin/iptables-legacy";
pub const CONNTRACK: &str = "/usr/sbin/conntrack";

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// `route add|del <dest> [via <gw>] dev <dev> [onlink] table <table>`
pub fn route_args(action: Action, route: &RouteSpec) -> Vec<String> {
    let mut args = vec!["route".to_string(), action.to_string(), route.destination.to_string()];
    if let Some(via) = route.via {
        args.extend(["via".to_string(), via.to_string()]);
    }
    args.extend(["dev".to_string(), route.device.clone()]);
    if route.onlink {
        args.push("onlink".to_string());
    }
    args.extend(["table".to_string(), route.table.to_string()]);
    args
}

/// Rules are added with a priority equal to their table
pub fn rule_args(action: Action, rule: &RuleSpec) -> Vec<String> {
    let mut args = vec![
        "rule".to_string(),
        action.to_string(),
        "from".to_string(),
        rule.source.clone(),
        "table".to_string(),
        rule.table.to_string(),
    ];
    if action == Action::Add {
        args.extend(["prior".to_string(), rule.priority().to_string()]);
    }
    args
}

/// `-t nat <flag> <chain> ...`, where flag is `-A`, `-D` or `-C`
pub fn nat_args(flag: &str, rule: &NatRule) -> Vec<String> {
    let mut args = vec!["-t".to_string(), "nat".to_string(), flag.to_string(), rule.chain.to_string()];
    if let Some(source) = &rule.source {
        args.extend(["-s".to_string(), source.to_string()]);
    }
    if let Some(destination) = &rule.destination {
        args.extend(["-d".to_string(), destination.to_string()]);
    }
    if let Some(protocol) = &rule.protocol {
        args.extend(["-p".to_string(), protocol.clone()]);
    }
    match &rule.target {
        NatTarget::Masquerade => args.extend(["-j".to_string(), "MASQUERADE".to_string()]),
        NatTarget::Snat(to) => args.extend(["-j".to_string(), "SNAT".to_string(), "--to".to_string(), to.to_string()]),
        NatTarget::Netmap(to) => {
            args.extend(["-j".to_string(), "NETMAP".to_string(), "--to".to_string(), to.to_string()])
        }
    }
    args
}

pub fn conntrack_args(source: IpAddr, destination: IpAddr) -> Vec<String> {
    ["-D", "-s", &source.to_string(), "-d", &destination.to_string(), "-p", "udp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// IpHost executes primitives on this node, as root
pub struct IpHost<R: CommandRunner = ShellRunner> {
    runner: R,
}

impl IpHost<ShellRunner> {
    pub fn new() -> Self {
        Self {
            runner: ShellRunner::sudo(),
        }
    }
}

impl Default for IpHost<ShellRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> IpHost<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<CommandOutput> {
        let command = format!("{} {}", program, args.join(" "));
        self.runner.run(program, &args).await?.check(&command)
    }

    async fn ip(&self, args: Vec<String>) -> Result<CommandOutput> {
        self.run(IP, args).await
    }
}

#[async_trait]
impl<R: CommandRunner> HostNetwork for IpHost<R> {
    async fn add_route(&self, route: &RouteSpec) -> Result<()> {
        self.ip(route_args(Action::Add, route)).await.map(|_| ())
    }

    async fn del_route(&self, route: &RouteSpec) -> Result<()> {
        self.ip(route_args(Action::Delete, route)).await.map(|_| ())
    }

    async fn add_rule(&self, rule: &RuleSpec) -> Result<()> {
        self.ip(rule_args(Action::Add, rule)).await.map(|_| ())
    }

    async fn del_rule(&self, rule: &RuleSpec) -> Result<()> {
        self.ip(rule_args(Action::Delete, rule)).await.map(|_| ())
    }

    async fn list_rules(&self) -> Result<Vec<RuleEntry>> {
        let output = self.ip(vec!["rule".to_string(), "list".to_string()]).await?;
        Ok(parse_rules(&output.stdout))
    }

    async fn list_routes(&self, table: Option<u32>) -> Result<Vec<RouteEntry>> {
        let mut args = vec!["route".to_string(), "list".to_string()];
        if let Some(table) = table {
            args.extend(["table".to_string(), table.to_string()]);
        }
        let output = self.ip(args).await?;
        Ok(parse_routes(&output.stdout))
    }

    /// `iptables -C` exits non-zero when the rule is absent
    async fn nat_rule_exists(&self, rule: &NatRule) -> Result<bool> {
        let output = self.runner.run(IPTABLES, &nat_args("-C", rule)).await?;
        Ok(output.success)
    }

    async fn apply_nat(&self, action: Action, rule: &NatRule) -> Result<()> {
        let flag = match action {
            Action::Add => "-A",
            Action::Delete => "-D",
        };
        self.run(IPTABLES, nat_args(flag, rule)).await.map(|_| ())
    }

    async fn flush_nat(&self) -> Result<()> {
        let args = vec!["--flush".to_string(), "-t".to_string(), "nat".to_string()];
        self.run(IPTABLES, args).await.map(|_| ())
    }

    /// conntrack exits non-zero when nothing matched, which is not a failure here
    async fn delete_conntrack(&self, source: IpAddr, destination: IpAddr) -> Result<()> {
        let output = self.runner.run(CONNTRACK, &conntrack_args(source, destination)).await?;
        for line in output.combined().lines().filter(|l| l.len() > 1) {
            info!("{}", line);
        }
        Ok(())
    }

    async fn notify(&self, addr: SocketAddr) -> Result<()> {
        match tokio::time::timeout(NOTIFY_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                drop(stream);
                Ok(())
            }
            Ok(Err(e)) => Err(CoreError::Io(e)),
            Err(_) => {
                warn!("Timed out connecting to {}", addr);
                Err(CoreError::CommandFailed(format!("connect to {} timed out", addr)))
            }
        }
    }
}
