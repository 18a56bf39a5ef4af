//! calico lookups through the `calicoCmd` helper shipped in the image

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::info;

use route_core::topology::normalize;
use route_core::{CoreError, Result, TopologyProvider};

use crate::shell::{CommandOutput, CommandRunner, ShellRunner};

pub const CALICO_CMD: &str = "calicoCmd";

/// Prefix calico gives every workload interface
const POD_INTERFACE_PREFIX: &str = "cali";

/// CalicoCmd answers topology questions using the calico datastore
pub struct CalicoCmd<R: CommandRunner = ShellRunner> {
    runner: R,
}

impl CalicoCmd<ShellRunner> {
    pub fn new() -> Self {
        Self {
            runner: ShellRunner::direct(),
        }
    }
}

impl Default for CalicoCmd<ShellRunner> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: CommandRunner> CalicoCmd<R> {
    pub fn with_runner(runner: R) -> Self {
        Self { runner }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.runner.run(CALICO_CMD, &args).await
    }
}

fn log_output(output: &CommandOutput) {
    for line in output.combined().lines().filter(|l| !l.is_empty()) {
        info!("{}", line);
    }
}

#[async_trait]
impl<R: CommandRunner> TopologyProvider for CalicoCmd<R> {
    async fn node_subnet(&self, ip: IpAddr) -> Result<IpNetwork> {
        let output = self.run(&["getNodeSubnet", &ip.to_string()]).await?;
        let text = output.combined();
        if !output.success {
            return Err(CoreError::CommandFailed(format!(
                "Failed to retrieve node subnet for worker node {}: {}",
                ip, text
            )));
        }
        text.parse::<IpNetwork>()
            .map(normalize)
            .map_err(|_| CoreError::CommandFailed(format!("Invalid node subnet retrieved from calico: {}", text)))
    }

    async fn pod_interface(&self) -> Result<String> {
        let output = self.run(&["getPodInterface"]).await?;
        let name = output.combined();
        if !output.success {
            return Err(CoreError::CommandFailed(format!("Failed to retrieve calico interface: {}", name)));
        }
        if !name.starts_with(POD_INTERFACE_PREFIX) {
            return Err(CoreError::CommandFailed(format!(
                "Invalid interface retrieved from calico: {}",
                name
            )));
        }
        Ok(name)
    }

    async fn create_ip_pool(&self, subnet: &IpNetwork) -> Result<()> {
        let output = self.run(&["createIPPool", &subnet.to_string()]).await?;
        if !output.success {
            let canonical = normalize(*subnet);
            let hint = if canonical != *subnet {
                format!("Invalid subnet. Change config to use: {}. ", canonical)
            } else {
                String::new()
            };
            return Err(CoreError::CommandFailed(format!(
                "Failed to create IPPool for: {}. {}ErrMsg: {}",
                subnet,
                hint,
                output.combined()
            )));
        }
        log_output(&output);
        Ok(())
    }

    async fn delete_ip_pool(&self, subnet: &IpNetwork) -> Result<()> {
        let output = self.run(&["deleteIPPool", &subnet.to_string()]).await?;
        if !output.success {
            return Err(CoreError::CommandFailed(format!(
                "Failed to delete IPPool for {}: {}",
                subnet,
                output.combined()
            )));
        }
        log_output(&output);
        Ok(())
    }
}
