//! Host side collaborators of the route reconciler
//!
//! This library provides:
//! - A command runner over `tokio::process`, optionally through sudo
//! - IpHost: kernel routes, rules, NAT and conntrack via `ip`, `iptables-legacy` and `conntrack`
//! - CalicoCmd: node subnets, pod interfaces and IP pools via `calicoCmd`

pub mod calico;
pub mod ip;
pub mod shell;

pub use calico::CalicoCmd;
pub use ip::IpHost;
pub use shell::{CommandOutput, CommandRunner, ShellRunner};
