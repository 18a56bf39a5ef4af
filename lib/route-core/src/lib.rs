//! Route reconciliation for the VPN pod
//!
//! This library provides:
//! - Topology snapshots decoded from the routes record
//! - Route plan computation for every VPN pod placement
//! - An applier executing plans against the host, idempotently
//! - The reconciler state machine fed by a single event queue
//! - VPN pod side NAT, IP pool and SNAT signal handling

pub mod apply;
pub mod error;
pub mod facts;
pub mod host;
pub mod ops;
pub mod plan;
pub mod pod;
pub mod reconciler;
pub mod topology;

#[cfg(test)]
pub(crate) mod testing;

pub use apply::{Applier, ApplyReport};
pub use error::{CoreError, Result};
pub use facts::{NodeConfig, NodeFacts, RouteEntry, RuleEntry};
pub use host::{HostNetwork, TopologyProvider};
pub use ops::{Action, NatRule, Operation, Plan, RouteSpec, RuleSpec};
pub use plan::Planner;
pub use pod::{IpPools, Placement, PodSettings, PodSnat, SnatSignal};
pub use reconciler::{Event, Reconciler, ReconcilerHandle, ReconcilerState};
pub use topology::Topology;
