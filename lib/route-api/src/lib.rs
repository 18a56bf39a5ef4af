//! Shared record types for the VPN route daemon
//!
//! This library defines the data exchanged through the routes ConfigMap:
//! - RouteRecord: the eleven-key record describing VPN pod placement
//! - Route table derivation from the load balancer IP
//! - SubnetNat: typed original/mapped CIDR rules for local and remote NAT

pub mod error;
pub mod nat;
pub mod record;
pub mod table;

pub use error::{RecordError, Result};
pub use nat::{SubnetNat, SubnetNatRule};
pub use record::{canonical_string, RouteData, RouteRecord};
pub use table::{derive_route_table, PENDING_LOAD_BALANCER, TUNNEL_ROUTE_TABLE};
