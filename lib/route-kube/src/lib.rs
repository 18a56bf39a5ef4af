//! Kubernetes integration of the VPN route daemon
pub mod client;
pub mod configmap;
pub mod lookup;
pub mod watch;

pub use client::KubeClient;
pub use configmap::routes_config_map_name;
pub use lookup::{LoadBalancerRequest, PodInfo};
pub use watch::EventTranslator;
