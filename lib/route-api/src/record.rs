//! The routes ConfigMap record
//!
//! The VPN pod publishes one record describing where it runs and which
//! subnets sit behind the tunnel. Every route daemon decodes the same record.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{RecordError, Result};

/// Raw ConfigMap data as delivered by the API server
pub type RouteData = BTreeMap<String, String>;

pub const KEY_CONNECT_USING_LB: &str = "connectUsingLB";
pub const KEY_LOAD_BALANCER_IP: &str = "loadBalancerIP";
pub const KEY_LOCAL_SUBNET: &str = "localSubnet";
pub const KEY_REMOTE_GATEWAY: &str = "remoteGateway";
pub const KEY_REMOTE_SUBNET: &str = "remoteSubnet";
pub const KEY_ROUTE_TABLE: &str = "routeTable";
pub const KEY_VPN_POD_DEVICE: &str = "vpnPodDevice";
pub const KEY_VPN_POD_IP: &str = "vpnPodIP";
pub const KEY_VPN_POD_NAME: &str = "vpnPodName";
pub const KEY_WORKER_NODE_IP: &str = "workerNodeIP";
pub const KEY_WORKER_SUBNET: &str = "workerSubnet";

/// RouteRecord is the explicit schema of the routes ConfigMap.
///
/// Missing keys decode to empty strings; whether the record is usable is
/// decided by [`RouteRecord::is_complete`], not by the decoder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    /// Connect VPN using the load balancer IP ("true"/"false")
    #[serde(rename = "connectUsingLB", default)]
    pub connect_using_lb: String,

    /// Load balancer IP address, or `<pending>`
    #[serde(rename = "loadBalancerIP", default)]
    pub load_balancer_ip: String,

    /// Comma separated local subnets shared over the tunnel
    #[serde(rename = "localSubnet", default)]
    pub local_subnet: String,

    /// Remote VPN gateway
    #[serde(rename = "remoteGateway", default)]
    pub remote_gateway: String,

    /// Comma separated remote subnets to route through the VPN pod
    #[serde(rename = "remoteSubnet", default)]
    pub remote_subnet: String,

    /// Policy routing table id
    #[serde(rename = "routeTable", default)]
    pub route_table: String,

    /// Host side interface of the VPN pod
    #[serde(rename = "vpnPodDevice", default)]
    pub vpn_pod_device: String,

    #[serde(rename = "vpnPodIP", default)]
    pub vpn_pod_ip: String,

    #[serde(rename = "vpnPodName", default)]
    pub vpn_pod_name: String,

    /// Private IP of the worker node hosting the VPN pod
    #[serde(rename = "workerNodeIP", default)]
    pub worker_node_ip: String,

    /// Subnet of the worker node hosting the VPN pod
    #[serde(rename = "workerSubnet", default)]
    pub worker_subnet: String,
}

impl RouteRecord {
    /// Decode raw ConfigMap data. Unknown keys are ignored.
    pub fn from_data(data: &RouteData) -> Result<Self> {
        let object = data
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect::<serde_json::Map<_, _>>();
        serde_json::from_value(serde_json::Value::Object(object))
            .map_err(|e| RecordError::Decode(e.to_string()))
    }

    /// Encode into ConfigMap data with all eleven keys present
    pub fn to_data(&self) -> RouteData {
        let mut data = RouteData::new();
        data.insert(KEY_CONNECT_USING_LB.to_string(), self.connect_using_lb.clone());
        data.insert(KEY_LOAD_BALANCER_IP.to_string(), self.load_balancer_ip.clone());
        data.insert(KEY_LOCAL_SUBNET.to_string(), self.local_subnet.clone());
        data.insert(KEY_REMOTE_GATEWAY.to_string(), self.remote_gateway.clone());
        data.insert(KEY_REMOTE_SUBNET.to_string(), self.remote_subnet.clone());
        data.insert(KEY_ROUTE_TABLE.to_string(), self.route_table.clone());
        data.insert(KEY_VPN_POD_DEVICE.to_string(), self.vpn_pod_device.clone());
        data.insert(KEY_VPN_POD_IP.to_string(), self.vpn_pod_ip.clone());
        data.insert(KEY_VPN_POD_NAME.to_string(), self.vpn_pod_name.clone());
        data.insert(KEY_WORKER_NODE_IP.to_string(), self.worker_node_ip.clone());
        data.insert(KEY_WORKER_SUBNET.to_string(), self.worker_subnet.clone());
        data
    }

    /// A record is complete when every field needed to build routes is set
    pub fn is_complete(&self) -> bool {
        !self.remote_subnet.is_empty()
            && !self.route_table.is_empty()
            && !self.worker_node_ip.is_empty()
            && !self.worker_subnet.is_empty()
    }

    pub fn connects_using_lb(&self) -> bool {
        self.connect_using_lb == "true"
    }

    /// Sorted `[key=value ...]` form used for logging and equality checks
    pub fn canonical(&self) -> String {
        canonical_string(&self.to_data())
    }
}

/// Render ConfigMap data as a sorted `[key=value key=value]` string
pub fn canonical_string(data: &RouteData) -> String {
    let pairs: Vec<String> = data.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("[{}]", pairs.join(" ").trim())
}
