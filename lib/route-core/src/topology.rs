//! Typed view of one routes record

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use tracing::warn;

use route_api::RouteRecord;

use crate::{CoreError, Result};

/// Topology is one immutable, validated snapshot of VPN pod placement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub local_subnets: Vec<IpNetwork>,
    pub remote_subnets: Vec<IpNetwork>,
    pub worker_node_ip: IpAddr,
    pub worker_subnet: IpNetwork,
    pub vpn_pod_ip: Option<IpAddr>,
    pub vpn_pod_device: String,
    pub vpn_pod_name: String,
    pub route_table: u32,
    pub remote_gateway: Option<IpAddr>,
    pub load_balancer_ip: Option<IpAddr>,
    pub connect_using_lb: bool,
}

impl Topology {
    /// Decode a record.
    ///
    /// Returns `Ok(None)` for an incomplete record; those are partially
    /// written records and are ignored. A complete record with a malformed
    /// required field is an error.
    pub fn decode(record: &RouteRecord) -> Result<Option<Self>> {
        if !record.is_complete() {
            return Ok(None);
        }

        let remote_subnets = split_list(&record.remote_subnet)
            .map(|s| {
                s.parse::<IpNetwork>()
                    .map(normalize)
                    .map_err(|_| CoreError::InvalidRecord(format!("remote subnet {} is not a valid subnet", s)))
            })
            .collect::<Result<Vec<_>>>()?;
        if remote_subnets.is_empty() {
            return Ok(None);
        }

        // Local subnets only feed optional tunnel routes; skip what does not parse.
        let local_subnets = split_list(&record.local_subnet)
            .filter_map(|s| match s.parse::<IpNetwork>() {
                Ok(net) => Some(net),
                Err(_) => {
                    warn!("Ignoring invalid local subnet {}", s);
                    None
                }
            })
            .collect();

        let worker_node_ip = record.worker_node_ip.parse::<IpAddr>().map_err(|_| {
            CoreError::InvalidRecord(format!("worker node IP {} is not valid", record.worker_node_ip))
        })?;
        let worker_subnet = record
            .worker_subnet
            .parse::<IpNetwork>()
            .map(normalize)
            .map_err(|_| {
                CoreError::InvalidRecord(format!("worker subnet {} is not a valid subnet", record.worker_subnet))
            })?;
        let route_table = record.route_table.parse::<u32>().map_err(|_| {
            CoreError::InvalidRecord(format!("route table {} is not a number", record.route_table))
        })?;

        Ok(Some(Self {
            local_subnets,
            remote_subnets,
            worker_node_ip,
            worker_subnet,
            vpn_pod_ip: record.vpn_pod_ip.parse().ok(),
            vpn_pod_device: record.vpn_pod_device.clone(),
            vpn_pod_name: record.vpn_pod_name.clone(),
            route_table,
            remote_gateway: record.remote_gateway.parse().ok(),
            load_balancer_ip: record.load_balancer_ip.parse().ok(),
            connect_using_lb: record.connects_using_lb(),
        }))
    }

    /// VPN pod shares the worker node's network namespace
    pub fn uses_host_network(&self) -> bool {
        self.vpn_pod_ip == Some(self.worker_node_ip)
    }
}

/// Split a comma separated list, dropping empty entries
pub fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|s| !s.is_empty())
}

/// Clear host bits so `10.0.5.7/24` and `10.0.5.0/24` compare equal
pub fn normalize(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RouteRecord {
        RouteRecord {
            connect_using_lb: "false".into(),
            load_balancer_ip: "<pending>".into(),
            local_subnet: "10.10.1.0/24,bogus".into(),
            remote_subnet: "192.168.10.7/24,".into(),
            route_table: "200".into(),
            vpn_pod_ip: "172.30.4.9".into(),
            vpn_pod_device: "cali1234".into(),
            worker_node_ip: "10.10.1.5".into(),
            worker_subnet: "10.10.1.0/24".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_complete_record() {
        let topology = Topology::decode(&record()).unwrap().unwrap();
        assert_eq!(topology.remote_subnets, vec!["192.168.10.0/24".parse::<IpNetwork>().unwrap()]);
        assert_eq!(topology.local_subnets.len(), 1);
        assert_eq!(topology.route_table, 200);
        assert_eq!(topology.load_balancer_ip, None);
        assert!(!topology.connect_using_lb);
        assert!(!topology.uses_host_network());
    }

    #[test]
    fn test_incomplete_record_is_none() {
        let mut r = record();
        r.worker_subnet.clear();
        assert!(Topology::decode(&r).unwrap().is_none());
    }

    #[test]
    fn test_malformed_required_field_is_error() {
        let mut r = record();
        r.remote_subnet = "192.168.10.0/33".into();
        assert!(matches!(Topology::decode(&r), Err(CoreError::InvalidRecord(_))));

        let mut r = record();
        r.route_table = "main".into();
        assert!(matches!(Topology::decode(&r), Err(CoreError::InvalidRecord(_))));
    }

    #[test]
    fn test_host_network() {
        let mut r = record();
        r.vpn_pod_ip = r.worker_node_ip.clone();
        assert!(Topology::decode(&r).unwrap().unwrap().uses_host_network());
    }
}
