use std::net::IpAddr;
use thiserror::Error;

use route_api::RecordError;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid route record: {0}")]
    InvalidRecord(String),

    #[error("Local route {route} is already defined for the remote subnet {subnet}")]
    RouteConflict { subnet: String, route: String },

    #[error("Remote subnet {subnet} contains local IP address {ip}")]
    LocalAddressInRemoteSubnet { subnet: String, ip: IpAddr },

    #[error("Unable to find route to VPN pod worker node: {0}")]
    WorkerNodeUnreachable(IpAddr),

    #[error("Record error: {0}")]
    Record(#[from] RecordError),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Kubernetes error: {0}")]
    KubernetesError(#[from] kube::error::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}
