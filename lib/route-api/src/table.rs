//! Policy routing table selection

/// Load balancer IP placeholder used while the service has no external IP
pub const PENDING_LOAD_BALANCER: &str = "<pending>";

/// First table id handed out to VPN pods
pub const BASE_ROUTE_TABLE: u32 = 200;

/// Table holding the tunl0 routes on the VPN pod's worker node
pub const TUNNEL_ROUTE_TABLE: u32 = 199;

/// Pick the policy routing table for a load balancer IP.
///
/// Only the low nibble of the last octet is used, so a /29 public range maps
/// onto 200..=215 without two VPN services in the same range colliding.
pub fn derive_route_table(load_balancer_ip: &str) -> u32 {
    if load_balancer_ip == PENDING_LOAD_BALANCER {
        return BASE_ROUTE_TABLE;
    }

    let last_octet = load_balancer_ip
        .split('.')
        .nth(3)
        .and_then(|octet| octet.parse::<u32>().ok())
        .unwrap_or(0);

    BASE_ROUTE_TABLE + (last_octet & 0xF)
}
