//! Client address resolution behind proxies.

use super::ClientInfo;

/// Forwarding headers consulted in order.
pub const IP_HEADERS: [&str; 6] = [
    "X-Forwarded-For",
    "X-Real-IP",
    "Proxy-Client-IP",
    "WL-Proxy-Client-IP",
    "HTTP_CLIENT_IP",
    "HTTP_X_FORWARDED_FOR",
];

/// Placeholder address when nothing better is known.
pub const UNKNOWN_IP: &str = "unknown";

/// Best-effort client address.
///
/// Takes the first usable forwarding header, then the peer address, then
/// [`UNKNOWN_IP`]. A header listing several hops yields its first entry.
pub fn resolve_client_ip(client: &ClientInfo) -> String {
    IP_HEADERS
        .iter()
        .filter_map(|name| client.header(name))
        .filter_map(first_hop)
        .next()
        .map(str::to_string)
        .or_else(|| client.peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| UNKNOWN_IP.to_string())
}

fn first_hop(value: &str) -> Option<&str> {
    let first = value.split(',').next()?.trim();
    if first.is_empty() || first.eq_ignore_ascii_case(UNKNOWN_IP) {
        None
    } else {
        Some(first)
    }
}
