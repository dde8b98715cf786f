//! Presentation helpers for API responses

/// Hide the host part of an address before it leaves the API.
///
/// IPv4 keeps the first two octets, IPv6 the first two groups. Anything that
/// does not look like either is returned as is.
pub fn mask_ip(ip: &str) -> String {
    if ip.contains('.') {
        let parts: Vec<&str> = ip.split('.').collect();
        if parts.len() == 4 {
            return format!("{}.{}.xxx.xxx", parts[0], parts[1]);
        }
    }
    if ip.contains(':') {
        let parts: Vec<&str> = ip.split(':').collect();
        if parts.len() >= 4 {
            return format!("{}:{}:xxx:xxx", parts[0], parts[1]);
        }
    }
    ip.to_string()
}
