//! Address policy shared by the resolver and the dialer.
//!
//! An address is "blocked" when connecting to it could reach something other
//! than the public internet: loopback, RFC 1918 space, link-local, the
//! unspecified address, multicast, and the reserved ranges listed below.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Check if an IP address must never be dialed on behalf of a client.
pub fn is_blocked_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_blocked_ipv4(v4),
        IpAddr::V6(v6) => is_blocked_ipv6(v6),
    }
}

fn is_blocked_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    // 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16
    if ip.is_private() {
        return true;
    }
    // 127.0.0.0/8
    if ip.is_loopback() {
        return true;
    }
    // 169.254.0.0/16 (link-local)
    if ip.is_link_local() {
        return true;
    }
    // 0.0.0.0/8
    if octets[0] == 0 {
        return true;
    }
    // 224.0.0.0/4, which includes link-local multicast 224.0.0.0/24
    if ip.is_multicast() {
        return true;
    }
    // 100.64.0.0/10 (CGNAT / shared address space)
    if octets[0] == 100 && (64..=127).contains(&octets[1]) {
        return true;
    }
    // 192.0.0.0/24 (IETF protocol assignments)
    if octets[0] == 192 && octets[1] == 0 && octets[2] == 0 {
        return true;
    }
    // 198.18.0.0/15 (benchmark testing)
    if octets[0] == 198 && (18..=19).contains(&octets[1]) {
        return true;
    }
    // 240.0.0.0/4 (reserved), includes broadcast
    if octets[0] >= 240 {
        return true;
    }
    false
}

fn is_blocked_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    let segments = ip.segments();
    // fc00::/7 (ULA)
    if segments[0] & 0xfe00 == 0xfc00 {
        return true;
    }
    // fe80::/10 (link-local)
    if segments[0] & 0xffc0 == 0xfe80 {
        return true;
    }
    // ff00::/8, which includes link-local multicast ff02::/16
    if ip.is_multicast() {
        return true;
    }
    if let Some(v4) = embedded_ipv4(ip) {
        return is_blocked_ipv4(&v4);
    }
    false
}

/// IPv4 destination carried inside an IPv6 address, if any.
fn embedded_ipv4(ip: &Ipv6Addr) -> Option<Ipv4Addr> {
    let s = ip.segments();
    let low = || Ipv4Addr::new((s[6] >> 8) as u8, s[6] as u8, (s[7] >> 8) as u8, s[7] as u8);
    match s {
        // ::ffff:a.b.c.d (mapped) and ::a.b.c.d (compatible); :: and ::1 are handled above
        [0, 0, 0, 0, 0, 0xffff, _, _] | [0, 0, 0, 0, 0, 0, _, _] => Some(low()),
        // 64:ff9b::a.b.c.d (NAT64 well-known prefix)
        [0x64, 0xff9b, 0, 0, 0, 0, _, _] => Some(low()),
        // 2002:aabb:ccdd::/48 (6to4)
        [0x2002, hi, lo, ..] => Some(Ipv4Addr::new(
            (hi >> 8) as u8,
            hi as u8,
            (lo >> 8) as u8,
            lo as u8,
        )),
        _ => None,
    }
}
