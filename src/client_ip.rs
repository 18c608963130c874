//! Client identity for rate limiting, aware of trusted front-end proxies.
//!
//! Forwarded-IP headers are trivially spoofable, so they are only honored
//! when trust-proxy is enabled and the TCP peer sits inside one of the
//! configured trusted networks. Everyone else is identified by peer address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hyper::HeaderMap;
use thiserror::Error;

/// Trusted proxy networks used when none are configured.
pub const DEFAULT_TRUSTED_CIDRS: &[&str] = &["127.0.0.0/8", "::1/128"];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid CIDR {0:?}")]
pub struct CidrError(pub String);

/// An IPv4 or IPv6 network in prefix notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Parse `addr/prefix`. A bare address is treated as a single host.
    pub fn parse(s: &str) -> Result<Self, CidrError> {
        let s = s.trim();
        let invalid = || CidrError(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let ip: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= max)
                .ok_or_else(invalid)?,
            None => max,
        };
        let network = match ip {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & v4_mask(prefix))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & v6_mask(prefix))),
        };
        Ok(Self { network, prefix })
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => u32::from(ip) & v4_mask(self.prefix) == u32::from(net),
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                u128::from(ip) & v6_mask(self.prefix) == u128::from(net)
            }
            _ => false,
        }
    }
}

fn v4_mask(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix))
    }
}

fn v6_mask(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(prefix))
    }
}

/// Immutable set of trusted proxy networks, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedNetworks {
    nets: Vec<Cidr>,
}

impl TrustedNetworks {
    /// Parse a CIDR list. Blank entries are skipped; an empty list falls
    /// back to loopback only.
    pub fn parse<S: AsRef<str>>(list: &[S]) -> Result<Self, CidrError> {
        let mut nets = Vec::new();
        for entry in list {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            nets.push(Cidr::parse(entry)?);
        }
        if nets.is_empty() {
            return Ok(Self::loopback());
        }
        Ok(Self { nets })
    }

    pub fn loopback() -> Self {
        Self {
            nets: DEFAULT_TRUSTED_CIDRS
                .iter()
                .filter_map(|c| Cidr::parse(c).ok())
                .collect(),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.nets.iter().any(|net| net.contains(ip))
    }
}

/// Produces the rate-limiting identity of a request.
#[derive(Debug, Clone)]
pub struct ClientIpResolver {
    trust_proxy: bool,
    networks: TrustedNetworks,
}

impl ClientIpResolver {
    pub fn new(trust_proxy: bool, networks: TrustedNetworks) -> Self {
        Self {
            trust_proxy,
            networks,
        }
    }

    /// Whether forwarded headers from this peer may be believed.
    pub fn is_trusted_peer(&self, peer: &IpAddr) -> bool {
        self.trust_proxy && self.networks.contains(&peer.to_canonical())
    }

    pub fn client_key(&self, peer: IpAddr, headers: &HeaderMap) -> String {
        if self.is_trusted_peer(&peer) {
            if let Some(ip) = forwarded_client_ip(headers) {
                return ip.to_string();
            }
        }
        peer.to_canonical().to_string()
    }
}

/// Left-most `X-Forwarded-For` entry, else `X-Real-IP`, when either parses.
fn forwarded_client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    let header_ip = |name: &str, first_entry: bool| {
        let value = headers.get(name)?.to_str().ok()?;
        let value = if first_entry {
            value.split(',').next().unwrap_or_default()
        } else {
            value
        };
        value.trim().parse::<IpAddr>().ok().map(|ip| ip.to_canonical())
    };
    header_ip("x-forwarded-for", true).or_else(|| header_ip("x-real-ip", false))
}
