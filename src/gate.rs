//! Admission control run before any handler.

use std::net::IpAddr;
use std::sync::Arc;

use hyper::HeaderMap;
use tracing::debug;

use crate::client_ip::ClientIpResolver;
use crate::rate_limit::RateLimiterRegistry;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted { client: String },
    Limited { client: String },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }
}

pub struct RequestGate {
    client_ip: ClientIpResolver,
    limiter: Arc<RateLimiterRegistry>,
}

impl RequestGate {
    pub fn new(client_ip: ClientIpResolver, limiter: Arc<RateLimiterRegistry>) -> Self {
        Self { client_ip, limiter }
    }

    pub fn client_ip(&self) -> &ClientIpResolver {
        &self.client_ip
    }

    pub fn limiter(&self) -> &Arc<RateLimiterRegistry> {
        &self.limiter
    }

    pub fn admit(&self, peer: IpAddr, headers: &HeaderMap) -> Admission {
        let client = self.client_ip.client_key(peer, headers);
        if self.limiter.check(&client) {
            Admission::Admitted { client }
        } else {
            debug!(client = %client, "rate limited");
            Admission::Limited { client }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_ip::TrustedNetworks;
    use hyper::header::HeaderValue;
    use std::time::Duration;

    fn gate(trust_proxy: bool, burst: u32) -> RequestGate {
        RequestGate::new(
            ClientIpResolver::new(trust_proxy, TrustedNetworks::loopback()),
            Arc::new(RateLimiterRegistry::new(0.0, burst, Duration::from_secs(180))),
        )
    }

    #[test]
    fn test_limit_applies_per_peer() {
        let gate = gate(false, 2);
        let peer: IpAddr = "203.0.113.1".parse().unwrap();
        let headers = HeaderMap::new();

        assert!(gate.admit(peer, &headers).is_admitted());
        assert!(gate.admit(peer, &headers).is_admitted());
        assert_eq!(
            gate.admit(peer, &headers),
            Admission::Limited {
                client: "203.0.113.1".to_string()
            }
        );
        assert!(gate.admit("203.0.113.2".parse().unwrap(), &headers).is_admitted());
    }

    #[test]
    fn test_clients_behind_trusted_proxy_limited_separately() {
        let gate = gate(true, 1);
        let proxy: IpAddr = "127.0.0.1".parse().unwrap();

        let mut a = HeaderMap::new();
        a.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        let mut b = HeaderMap::new();
        b.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.2"));

        assert!(gate.admit(proxy, &a).is_admitted());
        assert!(gate.admit(proxy, &b).is_admitted());
        assert!(!gate.admit(proxy, &a).is_admitted());
    }

    #[test]
    fn test_spoofed_header_from_untrusted_peer_does_not_escape_limit() {
        let gate = gate(true, 1);
        let peer: IpAddr = "203.0.113.9".parse().unwrap();

        let mut h = HeaderMap::new();
        h.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1"));
        assert!(gate.admit(peer, &h).is_admitted());
        h.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.2"));
        assert!(!gate.admit(peer, &h).is_admitted());
    }
}
