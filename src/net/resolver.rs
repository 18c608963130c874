//! SSRF-safe hostname resolution backed by a TTL cache.
//!
//! A hostname is only ever cached with an address set that passed
//! [`is_blocked_ip`](super::policy::is_blocked_ip) in full. If any address in
//! a resolution is blocked the whole hostname is rejected, not just the
//! offending address, so a rebinding record cannot smuggle an internal target
//! in alongside a public one.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use super::policy::is_blocked_ip;

/// Upper bound for a single system lookup.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Boxed lookup future, mirroring the shape of `reqwest::dns::Resolving`.
pub type Lookup = Pin<Box<dyn Future<Output = io::Result<Vec<IpAddr>>> + Send>>;

/// Source of raw (unfiltered) hostname resolutions.
pub trait HostLookup: Send + Sync {
    fn lookup(&self, host: &str) -> Lookup;
}

/// Resolves through the operating system via `tokio::net::lookup_host`.
pub struct SystemLookup;

impl HostLookup for SystemLookup {
    fn lookup(&self, host: &str) -> Lookup {
        let addr = format!("{}:0", host);
        Box::pin(async move {
            let mut ips: Vec<IpAddr> = Vec::new();
            for sock in tokio::net::lookup_host(addr).await? {
                if !ips.contains(&sock.ip()) {
                    ips.push(sock.ip());
                }
            }
            Ok(ips)
        })
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{host} resolves to blocked address {ip}")]
    BlockedAddress { host: String, ip: IpAddr },
    #[error("DNS resolution failed for {host}: {source}")]
    LookupFailed {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for {0}")]
    NoAddresses(String),
}

impl ResolveError {
    /// Whether this is a permanent policy rejection rather than a network failure.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, Self::BlockedAddress { .. })
    }
}

struct DnsCacheEntry {
    addrs: Arc<Vec<IpAddr>>,
    expires_at: Instant,
    inserted_at: Instant,
}

/// Lightweight DNS cache with TTL + capacity bounds, keyed by hostname.
pub struct DnsCache {
    ttl: Duration,
    capacity: usize,
    entries: RwLock<HashMap<String, DnsCacheEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a live entry, purging it if it has expired.
    pub async fn get(&self, host: &str) -> Option<Arc<Vec<IpAddr>>> {
        if self.capacity == 0 || self.ttl.is_zero() {
            return None;
        }
        let key = Self::key(host);
        let now = Instant::now();

        // Fast path: read lock for cache hit
        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if entry.expires_at > now => return Some(Arc::clone(&entry.addrs)),
                None => return None,
                Some(_) => {} // expired, fall through to evict
            }
        }

        let mut entries = self.entries.write().await;
        // Another task may have refreshed the entry between the two locks.
        if entries.get(&key).is_some_and(|e| e.expires_at <= now) {
            entries.remove(&key);
        }
        None
    }

    /// Store a validated address set, replacing any previous entry wholesale.
    pub async fn insert(&self, host: &str, addrs: Arc<Vec<IpAddr>>) {
        if self.capacity == 0 || self.ttl.is_zero() || addrs.is_empty() {
            return;
        }
        let key = Self::key(host);
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&key) && entries.len() >= self.capacity {
            entries.retain(|_, entry| entry.expires_at > now);
            while entries.len() >= self.capacity {
                let oldest_key = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted_at)
                    .map(|(key, _)| key.clone());
                match oldest_key {
                    Some(key) => {
                        entries.remove(&key);
                    }
                    None => break,
                }
            }
        }
        entries.insert(
            key,
            DnsCacheEntry {
                addrs,
                expires_at: now + self.ttl,
                inserted_at: now,
            },
        );
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    fn key(host: &str) -> String {
        host.trim_end_matches('.').to_ascii_lowercase()
    }
}

/// Resolver that only ever hands out public addresses.
pub struct SafeResolver {
    cache: DnsCache,
    lookup: Arc<dyn HostLookup>,
    #[cfg(test)]
    allow_loopback: bool,
}

impl SafeResolver {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self::with_lookup(Arc::new(SystemLookup), ttl, capacity)
    }

    pub fn with_lookup(lookup: Arc<dyn HostLookup>, ttl: Duration, capacity: usize) -> Self {
        Self {
            cache: DnsCache::new(ttl, capacity),
            lookup,
            #[cfg(test)]
            allow_loopback: false,
        }
    }

    /// Let loopback addresses through so tests can reach a local origin.
    #[cfg(test)]
    pub(crate) fn allowing_loopback(mut self) -> Self {
        self.allow_loopback = true;
        self
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }

    /// Address policy as applied by this resolver and its dialers.
    pub(crate) fn is_blocked(&self, ip: &IpAddr) -> bool {
        #[cfg(test)]
        if self.allow_loopback && ip.is_loopback() {
            return false;
        }
        is_blocked_ip(ip)
    }

    /// Resolve `host` to its validated address set.
    ///
    /// IP literals are checked against the policy and returned without
    /// touching the cache.
    pub async fn resolve(&self, host: &str) -> Result<Arc<Vec<IpAddr>>, ResolveError> {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            if self.is_blocked(&ip) {
                warn!(target: "security", host = %host, ip = %ip, "blocked literal address");
                return Err(ResolveError::BlockedAddress {
                    host: host.to_string(),
                    ip,
                });
            }
            return Ok(Arc::new(vec![ip]));
        }

        if let Some(addrs) = self.cache.get(host).await {
            debug!(host = %host, count = addrs.len(), "dns cache hit");
            return Ok(addrs);
        }

        let resolved = match timeout(LOOKUP_TIMEOUT, self.lookup.lookup(host)).await {
            Ok(Ok(addrs)) => addrs,
            Ok(Err(e)) => {
                return Err(ResolveError::LookupFailed {
                    host: host.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                return Err(ResolveError::LookupFailed {
                    host: host.to_string(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "lookup timed out"),
                })
            }
        };

        if resolved.is_empty() {
            return Err(ResolveError::NoAddresses(host.to_string()));
        }

        if let Some(ip) = resolved.iter().find(|ip| self.is_blocked(ip)) {
            warn!(target: "security", host = %host, ip = %ip, "hostname resolves to blocked address");
            return Err(ResolveError::BlockedAddress {
                host: host.to_string(),
                ip: *ip,
            });
        }

        let addrs = Arc::new(resolved);
        self.cache.insert(host, Arc::clone(&addrs)).await;
        debug!(host = %host, count = addrs.len(), "dns resolved and cached");
        Ok(addrs)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted lookup that counts calls and can be re-pointed mid-test.
    pub(crate) struct FakeLookup {
        pub answers: Mutex<HashMap<String, Vec<IpAddr>>>,
        pub calls: AtomicUsize,
    }

    impl FakeLookup {
        pub(crate) fn new(entries: &[(&str, Vec<IpAddr>)]) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(
                    entries
                        .iter()
                        .map(|(h, a)| (h.to_string(), a.clone()))
                        .collect(),
                ),
                calls: AtomicUsize::new(0),
            })
        }

        pub(crate) fn set(&self, host: &str, addrs: Vec<IpAddr>) {
            self.answers
                .lock()
                .unwrap()
                .insert(host.to_string(), addrs);
        }
    }

    impl HostLookup for FakeLookup {
        fn lookup(&self, host: &str) -> Lookup {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let answer = self.answers.lock().unwrap().get(host).cloned();
            Box::pin(async move {
                answer.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such host"))
            })
        }
    }

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn resolver(lookup: Arc<FakeLookup>) -> SafeResolver {
        SafeResolver::with_lookup(lookup, Duration::from_secs(300), 128)
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_within_ttl() {
        let lookup = FakeLookup::new(&[("cdn.example", vec![v4(1, 1, 1, 1), v4(1, 0, 0, 1)])]);
        let resolver = resolver(Arc::clone(&lookup));

        let first = resolver.resolve("cdn.example").await.unwrap();
        tokio::time::advance(Duration::from_secs(299)).await;
        let second = resolver.resolve("cdn.example").await.unwrap();

        assert_eq!(first, second);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reresolves_after_expiry() {
        let lookup = FakeLookup::new(&[("cdn.example", vec![v4(1, 1, 1, 1)])]);
        let resolver = resolver(Arc::clone(&lookup));

        resolver.resolve("cdn.example").await.unwrap();
        lookup.set("cdn.example", vec![v4(9, 9, 9, 9)]);
        tokio::time::advance(Duration::from_secs(301)).await;

        let addrs = resolver.resolve("cdn.example").await.unwrap();
        assert_eq!(*addrs, vec![v4(9, 9, 9, 9)]);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_mixed_resolution_rejected_and_not_cached() {
        let lookup = FakeLookup::new(&[("rebind.example", vec![v4(8, 8, 8, 8), v4(10, 0, 0, 5)])]);
        let resolver = resolver(Arc::clone(&lookup));

        let err = resolver.resolve("rebind.example").await.unwrap_err();
        assert!(matches!(err, ResolveError::BlockedAddress { ip, .. } if ip == v4(10, 0, 0, 5)));
        assert!(err.is_policy_rejection());
        assert_eq!(resolver.cache().len().await, 0);

        // A second attempt goes back to the lookup rather than a cached verdict.
        let _ = resolver.resolve("rebind.example").await;
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_literal_ips_skip_lookup() {
        let lookup = FakeLookup::new(&[]);
        let resolver = resolver(Arc::clone(&lookup));

        assert!(resolver.resolve("127.0.0.1").await.is_err());
        assert!(resolver.resolve("[::1]").await.is_err());
        let public = resolver.resolve("8.8.8.8").await.unwrap();
        assert_eq!(*public, vec![v4(8, 8, 8, 8)]);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_loopback_allowance_is_narrow() {
        let lookup = FakeLookup::new(&[("origin.test", vec![v4(127, 0, 0, 1)])]);
        let resolver = resolver(lookup).allowing_loopback();

        assert_eq!(*resolver.resolve("origin.test").await.unwrap(), vec![v4(127, 0, 0, 1)]);
        assert!(resolver.resolve("10.0.0.1").await.is_err());
        assert!(resolver.resolve("169.254.169.254").await.is_err());
    }

    #[tokio::test]
    async fn test_empty_resolution_is_distinct() {
        let lookup = FakeLookup::new(&[("empty.example", vec![])]);
        let resolver = resolver(lookup);
        assert!(matches!(
            resolver.resolve("empty.example").await,
            Err(ResolveError::NoAddresses(_))
        ));
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let resolver = resolver(FakeLookup::new(&[]));
        let err = resolver.resolve("missing.example").await.unwrap_err();
        assert!(matches!(err, ResolveError::LookupFailed { .. }));
        assert!(!err.is_policy_rejection());
    }

    #[tokio::test]
    async fn test_cache_key_case_insensitive() {
        let cache = DnsCache::new(Duration::from_secs(60), 16);
        cache
            .insert("Example.COM", Arc::new(vec![v4(1, 1, 1, 1)]))
            .await;
        assert!(cache.get("example.com").await.is_some());
        assert!(cache.get("example.com.").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_capacity_evicts_oldest() {
        let cache = DnsCache::new(Duration::from_secs(60), 2);
        cache.insert("a.example", Arc::new(vec![v4(1, 1, 1, 1)])).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert("b.example", Arc::new(vec![v4(1, 1, 1, 2)])).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert("c.example", Arc::new(vec![v4(1, 1, 1, 3)])).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a.example").await.is_none());
        assert!(cache.get("c.example").await.is_some());
    }
}
