//! Shared application state passed to the server and every handler.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::client_ip::{ClientIpResolver, TrustedNetworks};
use crate::config::Config;
use crate::gate::RequestGate;
use crate::net::{OutboundClient, SafeDialer, SafeResolver};
use crate::rate_limit::RateLimiterRegistry;

/// Central application state shared across all tasks.
pub struct AppState {
    pub config: Arc<Config>,
    /// Validated DNS cache, also consulted for redirect targets.
    pub resolver: Arc<SafeResolver>,
    /// Pooled origin client; every connection goes through the safe dialer.
    pub client: OutboundClient,
    pub gate: RequestGate,
    /// Active connection count, logged at shutdown.
    pub active_connections: Arc<AtomicU64>,
    /// Connection concurrency limiter.
    pub connection_semaphore: Arc<Semaphore>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let resolver = Arc::new(SafeResolver::new(
            Duration::from_secs(config.dns_cache_ttl_secs),
            config.dns_cache_capacity,
        ));
        Self::with_resolver(config, resolver)
    }

    /// Build state around an existing resolver.
    pub fn with_resolver(config: Config, resolver: Arc<SafeResolver>) -> anyhow::Result<Self> {
        let keepalive = (config.upstream_tcp_keepalive_secs > 0)
            .then(|| Duration::from_secs(config.upstream_tcp_keepalive_secs));
        let dialer = SafeDialer::new(
            Arc::clone(&resolver),
            Duration::from_secs(config.upstream_connect_timeout_secs),
            keepalive,
        );
        let client = OutboundClient::new(dialer, &config)?;

        let networks = TrustedNetworks::parse(&config.trusted_proxy_cidrs)
            .map_err(|e| anyhow::anyhow!("trusted_proxy_cidrs: {}", e))?;
        let limiter = Arc::new(RateLimiterRegistry::new(
            config.rate_limit,
            config.burst_limit,
            Duration::from_secs(config.rate_limit_idle_timeout_secs),
        ));
        let gate = RequestGate::new(ClientIpResolver::new(config.trust_proxy, networks), limiter);

        Ok(Self {
            connection_semaphore: Arc::new(Semaphore::new(config.max_concurrent_connections)),
            config: Arc::new(config),
            resolver,
            client,
            gate,
            active_connections: Arc::new(AtomicU64::new(0)),
        })
    }
}
