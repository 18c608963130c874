use std::net::SocketAddr;
use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::client_ip::TrustedNetworks;

/// Default config file name.
pub const DEFAULT_CONFIG: &str = "streamgate.toml";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "STREAMGATE_CONFIG";

/// SSRF-hardened media proxy gateway.
///
/// Forwards `?url=` requests to public origins, rewrites HLS playlists so
/// segments stream back through the gateway, and rate limits each client.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "STREAMGATE_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Bearer token required on proxy requests (empty disables)
    #[arg(
        long,
        env = "STREAMGATE_ACCESS_PASSWORD",
        default_value = "",
        hide_env_values = true
    )]
    pub access_password: String,

    /// Steady request rate per client (requests per second)
    #[arg(long, env = "STREAMGATE_RATE_LIMIT", default_value_t = 50.0)]
    pub rate_limit: f64,

    /// Burst capacity per client
    #[arg(long, env = "STREAMGATE_BURST_LIMIT", default_value_t = 100)]
    pub burst_limit: u32,

    /// Honor X-Forwarded-For / X-Real-IP / X-Forwarded-Proto from trusted peers
    #[arg(long, env = "STREAMGATE_TRUST_PROXY", default_value_t = false)]
    pub trust_proxy: bool,

    /// Trusted proxy networks (comma-separated CIDRs)
    #[arg(
        long,
        env = "STREAMGATE_TRUSTED_PROXY_CIDRS",
        value_delimiter = ',',
        default_values_t = vec!["127.0.0.0/8".to_string(), "::1/128".to_string()]
    )]
    pub trusted_proxy_cidrs: Vec<String>,

    /// DNS cache TTL in seconds
    #[arg(long, env = "STREAMGATE_DNS_CACHE_TTL", default_value_t = 300)]
    pub dns_cache_ttl_secs: u64,

    /// DNS cache capacity (entries)
    #[arg(long, env = "STREAMGATE_DNS_CACHE_CAPACITY", default_value_t = 4096)]
    pub dns_cache_capacity: usize,

    /// Interval between idle rate limiter sweeps in seconds
    #[arg(long, env = "STREAMGATE_RATE_LIMIT_SWEEP_INTERVAL", default_value_t = 60)]
    pub rate_limit_sweep_interval_secs: u64,

    /// Evict a client's rate limiter after this many idle seconds
    #[arg(long, env = "STREAMGATE_RATE_LIMIT_IDLE_TIMEOUT", default_value_t = 180)]
    pub rate_limit_idle_timeout_secs: u64,

    /// Upstream TCP connect timeout per address in seconds
    #[arg(
        long,
        env = "STREAMGATE_UPSTREAM_CONNECT_TIMEOUT",
        default_value_t = 30
    )]
    pub upstream_connect_timeout_secs: u64,

    /// Upstream TLS handshake timeout in seconds
    #[arg(long, env = "STREAMGATE_TLS_HANDSHAKE_TIMEOUT", default_value_t = 10)]
    pub tls_handshake_timeout_secs: u64,

    /// Upstream response header timeout in seconds
    #[arg(
        long,
        env = "STREAMGATE_RESPONSE_HEADER_TIMEOUT",
        default_value_t = 15
    )]
    pub response_header_timeout_secs: u64,

    /// Abort an upstream body after this many seconds without data
    #[arg(
        long,
        env = "STREAMGATE_UPSTREAM_READ_IDLE_TIMEOUT",
        default_value_t = 30
    )]
    pub upstream_read_idle_timeout_secs: u64,

    /// Upstream HTTP client max idle connections per host
    #[arg(
        long,
        env = "STREAMGATE_UPSTREAM_POOL_MAX_IDLE_PER_HOST",
        default_value_t = 100
    )]
    pub upstream_pool_max_idle_per_host: usize,

    /// Upstream HTTP client idle timeout in seconds
    #[arg(
        long,
        env = "STREAMGATE_UPSTREAM_POOL_IDLE_TIMEOUT",
        default_value_t = 90
    )]
    pub upstream_pool_idle_timeout_secs: u64,

    /// Upstream TCP keepalive in seconds (0 disables)
    #[arg(long, env = "STREAMGATE_UPSTREAM_TCP_KEEPALIVE", default_value_t = 30)]
    pub upstream_tcp_keepalive_secs: u64,

    /// Maximum concurrent inbound connections
    #[arg(
        long,
        env = "STREAMGATE_MAX_CONCURRENT_CONNECTIONS",
        default_value_t = 10000
    )]
    pub max_concurrent_connections: usize,

    /// Inbound request header read timeout in seconds
    #[arg(long, env = "STREAMGATE_HEADER_READ_TIMEOUT", default_value_t = 10)]
    pub header_read_timeout_secs: u64,

    /// Seconds to wait for in-flight connections on shutdown
    #[arg(long, env = "STREAMGATE_SHUTDOWN_GRACE", default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "STREAMGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "STREAMGATE_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.rate_limit.is_finite() || self.rate_limit <= 0.0 {
            anyhow::bail!("rate_limit must be a positive number, got {}", self.rate_limit);
        }
        if self.burst_limit == 0 {
            anyhow::bail!("burst_limit must be at least 1");
        }
        TrustedNetworks::parse(&self.trusted_proxy_cidrs)
            .map_err(|e| anyhow::anyhow!("trusted_proxy_cidrs: {}", e))?;

        let nonzero = [
            ("dns_cache_ttl_secs", self.dns_cache_ttl_secs),
            (
                "rate_limit_sweep_interval_secs",
                self.rate_limit_sweep_interval_secs,
            ),
            (
                "rate_limit_idle_timeout_secs",
                self.rate_limit_idle_timeout_secs,
            ),
            (
                "upstream_connect_timeout_secs",
                self.upstream_connect_timeout_secs,
            ),
            ("tls_handshake_timeout_secs", self.tls_handshake_timeout_secs),
            (
                "response_header_timeout_secs",
                self.response_header_timeout_secs,
            ),
            (
                "upstream_read_idle_timeout_secs",
                self.upstream_read_idle_timeout_secs,
            ),
            ("header_read_timeout_secs", self.header_read_timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        if self.max_concurrent_connections == 0 {
            anyhow::bail!("max_concurrent_connections must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Serializable config for TOML file persistence.
/// All fields are optional -- only populated values are written.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst_limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_proxy: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_proxy_cidrs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_cache_ttl_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_cache_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_sweep_interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit_idle_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_connect_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_handshake_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_header_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_read_idle_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_pool_max_idle_per_host: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_pool_idle_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_tcp_keepalive_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_connections: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_read_timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_grace_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Environment variables equivalent to the populated fields.
    pub fn env_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    pairs.push(($env, v.to_string()));
                }
            };
        }

        set!("STREAMGATE_LISTEN", self.listen);
        set!("STREAMGATE_ACCESS_PASSWORD", self.access_password);
        set!("STREAMGATE_RATE_LIMIT", self.rate_limit);
        set!("STREAMGATE_BURST_LIMIT", self.burst_limit);
        set!("STREAMGATE_TRUST_PROXY", self.trust_proxy);
        set!(
            "STREAMGATE_TRUSTED_PROXY_CIDRS",
            self.trusted_proxy_cidrs.as_ref().map(|c| c.join(","))
        );
        set!("STREAMGATE_DNS_CACHE_TTL", self.dns_cache_ttl_secs);
        set!("STREAMGATE_DNS_CACHE_CAPACITY", self.dns_cache_capacity);
        set!(
            "STREAMGATE_RATE_LIMIT_SWEEP_INTERVAL",
            self.rate_limit_sweep_interval_secs
        );
        set!(
            "STREAMGATE_RATE_LIMIT_IDLE_TIMEOUT",
            self.rate_limit_idle_timeout_secs
        );
        set!(
            "STREAMGATE_UPSTREAM_CONNECT_TIMEOUT",
            self.upstream_connect_timeout_secs
        );
        set!(
            "STREAMGATE_TLS_HANDSHAKE_TIMEOUT",
            self.tls_handshake_timeout_secs
        );
        set!(
            "STREAMGATE_RESPONSE_HEADER_TIMEOUT",
            self.response_header_timeout_secs
        );
        set!(
            "STREAMGATE_UPSTREAM_READ_IDLE_TIMEOUT",
            self.upstream_read_idle_timeout_secs
        );
        set!(
            "STREAMGATE_UPSTREAM_POOL_MAX_IDLE_PER_HOST",
            self.upstream_pool_max_idle_per_host
        );
        set!(
            "STREAMGATE_UPSTREAM_POOL_IDLE_TIMEOUT",
            self.upstream_pool_idle_timeout_secs
        );
        set!(
            "STREAMGATE_UPSTREAM_TCP_KEEPALIVE",
            self.upstream_tcp_keepalive_secs
        );
        set!(
            "STREAMGATE_MAX_CONCURRENT_CONNECTIONS",
            self.max_concurrent_connections
        );
        set!("STREAMGATE_HEADER_READ_TIMEOUT", self.header_read_timeout_secs);
        set!("STREAMGATE_SHUTDOWN_GRACE", self.shutdown_grace_secs);
        set!("STREAMGATE_LOG_LEVEL", self.log_level);
        set!("STREAMGATE_LOG_JSON", self.log_json);
        pairs
    }

    /// Inject values as environment variables so clap picks them up.
    ///
    /// Only sets variables that are **not** already present in the
    /// environment, preserving the precedence: CLI > env > config file.
    pub fn inject_env(&self) {
        for (key, value) in self.env_pairs() {
            if std::env::var_os(key).is_none() {
                std::env::set_var(key, value);
            }
        }
    }
}
