//! Connection establishment restricted to validated public addresses.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::resolver::{ResolveError, SafeResolver};

#[derive(Debug, Error)]
pub enum DialError {
    #[error("invalid address {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("refusing to dial blocked address {0}")]
    BlockedAddress(IpAddr),
    #[error("no addresses to dial for {0}")]
    NoAddresses(String),
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

impl DialError {
    /// Whether the failure is an address-policy rejection (never retried).
    pub fn is_policy_rejection(&self) -> bool {
        match self {
            Self::BlockedAddress(_) => true,
            Self::Resolve(e) => e.is_policy_rejection(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Connect { source, .. } => source.kind() == io::ErrorKind::TimedOut,
            Self::Resolve(ResolveError::LookupFailed { source, .. }) => {
                source.kind() == io::ErrorKind::TimedOut
            }
            _ => false,
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6 literals (`[::1]:443`).
pub fn split_host_port(addr: &str) -> Result<(&str, u16), DialError> {
    let invalid = || DialError::InvalidAddress(addr.to_string());
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        (host, tail.strip_prefix(':').ok_or_else(invalid)?)
    } else {
        let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
        if host.contains(':') {
            // Unbracketed IPv6 literal: the port separator is ambiguous.
            return Err(invalid());
        }
        (host, port)
    };
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((host, port))
}

/// Dials targets through [`SafeResolver`], trying each address in order.
#[derive(Clone)]
pub struct SafeDialer {
    resolver: Arc<SafeResolver>,
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl SafeDialer {
    pub fn new(
        resolver: Arc<SafeResolver>,
        connect_timeout: Duration,
        keepalive: Option<Duration>,
    ) -> Self {
        Self {
            resolver,
            connect_timeout,
            keepalive,
        }
    }

    pub fn resolver(&self) -> &Arc<SafeResolver> {
        &self.resolver
    }

    /// Connect to a `host:port` address.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream, DialError> {
        let (host, port) = split_host_port(addr)?;
        self.connect_host(host, port).await
    }

    /// Connect to the first reachable validated address of `host`.
    ///
    /// Attempts are sequential. When every attempt fails the last connect
    /// error is returned.
    pub async fn connect_host(&self, host: &str, port: u16) -> Result<TcpStream, DialError> {
        let addrs = self.resolver.resolve(host).await?;

        let mut last_err = None;
        for ip in addrs.iter() {
            // The resolver already filtered these; re-check at the socket boundary.
            if self.resolver.is_blocked(ip) {
                warn!(target: "security", host = %host, ip = %ip, "blocked address reached dialer");
                return Err(DialError::BlockedAddress(*ip));
            }
            let target = SocketAddr::new(*ip, port);
            match timeout(self.connect_timeout, TcpStream::connect(target)).await {
                Ok(Ok(stream)) => {
                    self.tune(&stream, target);
                    debug!(host = %host, target = %target, "dialed upstream");
                    return Ok(stream);
                }
                Ok(Err(e)) => {
                    debug!(host = %host, target = %target, error = %e, "connect attempt failed");
                    last_err = Some(DialError::Connect {
                        addr: target,
                        source: e,
                    });
                }
                Err(_) => {
                    debug!(host = %host, target = %target, "connect attempt timed out");
                    last_err = Some(DialError::Connect {
                        addr: target,
                        source: io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
                    });
                }
            }
        }

        Err(last_err.unwrap_or_else(|| DialError::NoAddresses(host.to_string())))
    }

    fn tune(&self, stream: &TcpStream, target: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(target = %target, error = %e, "failed to set TCP_NODELAY");
        }
        if let Some(time) = self.keepalive {
            let keepalive = TcpKeepalive::new().with_time(time);
            if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
                debug!(target = %target, error = %e, "failed to set TCP keepalive");
            }
        }
    }
}
