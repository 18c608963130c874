//! Pooled outbound HTTP client shared by every proxying path.

use std::error::Error as StdError;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::{Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use thiserror::Error;
use tokio::time::timeout;

use super::connector::{build_tls_config, ConnectError, SafeConnector};
use super::dialer::SafeDialer;
use crate::config::Config;
use crate::proxy::BoxBody;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream response headers not received within {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed: {0}")]
    Request(#[source] hyper_util::client::legacy::Error),
}

impl UpstreamError {
    /// The connector failure behind this error, if the request never got a connection.
    pub fn connect_error(&self) -> Option<&ConnectError> {
        let mut source: Option<&(dyn StdError + 'static)> = match self {
            Self::Request(e) => Some(e),
            Self::Timeout(_) => None,
        };
        while let Some(err) = source {
            if let Some(connect) = err.downcast_ref::<ConnectError>() {
                return Some(connect);
            }
            source = err.source();
        }
        None
    }

    pub fn is_policy_rejection(&self) -> bool {
        self.connect_error()
            .is_some_and(ConnectError::is_policy_rejection)
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Request(_) => self.connect_error().is_some_and(ConnectError::is_timeout),
        }
    }
}

/// hyper client whose every connection goes through [`SafeConnector`].
///
/// Redirects are never followed here; callers see the 3xx response.
#[derive(Clone)]
pub struct OutboundClient {
    client: Client<SafeConnector, BoxBody>,
    response_header_timeout: Duration,
}

impl OutboundClient {
    pub fn new(dialer: SafeDialer, config: &Config) -> anyhow::Result<Self> {
        let tls_config = build_tls_config()?;
        let connector = SafeConnector::new(
            dialer,
            tls_config,
            Duration::from_secs(config.tls_handshake_timeout_secs),
        );
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(config.upstream_pool_idle_timeout_secs))
            .pool_max_idle_per_host(config.upstream_pool_max_idle_per_host)
            .pool_timer(TokioTimer::new())
            .build(connector);

        Ok(Self {
            client,
            response_header_timeout: Duration::from_secs(config.response_header_timeout_secs),
        })
    }

    /// Send a request, bounding the wait for response headers.
    ///
    /// The returned body is not covered by the timeout so long media
    /// transfers can stream for as long as the client keeps reading.
    pub async fn send(&self, req: Request<BoxBody>) -> Result<Response<Incoming>, UpstreamError> {
        match timeout(self.response_header_timeout, self.client.request(req)).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(e)) => Err(UpstreamError::Request(e)),
            Err(_) => Err(UpstreamError::Timeout(self.response_header_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use clap::Parser;

    use crate::net::resolver::tests::FakeLookup;
    use crate::net::resolver::SafeResolver;
    use crate::proxy::empty_body;

    fn client(lookup: Arc<FakeLookup>) -> OutboundClient {
        let config = Config::parse_from(["streamgate"]);
        let resolver = Arc::new(SafeResolver::with_lookup(lookup, Duration::from_secs(60), 16));
        let dialer = SafeDialer::new(resolver, Duration::from_millis(200), None);
        OutboundClient::new(dialer, &config).unwrap()
    }

    #[tokio::test]
    async fn test_private_target_classified_as_policy_rejection() {
        let lookup = FakeLookup::new(&[("intranet.example", vec!["10.1.2.3".parse().unwrap()])]);
        let client = client(lookup);

        let req = Request::get("http://intranet.example/secret")
            .body(empty_body())
            .unwrap();
        let err = client.send(req).await.unwrap_err();
        assert!(err.is_policy_rejection(), "{err}");
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_not_policy_rejection() {
        let client = client(FakeLookup::new(&[]));
        let req = Request::get("http://nowhere.example/")
            .body(empty_body())
            .unwrap();
        let err = client.send(req).await.unwrap_err();
        assert!(!err.is_policy_rejection());
        assert!(err.connect_error().is_some());
    }
}
