//! hyper-util connector that dials exclusively through [`SafeDialer`].
//!
//! Every pooled connection the outbound client opens, including connections
//! for redirect targets that re-enter the gateway, goes through the same
//! resolver cache and address policy as the handler's own pre-validation.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::dialer::{DialError, SafeDialer};

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("upstream URI has no host: {0}")]
    MissingHost(String),
    #[error("unsupported upstream scheme {0:?}")]
    UnsupportedScheme(String),
    #[error(transparent)]
    Dial(#[from] DialError),
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),
    #[error("TLS handshake timed out")]
    TlsTimeout,
}

impl ConnectError {
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, Self::Dial(e) if e.is_policy_rejection())
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::TlsTimeout => true,
            Self::Dial(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Build the rustls client config used for `https` origins.
pub fn build_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

struct ConnectorInner {
    dialer: SafeDialer,
    tls: TlsConnector,
    tls_handshake_timeout: Duration,
}

/// `tower_service::Service<Uri>` producing plain or TLS upstream streams.
#[derive(Clone)]
pub struct SafeConnector {
    inner: Arc<ConnectorInner>,
}

impl SafeConnector {
    pub fn new(
        dialer: SafeDialer,
        tls_config: rustls::ClientConfig,
        tls_handshake_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                dialer,
                tls: TlsConnector::from(Arc::new(tls_config)),
                tls_handshake_timeout,
            }),
        }
    }
}

impl ConnectorInner {
    async fn connect(&self, uri: Uri) -> Result<GatewayStream, ConnectError> {
        let is_tls = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => return Err(ConnectError::UnsupportedScheme(other.unwrap_or("").to_string())),
        };
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConnectError::MissingHost(uri.to_string()))?;
        let port = uri.port_u16().unwrap_or(if is_tls { 443 } else { 80 });

        let tcp = self.dialer.connect_host(host, port).await?;
        if !is_tls {
            return Ok(GatewayStream::new(MaybeTlsStream::Plain(tcp)));
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| ConnectError::InvalidServerName(host.to_string()))?;
        let tls = match timeout(self.tls_handshake_timeout, self.tls.connect(server_name, tcp)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ConnectError::Tls(e)),
            Err(_) => return Err(ConnectError::TlsTimeout),
        };
        debug!(host = %host, port, "upstream TLS established");
        Ok(GatewayStream::new(MaybeTlsStream::Tls(Box::new(tls))))
    }
}

impl tower_service::Service<Uri> for SafeConnector {
    type Response = GatewayStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<GatewayStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move { inner.connect(uri).await })
    }
}

pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Plain(s) => s.is_write_vectored(),
            Self::Tls(s) => s.is_write_vectored(),
        }
    }
}

/// Upstream connection handed to the hyper client pool.
pub struct GatewayStream {
    io: TokioIo<MaybeTlsStream>,
}

impl GatewayStream {
    fn new(stream: MaybeTlsStream) -> Self {
        Self {
            io: TokioIo::new(stream),
        }
    }
}

impl Connection for GatewayStream {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for GatewayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for GatewayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write_vectored(cx, bufs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::resolver::tests::FakeLookup;
    use crate::net::resolver::SafeResolver;
    use tower_service::Service;

    fn connector() -> SafeConnector {
        let resolver = SafeResolver::with_lookup(FakeLookup::new(&[]), Duration::from_secs(60), 8);
        let dialer = SafeDialer::new(Arc::new(resolver), Duration::from_millis(200), None);
        SafeConnector::new(dialer, build_tls_config().unwrap(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_rejects_private_target() {
        let mut connector = connector();
        let err = match connector.call("http://127.0.0.1:8080/".parse().unwrap()).await {
            Err(e) => e,
            Ok(_) => panic!("loopback must not be dialed"),
        };
        assert!(err.is_policy_rejection());
    }

    #[tokio::test]
    async fn test_rejects_bracketed_ipv6_loopback() {
        let mut connector = connector();
        let result = connector.call("https://[::1]/".parse().unwrap()).await;
        assert!(matches!(result, Err(ref e) if e.is_policy_rejection()));
    }

    #[tokio::test]
    async fn test_rejects_unknown_scheme() {
        let mut connector = connector();
        let result = connector.call("ftp://example.com/".parse().unwrap()).await;
        assert!(matches!(result, Err(ConnectError::UnsupportedScheme(_))));
    }
}
