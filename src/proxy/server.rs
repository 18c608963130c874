use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::gate::Admission;
use crate::proxy::{router, text_response, BoxBody, BoxError};
use crate::state::AppState;

const DRAIN_POLL: Duration = Duration::from_millis(100);

/// Run the accept loop until `shutdown_rx` flips, then drain.
///
/// Each connection is served on its own task, bounded by the connection
/// semaphore. On shutdown every connection is asked to finish its current
/// exchange and the loop waits up to `shutdown_grace_secs` for them.
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "gateway listening");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };

                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "failed to set TCP_NODELAY");
                }

                let permit = match state.connection_semaphore.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(peer = %peer_addr, "connection rejected: limit reached");
                        continue;
                    }
                };

                let state = Arc::clone(&state);
                let conn_shutdown = shutdown_rx.clone();
                state.active_connections.fetch_add(1, Ordering::Relaxed);

                tokio::task::spawn(async move {
                    let _permit = permit;
                    serve_connection(stream, peer_addr, &state, conn_shutdown).await;
                    state.active_connections.fetch_sub(1, Ordering::Relaxed);
                });
            }
            _ = shutdown_rx.changed() => {
                info!("gateway shutting down");
                break;
            }
        }
    }
    drop(listener);

    drain(&state).await;
    Ok(())
}

async fn drain(state: &AppState) {
    let grace = Duration::from_secs(state.config.shutdown_grace_secs);
    let deadline = Instant::now() + grace;
    loop {
        let active = state.active_connections.load(Ordering::Relaxed);
        if active == 0 {
            info!("all connections drained");
            return;
        }
        if Instant::now() >= deadline {
            warn!(active, "shutdown grace elapsed with connections still open");
            return;
        }
        tokio::time::sleep(DRAIN_POLL).await;
    }
}

/// Serve a single HTTP/1.1 connection.
async fn serve_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: &Arc<AppState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let svc_state = Arc::clone(state);
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&svc_state);
        async move { Ok::<_, Infallible>(handle_request(req, &state, peer_addr).await) }
    });

    let conn = http1::Builder::new()
        .timer(TokioTimer::new())
        .header_read_timeout(Duration::from_secs(state.config.header_read_timeout_secs))
        .serve_connection(TokioIo::new(stream), service);
    let mut conn = std::pin::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };
    if let Err(e) = result {
        if !e.is_incomplete_message() {
            debug!(peer = %peer_addr, error = %e, "connection error");
        }
    }
}

/// Gate a request, then route it.
pub async fn handle_request<B>(
    req: Request<B>,
    state: &AppState,
    peer: SocketAddr,
) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let resp = match state.gate.admit(peer.ip(), req.headers()) {
        Admission::Limited { .. } => {
            text_response(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
        }
        Admission::Admitted { .. } => router::dispatch(req, state, peer).await,
    };

    debug!(
        peer = %peer,
        method = %method,
        path = %path,
        status = resp.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use http_body_util::Empty;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::Config;
    use crate::net::resolver::tests::FakeLookup;
    use crate::proxy::tests::body_string;
    use crate::state::tests::{test_state, test_state_with};

    fn health() -> Request<Empty<Bytes>> {
        Request::get("/health").body(Empty::new()).unwrap()
    }

    #[tokio::test]
    async fn test_rate_limited_before_routing() {
        let config = Config::parse_from(["streamgate", "--burst-limit", "2", "--rate-limit", "0.01"]);
        let state = test_state_with(config, FakeLookup::new(&[]));
        let peer: SocketAddr = "203.0.113.9:5000".parse().unwrap();

        for _ in 0..2 {
            let resp = handle_request(health(), &state, peer).await;
            assert_eq!(resp.status(), StatusCode::OK);
        }
        let resp = handle_request(health(), &state, peer).await;
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_string(resp).await, "Too Many Requests\n");

        let other: SocketAddr = "203.0.113.10:5000".parse().unwrap();
        let resp = handle_request(health(), &state, other).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_serves_and_shuts_down() {
        let state = test_state(FakeLookup::new(&[]));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(run(listener, Arc::clone(&state), shutdown_rx));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: gw.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let raw = String::from_utf8(raw).unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"), "{}", raw);
        assert!(raw.ends_with("\r\n\r\nOK"), "{}", raw);

        shutdown_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
        assert_eq!(state.active_connections.load(Ordering::Relaxed), 0);
    }
}
