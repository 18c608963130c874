//! Generic `?url=` forwarding handler.
//!
//! The target is validated syntactically here; address safety is enforced
//! by the safe dialer underneath [`OutboundClient`](crate::net::OutboundClient),
//! so literal and resolved private addresses surface as policy rejections.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Frame};
use hyper::header::{
    HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, ORIGIN, RANGE,
    REFERER, USER_AGENT,
};
use hyper::{Method, Request, Response, StatusCode};
use tracing::{debug, warn};
use url::{form_urlencoded, Url};

use super::{
    boxed, copy_response_headers, cors, echo, empty_body, proxy_origin, redact_urls,
    text_response, upstream_error_response, with_idle_timeout, BoxBody, BoxError,
    BROWSER_USER_AGENT,
};
use crate::auth::validate_bearer;
use crate::playlist::{rewrite_stream, RewriteContext};
use crate::state::AppState;
use crate::target::{origin_of, parse_target, validate_target, MAX_TARGET_LEN};

const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

const FORWARDED_REQUEST_HEADERS: [hyper::header::HeaderName; 3] = [RANGE, ACCEPT, CONTENT_TYPE];

pub async fn handle<B>(req: Request<B>, state: &AppState, peer: SocketAddr) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let mut resp = dispatch(req, state, peer).await;
    cors::apply(resp.headers_mut());
    resp
}

async fn dispatch<B>(req: Request<B>, state: &AppState, peer: SocketAddr) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    match *req.method() {
        Method::OPTIONS => return cors::preflight(),
        Method::GET | Method::HEAD | Method::POST | Method::PUT | Method::DELETE
        | Method::PATCH => {}
        _ => return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
    }

    let raw_target = query_param(&req, "url").unwrap_or_default();
    let raw_target = raw_target.trim();
    if raw_target.is_empty() {
        return echo::handle(&req, peer);
    }
    if raw_target.len() > MAX_TARGET_LEN {
        return text_response(StatusCode::BAD_REQUEST, "Invalid URL");
    }

    let auth_header = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if let Err(e) = validate_bearer(auth_header, &state.config.access_password) {
        warn!(target: "security", peer = %peer.ip(), reason = %e, "proxy request rejected: bad credentials");
        return text_response(StatusCode::FORBIDDEN, "Unauthorized");
    }

    let target = match parse_target(raw_target) {
        Ok(url) => url,
        Err(e) if e.is_malformed() => {
            debug!(error = %e, "rejecting malformed target");
            return text_response(StatusCode::BAD_REQUEST, "Invalid URL");
        }
        Err(e) => {
            warn!(target: "security", peer = %peer.ip(), error = %e, "forbidden target");
            return text_response(StatusCode::FORBIDDEN, "Forbidden URL");
        }
    };

    let trusted_peer = state.gate.client_ip().is_trusted_peer(&peer.ip());
    let proxy_origin = proxy_origin(req.headers(), trusted_peer);
    forward(req, state, target, proxy_origin).await
}

async fn forward<B>(
    req: Request<B>,
    state: &AppState,
    target: Url,
    proxy_origin: String,
) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    let start = Instant::now();
    let (parts, body) = req.into_parts();
    let target_origin = origin_of(&target);

    let mut builder = Request::builder()
        .method(parts.method.clone())
        .uri(target.as_str())
        .header(USER_AGENT, BROWSER_USER_AGENT)
        .header(REFERER, format!("{}/", target_origin))
        .header(ORIGIN, target_origin.as_str());
    for name in &FORWARDED_REQUEST_HEADERS {
        if let Some(value) = parts.headers.get(name) {
            builder = builder.header(name, value.clone());
        }
    }
    let upstream_body = match parts.method {
        Method::GET | Method::HEAD => empty_body(),
        _ => boxed(body),
    };
    let upstream_req = match builder.body(upstream_body) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "target not representable as request URI");
            return text_response(StatusCode::BAD_REQUEST, "Invalid URL");
        }
    };

    let upstream = match state.client.send(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => return upstream_error_response(&e, target.as_str()),
    };

    let status = upstream.status();
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    copy_response_headers(upstream.headers(), resp.headers_mut());

    let location = status
        .is_redirection()
        .then(|| upstream.headers().get(LOCATION).cloned())
        .flatten();
    if let Some(location) = location {
        if let Some(rewritten) = rewrite_location(state, &target, &location, &proxy_origin).await {
            resp.headers_mut().insert(LOCATION, rewritten);
        }
    }

    let playlist = status == StatusCode::OK && is_playlist(&upstream, &target);
    let idle = Duration::from_secs(state.config.upstream_read_idle_timeout_secs);
    let upstream_body = with_idle_timeout(upstream.into_body(), idle);
    if playlist {
        let ctx = RewriteContext::new(&target, proxy_origin);
        let rewritten = rewrite_stream(upstream_body.into_data_stream(), ctx).map(|chunk| {
            chunk.map(Frame::data).map_err(|e| {
                warn!(error = %e, "playlist rewrite aborted");
                BoxError::from(e)
            })
        });
        *resp.body_mut() = StreamBody::new(rewritten).boxed_unsync();
        let headers = resp.headers_mut();
        headers.remove(CONTENT_LENGTH);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(PLAYLIST_CONTENT_TYPE));
    } else {
        *resp.body_mut() = passthrough(upstream_body, target.as_str());
    }

    debug!(
        upstream = %redact_urls(target.as_str()),
        status = status.as_u16(),
        playlist,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "proxied"
    );
    resp
}

/// Stream an origin body through, logging a failure that happens after
/// headers were already sent.
fn passthrough(body: BoxBody, target: &str) -> BoxBody {
    let host = redact_urls(target);
    body.map_err(move |e| {
        warn!(upstream = %host, error = %e, "upstream body failed mid-stream");
        e
    })
    .boxed_unsync()
}

fn is_playlist<T>(resp: &Response<T>, target: &Url) -> bool {
    let by_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.to_ascii_lowercase().contains("mpegurl"));
    by_type || target.path().to_ascii_lowercase().ends_with(".m3u8")
}

/// Point a redirect back through the gateway, but only when the new
/// location is itself an acceptable target.
async fn rewrite_location(
    state: &AppState,
    base: &Url,
    location: &HeaderValue,
    proxy_origin: &str,
) -> Option<HeaderValue> {
    let location = location.to_str().ok()?;
    let next = base.join(location).ok()?;
    if let Err(e) = validate_target(&next) {
        debug!(error = %e, "redirect target left unrewritten");
        return None;
    }
    let host = next.host_str()?;
    if let Err(e) = state.resolver.resolve(host).await {
        warn!(target: "security", host = %host, error = %e, "redirect to unsafe host left unrewritten");
        return None;
    }
    let encoded: String = form_urlencoded::byte_serialize(next.as_str().as_bytes()).collect();
    HeaderValue::from_str(&format!("{}/?url={}", proxy_origin, encoded)).ok()
}

/// First value of a query parameter, percent-decoded.
pub(crate) fn query_param<B>(req: &Request<B>, key: &str) -> Option<String> {
    let query = req.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
