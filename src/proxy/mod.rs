//! HTTP edge: server, routing and the request handlers.

pub mod catalog;
pub mod cors;
pub mod echo;
pub mod forward;
pub mod router;
pub mod server;
pub mod subscription;

use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Response, StatusCode};
use tracing::warn;

use crate::net::UpstreamError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = UnsyncBoxBody<Bytes, BoxError>;

/// User-Agent presented to origins.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Hop-by-hop and CORS headers never copied from an origin response.
const EXCLUDED_RESPONSE_HEADERS: &[&str] = &[
    "content-encoding",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
    "host",
];

pub fn empty_body() -> BoxBody {
    Empty::<Bytes>::new()
        .map_err(|e| -> BoxError { match e {} })
        .boxed_unsync()
}

pub fn full_body(bytes: impl Into<Bytes>) -> BoxBody {
    Full::new(bytes.into())
        .map_err(|e| -> BoxError { match e {} })
        .boxed_unsync()
}

/// Box any body whose errors convert into [`BoxError`].
pub fn boxed<B>(body: B) -> BoxBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed_unsync()
}

/// An origin body produced no frame within the read-idle limit.
#[derive(Debug, thiserror::Error)]
#[error("upstream body idle for {0:?}")]
pub struct BodyIdleTimeout(pub Duration);

/// Box `body`, failing it with [`BodyIdleTimeout`] once `idle` passes
/// without a frame. The stream ends after that error.
pub fn with_idle_timeout<B>(body: B, idle: Duration) -> BoxBody
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError> + Send,
{
    let frames = async_stream::stream! {
        let mut frames = std::pin::pin!(BodyStream::new(body));
        loop {
            match tokio::time::timeout(idle, frames.next()).await {
                Ok(Some(frame)) => yield frame.map_err(|e| -> BoxError { e.into() }),
                Ok(None) => break,
                Err(_) => {
                    yield Err(BoxError::from(BodyIdleTimeout(idle)));
                    break;
                }
            }
        }
    };
    StreamBody::new(frames).boxed_unsync()
}

pub fn text_response(status: StatusCode, text: &str) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(format!("{}\n", text)));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp.headers_mut()
        .insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    resp
}

pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub fn empty_response(status: StatusCode) -> Response<BoxBody> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

/// Map a failed upstream exchange onto a gateway status.
pub fn upstream_error_response(err: &UpstreamError, target: &str) -> Response<BoxBody> {
    let detail = redact_urls(&err.to_string());
    if err.is_policy_rejection() {
        warn!(target: "security", upstream = %redact_urls(target), error = %detail, "upstream address rejected");
        return text_response(StatusCode::FORBIDDEN, "Forbidden URL");
    }
    warn!(upstream = %redact_urls(target), error = %detail, "upstream request failed");
    if err.is_timeout() {
        text_response(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
    } else {
        text_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
    }
}

pub fn is_excluded_header(name: &str) -> bool {
    name.starts_with("access-control-") || EXCLUDED_RESPONSE_HEADERS.contains(&name)
}

/// Copy origin response headers, skipping the deny-list.
pub fn copy_response_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src {
        if is_excluded_header(name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Externally visible `scheme://host` of this gateway for one request.
///
/// `X-Forwarded-Proto` is only believed from a trusted proxy peer.
pub fn proxy_origin(headers: &HeaderMap, trusted_peer: bool) -> String {
    let scheme = trusted_peer
        .then(|| headers.get("x-forwarded-proto"))
        .flatten()
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or_default().trim().to_ascii_lowercase())
        .filter(|v| v == "http" || v == "https")
        .unwrap_or_else(|| "http".to_string());
    let host = headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    format!("{}://{}", scheme, host)
}

/// Reduce every URL in `msg` to its bare host.
///
/// Everything after the authority up to the next whitespace or `)` is
/// dropped, userinfo included, so paths and query strings (signed CDN
/// tokens, `api_key`) never reach the logs.
pub fn redact_urls(msg: &str) -> String {
    let mut out = String::with_capacity(msg.len());
    let mut rest = msg;
    while let Some(sep) = rest.find("://") {
        let scheme_start = rest.as_bytes()[..sep]
            .iter()
            .rposition(|b| !(b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')))
            .map_or(0, |i| i + 1);
        out.push_str(&rest[..scheme_start]);

        let after = &rest[sep + 3..];
        let url_end = after
            .find(|c: char| c.is_whitespace() || c == ')')
            .unwrap_or(after.len());
        let url = &after[..url_end];
        let authority = &url[..url.find(['/', '?', '#']).unwrap_or(url.len())];
        let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
        out.push_str(host);
        rest = &after[url_end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn body_string(resp: Response<BoxBody>) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_header_deny_list() {
        let mut src = HeaderMap::new();
        src.insert("content-type", HeaderValue::from_static("video/mp2t"));
        src.insert("content-length", HeaderValue::from_static("1024"));
        src.insert("access-control-allow-origin", HeaderValue::from_static("https://evil.example"));
        src.insert("access-control-allow-credentials", HeaderValue::from_static("true"));
        src.insert("content-encoding", HeaderValue::from_static("gzip"));
        src.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        src.insert("connection", HeaderValue::from_static("close"));
        src.append("set-cookie", HeaderValue::from_static("a=1"));
        src.append("set-cookie", HeaderValue::from_static("b=2"));

        let mut dst = HeaderMap::new();
        copy_response_headers(&src, &mut dst);

        assert_eq!(dst.get("content-type").unwrap(), "video/mp2t");
        assert_eq!(dst.get("content-length").unwrap(), "1024");
        assert_eq!(dst.get_all("set-cookie").iter().count(), 2);
        assert!(dst.get("access-control-allow-origin").is_none());
        assert!(dst.get("access-control-allow-credentials").is_none());
        assert!(dst.get("content-encoding").is_none());
        assert!(dst.get("transfer-encoding").is_none());
        assert!(dst.get("connection").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_fails_after_idle_limit() {
        let frames = futures_util::stream::iter(vec![Ok::<_, std::convert::Infallible>(
            hyper::body::Frame::data(Bytes::from_static(b"first")),
        )])
        .chain(futures_util::stream::pending());
        let mut body = with_idle_timeout(StreamBody::new(frames), Duration::from_secs(30));

        let first = body.frame().await.unwrap().unwrap();
        assert_eq!(first.into_data().unwrap(), "first");

        let started = tokio::time::Instant::now();
        let err = body.frame().await.unwrap().unwrap_err();
        assert!(err.is::<BodyIdleTimeout>());
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(body.frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_but_steady_body_completes() {
        let frames = futures_util::stream::iter(0..3).then(|i| async move {
            tokio::time::sleep(Duration::from_secs(20)).await;
            Ok::<_, std::convert::Infallible>(hyper::body::Frame::data(Bytes::from(
                i.to_string(),
            )))
        });
        let body = with_idle_timeout(StreamBody::new(frames), Duration::from_secs(30));
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, "012");
    }

    #[test]
    fn test_proxy_origin_scheme_trust() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("gw.example"));
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));

        assert_eq!(proxy_origin(&headers, true), "https://gw.example");
        assert_eq!(proxy_origin(&headers, false), "http://gw.example");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("javascript"));
        assert_eq!(proxy_origin(&headers, true), "http://gw.example");
    }

    #[test]
    fn test_redact_urls() {
        assert_eq!(
            redact_urls("error sending request for url (https://api.example.com/v1?key=abc)"),
            "error sending request for url (api.example.com)"
        );
        assert_eq!(
            redact_urls("GET http://u:pw@cdn.example:8080/live/a.m3u8?token=s3cr3t failed: reset"),
            "GET cdn.example:8080 failed: reset"
        );
        assert_eq!(
            redact_urls("https://api.themoviedb.org/3/movie/550?api_key=k"),
            "api.themoviedb.org"
        );
        assert_eq!(redact_urls("a=x://h/p b"), "a=h b");
        assert_eq!(redact_urls("connection refused"), "connection refused");
    }

    #[tokio::test]
    async fn test_text_response_shape() {
        let resp = text_response(StatusCode::FORBIDDEN, "Unauthorized");
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(resp.headers()[CONTENT_TYPE], "text/plain; charset=utf-8");
        assert_eq!(body_string(resp).await, "Unauthorized\n");
    }
}
