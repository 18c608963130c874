//! TMDB catalog passthrough under `/api/...` and `/t/...`.

use std::time::Duration;

use hyper::header::{HeaderValue, ACCEPT, CACHE_CONTROL, USER_AGENT};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use tracing::{debug, warn};

use super::{
    copy_response_headers, cors, empty_body, json_response, redact_urls, text_response,
    with_idle_timeout, BoxBody, BROWSER_USER_AGENT,
};
use crate::state::AppState;

const API_ORIGIN: &str = "https://api.themoviedb.org";
const IMAGE_ORIGIN: &str = "https://image.tmdb.org";

const IMAGE_CACHE_CONTROL: &str = "public, max-age=604800";
const API_CACHE_CONTROL: &str = "public, max-age=600";

#[derive(Debug, PartialEq, Eq)]
enum Upstream {
    Usage,
    Api(String),
    Image(String),
}

impl Upstream {
    fn from_path(path: &str, query: Option<&str>) -> Option<Self> {
        let with_query = |url: String| match query {
            Some(q) if !q.is_empty() => format!("{}?{}", url, q),
            _ => url,
        };
        if path == "/api" || path == "/api/" {
            return Some(Self::Usage);
        }
        if let Some(rest) = path.strip_prefix("/api/") {
            return Some(Self::Api(with_query(format!("{}/{}", API_ORIGIN, rest))));
        }
        if path.starts_with("/t/") {
            return Some(Self::Image(with_query(format!("{}{}", IMAGE_ORIGIN, path))));
        }
        None
    }
}

pub async fn handle<B>(req: Request<B>, state: &AppState) -> Response<BoxBody> {
    let mut resp = dispatch(req, state).await;
    cors::apply(resp.headers_mut());
    resp
}

async fn dispatch<B>(req: Request<B>, state: &AppState) -> Response<BoxBody> {
    match *req.method() {
        Method::OPTIONS => return cors::preflight(),
        Method::GET | Method::HEAD => {}
        _ => return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"),
    }

    let (url, cache_control) = match Upstream::from_path(req.uri().path(), req.uri().query()) {
        Some(Upstream::Usage) => return usage(),
        Some(Upstream::Api(url)) => (url, API_CACHE_CONTROL),
        Some(Upstream::Image(url)) => (url, IMAGE_CACHE_CONTROL),
        None => return text_response(StatusCode::NOT_FOUND, "Not Found"),
    };

    let accept = req
        .headers()
        .get(ACCEPT)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*/*"));
    let upstream_req = match Request::builder()
        .method(req.method().clone())
        .uri(url.as_str())
        .header(ACCEPT, accept)
        .header(USER_AGENT, BROWSER_USER_AGENT)
        .body(empty_body())
    {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "catalog path not representable as URI");
            return text_response(StatusCode::BAD_REQUEST, "Invalid URL");
        }
    };

    let origin = match state.client.send(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(upstream = %redact_urls(&url), error = %e, "catalog request failed");
            return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
        }
    };

    let status = origin.status();
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    copy_response_headers(origin.headers(), resp.headers_mut());
    if status.is_success() {
        resp.headers_mut()
            .insert(CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }
    let idle = Duration::from_secs(state.config.upstream_read_idle_timeout_secs);
    *resp.body_mut() = with_idle_timeout(origin.into_body(), idle);
    debug!(upstream = %redact_urls(&url), status = status.as_u16(), "catalog proxied");
    resp
}

fn usage() -> Response<BoxBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "message": "TMDB Proxy is running",
            "usage": {
                "api": "/api/3/movie/popular?api_key=YOUR_KEY&language=zh-CN",
                "image": "/t/p/w500/YOUR_IMAGE_PATH.jpg",
            },
        }),
    )
}
