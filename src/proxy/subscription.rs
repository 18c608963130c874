//! Subscription format translation (`/sub/moon2donggua`).
//!
//! Fetches a `{"api_site": {key: {api, name}}}` document and answers with
//! the equivalent `{"sites": [{key, name, api, active}]}` list.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Limited};
use hyper::{Method, Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::forward::query_param;
use super::{
    empty_body, json_response, redact_urls, text_response, upstream_error_response,
    with_idle_timeout, BoxBody, BoxError,
};
use crate::state::AppState;
use crate::target::parse_target;

/// Largest subscription document read from the origin.
pub const MAX_SUBSCRIPTION_BYTES: usize = 1024 * 1024;

#[derive(Debug, Deserialize)]
struct SourceDocument {
    #[serde(default)]
    api_site: BTreeMap<String, SourceSite>,
}

#[derive(Debug, Deserialize)]
struct SourceSite {
    #[serde(default)]
    api: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Site {
    pub key: String,
    pub name: String,
    pub api: String,
    pub active: bool,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Subscription {
    pub sites: Vec<Site>,
}

/// Translate a source document. Sites come out sorted by key.
pub fn translate(raw: &[u8]) -> Result<Subscription, serde_json::Error> {
    let doc: SourceDocument = serde_json::from_slice(raw)?;
    let sites = doc
        .api_site
        .into_iter()
        .map(|(key, site)| Site {
            key,
            name: site.name,
            api: site.api,
            active: true,
        })
        .collect();
    Ok(Subscription { sites })
}

pub async fn handle<B>(req: Request<B>, state: &AppState) -> Response<BoxBody> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    }

    let raw = query_param(&req, "url").unwrap_or_default();
    if raw.is_empty() {
        return text_response(StatusCode::BAD_REQUEST, "Missing 'url' parameter");
    }
    let target = match parse_target(&raw) {
        Ok(url) => url,
        Err(e) if e.is_malformed() => {
            debug!(error = %e, "invalid subscription url");
            return text_response(StatusCode::BAD_REQUEST, "Invalid URL");
        }
        Err(e) => {
            warn!(target: "security", error = %e, "forbidden subscription url");
            return text_response(StatusCode::FORBIDDEN, "Forbidden URL");
        }
    };

    let upstream_req = match Request::get(target.as_str()).body(empty_body()) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "subscription url not representable as URI");
            return text_response(StatusCode::BAD_REQUEST, "Invalid URL");
        }
    };
    let upstream = match state.client.send(upstream_req).await {
        Ok(resp) => resp,
        Err(e) => return upstream_error_response(&e, target.as_str()),
    };
    let host = redact_urls(target.as_str());
    if upstream.status() != StatusCode::OK {
        warn!(upstream = %host, status = upstream.status().as_u16(), "subscription origin returned non-200");
        return text_response(StatusCode::BAD_GATEWAY, "Bad Gateway");
    }

    let idle = Duration::from_secs(state.config.upstream_read_idle_timeout_secs);
    let origin_body = with_idle_timeout(upstream.into_body(), idle);
    let body = match collect_limited(origin_body, MAX_SUBSCRIPTION_BYTES).await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(upstream = %host, error = %e, "reading subscription failed");
            return text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    match translate(&body).and_then(|sub| serde_json::to_value(&sub)) {
        Ok(value) => {
            debug!(upstream = %host, "subscription translated");
            json_response(StatusCode::OK, &value)
        }
        Err(e) => {
            warn!(upstream = %host, error = %e, "decoding subscription failed");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

// Non-async wrapper so the collect future is an opaque `Send` type; awaiting
// `Limited::collect` directly in an async fn trips a rustc higher-ranked
// lifetime bug when the caller is spawned.
fn collect_limited(
    body: BoxBody,
    limit: usize,
) -> impl Future<Output = Result<Collected<Bytes>, BoxError>> + Send {
    Limited::new(body, limit).collect()
}
