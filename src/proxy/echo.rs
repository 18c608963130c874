//! Diagnostic endpoint that echoes what the gateway received.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
use hyper::{Request, Response, StatusCode};

use super::{full_body, BoxBody};

const REDACTED_HEADERS: &[&str] = &["authorization", "proxy-authorization", "cookie", "set-cookie"];

pub fn handle<B>(req: &Request<B>, peer: SocketAddr) -> Response<BoxBody> {
    let mut resp = Response::new(full_body(render(req, peer)));
    *resp.status_mut() = StatusCode::OK;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// `Key: value` lines sorted by key, one per header plus request metadata.
fn render<B>(req: &Request<B>, peer: SocketAddr) -> String {
    let mut fields: BTreeMap<String, String> = BTreeMap::new();

    for name in req.headers().keys() {
        if name == HOST {
            continue;
        }
        let value = if REDACTED_HEADERS.contains(&name.as_str()) {
            "[REDACTED]".to_string()
        } else {
            req.headers()
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect::<Vec<_>>()
                .join(", ")
        };
        fields.insert(canonical_header_name(name.as_str()), value);
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    fields.insert("Host".into(), host);
    fields.insert("RemoteAddr".into(), peer.to_string());
    fields.insert("Method".into(), req.method().to_string());
    fields.insert("URL".into(), req.uri().path().to_string());
    fields.insert("Protocol".into(), format!("{:?}", req.version()));

    let mut out = String::new();
    for (key, value) in &fields {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    out
}

/// `x-forwarded-for` -> `X-Forwarded-For`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
