use std::net::SocketAddr;

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response};

use super::{catalog, forward, full_body, subscription, BoxBody, BoxError};
use crate::state::AppState;

pub const SUBSCRIPTION_PATH: &str = "/sub/moon2donggua";

#[derive(Debug, PartialEq, Eq)]
enum Route {
    Health,
    Catalog,
    Subscription,
    Forward,
}

fn route(path: &str) -> Route {
    match path {
        "/health" => Route::Health,
        SUBSCRIPTION_PATH => Route::Subscription,
        "/api" => Route::Catalog,
        p if p.starts_with("/api/") || p.starts_with("/t/") => Route::Catalog,
        _ => Route::Forward,
    }
}

fn health() -> Response<BoxBody> {
    let mut resp = Response::new(full_body("OK"));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Dispatch an admitted request to its handler.
pub async fn dispatch<B>(req: Request<B>, state: &AppState, peer: SocketAddr) -> Response<BoxBody>
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    match route(req.uri().path()) {
        Route::Health => health(),
        Route::Catalog => catalog::handle(req, state).await,
        Route::Subscription => subscription::handle(req, state).await,
        Route::Forward => forward::handle(req, state, peer).await,
    }
}
