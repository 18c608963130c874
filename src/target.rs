//! Validation of client-supplied target URLs.
//!
//! A target must be an absolute `http`/`https` URL with a host and without
//! userinfo. Address safety is not decided here; that happens in
//! [`SafeResolver`](crate::net::SafeResolver) when the target is dialed.

use thiserror::Error;
use url::Url;

/// Longest accepted `url` query value, after trimming.
pub const MAX_TARGET_LEN: usize = 8 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TargetError {
    #[error("target URL exceeds {MAX_TARGET_LEN} bytes")]
    TooLong,
    #[error("invalid target URL: {0}")]
    Parse(#[from] url::ParseError),
    #[error("unsupported scheme {0:?}")]
    UnsupportedScheme(String),
    #[error("target URL has no host")]
    MissingHost,
    #[error("userinfo is not allowed in target URLs")]
    Userinfo,
}

impl TargetError {
    /// Malformed input (400) as opposed to a well-formed but forbidden target (403).
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::TooLong | Self::Parse(_))
    }
}

/// Parse and validate a raw `url` parameter.
pub fn parse_target(raw: &str) -> Result<Url, TargetError> {
    let raw = raw.trim();
    if raw.len() > MAX_TARGET_LEN {
        return Err(TargetError::TooLong);
    }
    let url = Url::parse(raw)?;
    validate_target(&url)?;
    Ok(url)
}

pub fn validate_target(url: &Url) -> Result<(), TargetError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(TargetError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(TargetError::MissingHost);
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(TargetError::Userinfo);
    }
    Ok(())
}

/// `scheme://host[:port]` of a validated target.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}
