//! Outbound networking: address policy, resolution, dialing and the pooled client.

pub mod client;
pub mod connector;
pub mod dialer;
pub mod policy;
pub mod resolver;

pub use client::{OutboundClient, UpstreamError};
pub use dialer::SafeDialer;
pub use resolver::SafeResolver;
