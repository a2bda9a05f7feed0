//! Forwarding core.
//!
//! - [`TargetClient`] - issues requests to the configured target
//! - [`RequestRelay`] - runs one forward per inbound request and writes the reply
//! - [`InboundRequest`] / [`ForwardResponse`] - the request and reply shapes

mod dispatch;
mod request;
mod target;

pub use dispatch::{RelayConfig, RequestRelay, DEFAULT_DRAIN_GRACE, DEFAULT_MAX_IN_FLIGHT};
pub use request::{headers_from_pairs, ForwardResponse, InboundRequest};
pub use target::{ForwardConfig, TargetClient, DEFAULT_REQUEST_TIMEOUT};
