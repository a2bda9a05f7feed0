//! Protocol message types for the WebSocket relay.
//!
//! Defines the JSON message format used between client and relay:
//! - [`OutgoingMessage`] - Messages sent from client to relay
//! - [`IncomingMessage`] - Messages received from relay
//!
//! Also provides type-safe ID wrappers for compile-time safety.

mod ids;
mod messages;

pub use ids::*;
pub use messages::*;
