//! Remote terminal endpoint integration module
//!
//! Handles session negotiation, the WebSocket stream upgrade and the live
//! connection lifecycle.

pub mod connection;
pub mod connector;
pub mod mock;
pub mod negotiator;
pub mod types;

// Re-export commonly used types
pub use connection::{Connection, FrameReader, Inbound};
pub use connector::TransportConnector;
pub use negotiator::SessionNegotiator;
pub use types::*;
