//! Roomcast client.
//!
//! A thin QUIC client for the roomcast relay. It owns no protocol state: the
//! caller pushes [`ClientMessage`]s in and reads [`ServerMessage`]s out, and a
//! pair of background tasks move frames over the connection's single
//! bidirectional stream.
//!
//! Used by end-to-end tests and command-line tooling.

#![forbid(unsafe_code)]

mod error;
pub mod transport;

pub use error::TransportError;
pub use roomcast_proto::{ClientMessage, ServerMessage};
pub use transport::{ConnectedClient, TransportConfig, connect, connect_with_config};
