//! Roomcast wire protocol.
//!
//! Every unit on the wire is a [`Frame`]: a fixed 12-byte big-endian
//! [`FrameHeader`] followed by a CBOR payload. Payloads are tagged events,
//! [`ClientMessage`] in the client to server direction and [`ServerMessage`]
//! the other way. Decoding is split in two so a connection can tell a broken
//! stream (bad header, must close) from a bad event (reject, keep going).

mod errors;
mod frame;
mod header;
mod messages;

pub use errors::{ProtocolError, Result};
pub use frame::Frame;
pub use header::FrameHeader;
pub use messages::{
    ChatMessage, ClientMessage, ErrorCode, ErrorPayload, PresenceEvent, ServerMessage, SignalKind,
};

/// ALPN protocol identifier negotiated by client and server.
pub const ALPN_PROTOCOL: &[u8] = b"roomcast/1";
