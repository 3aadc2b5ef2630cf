//! Client error types.

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Handshake did not finish within the configured timeout.
    #[error("connection timed out")]
    Timeout,

    /// Stream error.
    #[error("stream error: {0}")]
    Stream(String),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection's background tasks have stopped.
    #[error("connection closed")]
    Closed,
}

impl From<roomcast_proto::ProtocolError> for TransportError {
    fn from(err: roomcast_proto::ProtocolError) -> Self {
        Self::Protocol(err.to_string())
    }
}
