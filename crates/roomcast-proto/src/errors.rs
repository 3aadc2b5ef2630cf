//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors produced while framing or decoding wire data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer shorter than a frame header.
    #[error("frame too short: expected {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Header does not start with the roomcast magic number.
    #[error("invalid magic number")]
    InvalidMagic,

    /// Header carries a protocol version this build does not speak.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Payload exceeds [`crate::FrameHeader::MAX_PAYLOAD_SIZE`].
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Claimed or actual payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// Fewer payload bytes than the header claims.
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Payload bytes claimed by the header
        expected: usize,
        /// Payload bytes present
        actual: usize,
    },

    /// CBOR encoding failed.
    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    /// CBOR decoding failed or the payload is not a known event.
    #[error("CBOR decode failed: {0}")]
    CborDecode(String),
}

impl ProtocolError {
    /// Whether the error leaves the byte stream in an unknown position.
    ///
    /// Header-level failures cannot be skipped over, so the connection has
    /// to be closed. Payload failures only invalidate one event.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::CborDecode(_) | Self::CborEncode(_))
    }
}
