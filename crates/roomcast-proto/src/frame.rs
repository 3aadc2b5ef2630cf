//! Frame type combining header and payload.
//!
//! A `Frame` is the transport-layer packet:
//! - 12-byte raw binary header (Big Endian)
//! - Variable-length payload bytes (already CBOR-encoded)
//!
//! This is a pure data holder. For typed events see
//! [`crate::ClientMessage::into_frame`] and [`crate::ServerMessage::from_frame`].

use bytes::{BufMut, Bytes};

use crate::{
    FrameHeader,
    errors::{ProtocolError, Result},
};

/// Complete protocol frame (transport layer).
///
/// Layout on the wire: `[FrameHeader: 12 bytes] + [payload: variable bytes]`
///
/// # Invariants
///
/// - `payload.len()` matches `header.payload_size()`. Enforced by
///   [`Frame::new`] and verified by [`Frame::decode`].
/// - `payload.len()` does not exceed [`FrameHeader::MAX_PAYLOAD_SIZE`] on
///   anything that reaches the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,

    /// Raw payload bytes (CBOR)
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame; the header's payload size is derived from `payload`.
    ///
    /// Size limits are checked by [`Frame::encode`], not here.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        // Saturate: an oversized payload is rejected by encode() anyway.
        let size = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self { header: FrameHeader::new(size), payload }
    }

    /// Total encoded length.
    pub fn wire_len(&self) -> usize {
        FrameHeader::SIZE + self.payload.len()
    }

    /// Encode frame to wire format.
    ///
    /// # Errors
    ///
    /// `ProtocolError::PayloadTooLarge` if the payload exceeds the cap.
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        debug_assert_eq!(self.payload.len(), self.header.payload_size() as usize);

        if self.payload.len() > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE as usize,
            });
        }

        dst.put_slice(&self.header.to_bytes());
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode a frame from wire bytes.
    ///
    /// Validates framing only; the payload is not deserialized. Trailing
    /// bytes beyond the claimed payload are ignored.
    ///
    /// # Errors
    ///
    /// - Any header error from [`FrameHeader::from_bytes`]
    /// - `ProtocolError::FrameTruncated` if fewer payload bytes than claimed
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;
        let payload_size = header.payload_size() as usize;
        let total_size = FrameHeader::SIZE + payload_size;

        let payload = bytes.get(FrameHeader::SIZE..total_size).ok_or(
            ProtocolError::FrameTruncated {
                expected: payload_size,
                actual: bytes.len().saturating_sub(FrameHeader::SIZE),
            },
        )?;

        Ok(Self { header: *header, payload: Bytes::copy_from_slice(payload) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_with_payload() {
        let frame = Frame::new(vec![1, 2, 3, 4]);
        assert_eq!(frame.header.payload_size(), 4);
        assert_eq!(frame.wire_len(), FrameHeader::SIZE + 4);

        let mut wire = Vec::new();
        frame.encode(&mut wire).expect("should encode");

        let parsed = Frame::decode(&wire).expect("should decode");
        assert_eq!(frame, parsed);
    }

    #[test]
    fn reject_truncated_frame() {
        let header = FrameHeader::new(100);
        let result = Frame::decode(&header.to_bytes());
        assert!(matches!(result, Err(ProtocolError::FrameTruncated { expected: 100, actual: 0 })));
    }

    #[test]
    fn reject_oversized_encode() {
        let frame = Frame::new(vec![0u8; FrameHeader::MAX_PAYLOAD_SIZE as usize + 1]);
        let mut wire = Vec::new();
        assert!(matches!(frame.encode(&mut wire), Err(ProtocolError::PayloadTooLarge { .. })));
        assert!(wire.is_empty());
    }

    #[test]
    fn trailing_bytes_ignored() {
        let mut wire = Vec::new();
        Frame::new(vec![7, 7]).encode(&mut wire).unwrap();
        wire.extend_from_slice(&[9, 9, 9]);

        let parsed = Frame::decode(&wire).unwrap();
        assert_eq!(parsed.payload.as_ref(), &[7, 7]);
    }
}
