//! Point-to-point signaling relay.
//!
//! Call setup blobs go straight from one connection to another, addressed by
//! connection id. They never touch rooms or storage and are forwarded
//! byte-for-byte. An unreachable target is not an error the sender hears
//! about; the blob is dropped. A blob too large to fit the outbound frame is
//! refused before anything is queued.

use std::sync::Arc;

use bytes::Bytes;
use roomcast_proto::{FrameHeader, ServerMessage, SignalKind};
use tracing::{debug, trace};

use crate::registry::SessionRegistry;

/// Frame space kept free for the `signal-incoming` envelope around a blob.
///
/// Covers the variant tag, sender id, kind and a display name bounded by the
/// credential token size.
pub const SIGNAL_ENVELOPE_RESERVE: usize = 16 * 1024;

/// Largest blob that still fits a `signal-incoming` frame.
pub const MAX_SIGNAL_PAYLOAD: usize =
    FrameHeader::MAX_PAYLOAD_SIZE as usize - SIGNAL_ENVELOPE_RESERVE;

/// Signaling errors reported to the sender.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    /// The blob cannot be re-framed for the target.
    #[error("signal payload is {size} bytes, limit is {max}")]
    PayloadTooLarge {
        /// Blob size in bytes
        size: usize,
        /// Largest relayable blob
        max: usize,
    },
}

/// Forwards signaling blobs between authenticated connections.
#[derive(Debug, Clone)]
pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
}

impl SignalingRelay {
    /// Relay backed by `registry` for target lookup.
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Forward `payload` from `from` to `to`.
    ///
    /// Returns `Ok(false)` if the target is not an authenticated connection
    /// or its outbox is not accepting. The sender is not told about those.
    ///
    /// # Errors
    ///
    /// `PayloadTooLarge` if `payload` exceeds [`MAX_SIGNAL_PAYLOAD`].
    pub fn relay(
        &self,
        from: u64,
        to: u64,
        kind: SignalKind,
        payload: Bytes,
    ) -> Result<bool, SignalError> {
        if payload.len() > MAX_SIGNAL_PAYLOAD {
            return Err(SignalError::PayloadTooLarge { size: payload.len(), max: MAX_SIGNAL_PAYLOAD });
        }

        let Some(outbox) = self.registry.outbox(to) else {
            debug!(from, to, ?kind, "signal target unreachable, dropped");
            return Ok(false);
        };

        let delivered = outbox.deliver(ServerMessage::SignalIncoming {
            from,
            from_name: self.registry.presence(from),
            kind,
            payload,
        });

        if delivered {
            trace!(from, to, ?kind, "signal relayed");
        } else {
            debug!(from, to, ?kind, "signal target closing, dropped");
        }
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use roomcast_core::Identity;

    use super::*;
    use crate::outbox::Outbox;

    #[test]
    fn relays_blob_verbatim() {
        let registry = Arc::new(SessionRegistry::new());
        let (alice_out, _alice_rx) = Outbox::channel();
        let (bob_out, mut bob_rx) = Outbox::channel();
        registry.register(1, Identity::new("alice", "Alice"), alice_out).unwrap();
        registry.register(2, Identity::new("bob", "Bob"), bob_out).unwrap();
        let relay = SignalingRelay::new(registry);

        let blob = Bytes::from_static(b"v=0\r\no=- 4611 2 IN IP4 127.0.0.1\r\n\x00\xff");
        assert!(relay.relay(1, 2, SignalKind::Offer, blob.clone()).unwrap());

        assert_eq!(
            bob_rx.try_recv().unwrap(),
            ServerMessage::SignalIncoming {
                from: 1,
                from_name: Some("Alice".into()),
                kind: SignalKind::Offer,
                payload: blob,
            }
        );
    }

    #[test]
    fn unknown_target_is_dropped_silently() {
        let registry = Arc::new(SessionRegistry::new());
        let (alice_out, mut alice_rx) = Outbox::channel();
        registry.register(1, Identity::new("alice", "Alice"), alice_out).unwrap();
        let relay = SignalingRelay::new(registry);

        assert!(!relay.relay(1, 99, SignalKind::Ice, Bytes::from_static(b"candidate")).unwrap());
        assert!(alice_rx.try_recv().is_err(), "sender hears nothing");
    }

    #[test]
    fn closed_target_is_dropped() {
        let registry = Arc::new(SessionRegistry::new());
        let (bob_out, bob_rx) = Outbox::channel();
        registry.register(2, Identity::new("bob", "Bob"), bob_out).unwrap();
        drop(bob_rx);
        let relay = SignalingRelay::new(registry);

        assert!(!relay.relay(1, 2, SignalKind::Answer, Bytes::new()).unwrap());
    }

    #[test]
    fn largest_blob_fits_outbound_frame() {
        let registry = Arc::new(SessionRegistry::new());
        let (bob_out, mut bob_rx) = Outbox::channel();
        // Longer than any display name a size-capped token can carry.
        let (alice_out, _alice_rx) = Outbox::channel();
        registry.register(1, Identity::new("a".repeat(1000), "n".repeat(2000)), alice_out).unwrap();
        registry.register(u64::MAX, Identity::new("bob", "Bob"), bob_out).unwrap();
        let relay = SignalingRelay::new(registry);

        let blob = Bytes::from(vec![0xab; MAX_SIGNAL_PAYLOAD]);
        assert!(relay.relay(1, u64::MAX, SignalKind::Offer, blob).unwrap());

        let mut buf = bytes::BytesMut::new();
        bob_rx.try_recv().unwrap().into_frame().unwrap().encode(&mut buf).unwrap();
        assert!(buf.len() <= FrameHeader::SIZE + FrameHeader::MAX_PAYLOAD_SIZE as usize);
    }

    #[test]
    fn oversized_blob_is_refused_before_queueing() {
        let registry = Arc::new(SessionRegistry::new());
        let (bob_out, mut bob_rx) = Outbox::channel();
        registry.register(2, Identity::new("bob", "Bob"), bob_out).unwrap();
        let relay = SignalingRelay::new(registry);

        let blob = Bytes::from(vec![0u8; MAX_SIGNAL_PAYLOAD + 1]);
        assert_eq!(
            relay.relay(1, 2, SignalKind::Offer, blob),
            Err(SignalError::PayloadTooLarge { size: MAX_SIGNAL_PAYLOAD + 1, max: MAX_SIGNAL_PAYLOAD })
        );
        assert!(bob_rx.try_recv().is_err());
    }
}
