//! Per-connection outbound queue.
//!
//! The relay never touches sockets. Every event for a connection goes through
//! its outbox; the runtime drains the receiving half into the stream. Pushing
//! is synchronous and never blocks, so fan-out can run while a room lock is
//! held and the order of pushes is the order of delivery.
//!
//! The queue is bounded. A reader that falls more than `capacity` events
//! behind overflows its outbox: from then on every delivery is refused, so
//! the connection never sees a gap, and the driver sheds it on the next tick.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use roomcast_proto::ServerMessage;
use tokio::sync::mpsc::{self, error::TrySendError};

/// Events a connection may have queued before it is shed.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1024;

/// Receiving half of an outbox, owned by the connection's writer task.
pub type OutboxReceiver = mpsc::Receiver<ServerMessage>;

/// Sending half of a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    overflowed: Arc<AtomicBool>,
}

impl Outbox {
    /// Create a connected outbox pair with the default capacity.
    pub fn channel() -> (Self, OutboxReceiver) {
        Self::with_capacity(DEFAULT_OUTBOX_CAPACITY)
    }

    /// Create a connected outbox pair holding at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> (Self, OutboxReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, overflowed: Arc::new(AtomicBool::new(false)) }, rx)
    }

    /// Queue an event.
    ///
    /// Returns `false` if the writer is gone or the queue has overflowed.
    pub fn deliver(&self, message: ServerMessage) -> bool {
        if self.overflowed.load(Ordering::Acquire) {
            return false;
        }

        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.overflowed.store(true, Ordering::Release);
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Whether the writer side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Whether a delivery found the queue full.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_preserves_order() {
        let (outbox, mut rx) = Outbox::channel();

        assert!(outbox.deliver(ServerMessage::Ping));
        assert!(outbox.deliver(ServerMessage::Pong));

        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Ping);
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::Pong);
    }

    #[test]
    fn delivery_to_dropped_receiver_fails() {
        let (outbox, rx) = Outbox::channel();
        drop(rx);

        assert!(outbox.is_closed());
        assert!(!outbox.deliver(ServerMessage::Ping));
        assert!(!outbox.is_overflowed());
    }

    #[test]
    fn overflow_refuses_everything_after() {
        let (outbox, mut rx) = Outbox::with_capacity(2);

        assert!(outbox.deliver(ServerMessage::Ping));
        assert!(outbox.deliver(ServerMessage::Ping));
        assert!(!outbox.deliver(ServerMessage::Pong));
        assert!(outbox.is_overflowed());

        // Room frees up, but the reader already missed an event.
        rx.try_recv().unwrap();
        assert!(!outbox.deliver(ServerMessage::Pong));

        rx.try_recv().unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn clones_share_overflow_state() {
        let (outbox, _rx) = Outbox::with_capacity(1);
        let other = outbox.clone();

        assert!(outbox.deliver(ServerMessage::Ping));
        assert!(!other.deliver(ServerMessage::Ping));
        assert!(outbox.is_overflowed());
    }
}
