//! Message relay: validate, persist, then fan out.
//!
//! A message is appended to storage and broadcast while the room's lock is
//! held. Two sends to the same room therefore reach every member in the order
//! storage assigned, and a message that failed to persist is never seen by
//! anyone.

use roomcast_core::{Identity, RoomKey};
use roomcast_proto::{ChatMessage, ErrorCode, ErrorPayload, ServerMessage};
use tracing::{debug, warn};

use crate::{
    room_manager::{HistoryReplay, Member, RoomManager},
    storage::{Storage, StorageError},
};

/// Messages replayed to a joining connection.
pub const HISTORY_LIMIT: usize = 50;

/// Default cap on a message body, in bytes.
pub const DEFAULT_MAX_BODY_LEN: usize = 4096;

/// Encoded size of a chat message beyond its body, upper bound.
///
/// Room keys are at most 256 bytes and a token-sized credential bounds the
/// sender id and display name together.
pub const MESSAGE_ENVELOPE_RESERVE: usize = 4096;

/// Errors from relay operations. Always reported to the caller only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The connection is not joined to the room it addressed.
    #[error("not a member of room {room}")]
    NotAMember {
        /// Room key as addressed
        room: String,
    },

    /// Body is empty after trimming whitespace.
    #[error("message body is empty")]
    EmptyBody,

    /// Body exceeds the configured limit.
    #[error("message body is {len} bytes, limit is {max}")]
    BodyTooLong {
        /// Body length in bytes
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Storage rejected the append or the history read.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),
}

impl RelayError {
    /// Wire error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotAMember { .. } => ErrorCode::NotAMember,
            Self::EmptyBody => ErrorCode::EmptyBody,
            Self::BodyTooLong { .. } => ErrorCode::BodyTooLong,
            Self::Persistence(_) => ErrorCode::PersistenceFailure,
        }
    }

    /// Error payload for the caller, tagged with the room when known.
    pub fn to_payload(&self, room: Option<&RoomKey>) -> ErrorPayload {
        let payload = ErrorPayload::new(self.code(), self.to_string());
        match room {
            Some(room) => payload.with_room(room.as_str()),
            None => payload,
        }
    }
}

/// Validates, persists and broadcasts messages; replays history on join.
#[derive(Debug, Clone)]
pub struct MessageRelay<S: Storage> {
    storage: S,
    history_limit: usize,
    max_body_len: usize,
}

impl<S: Storage> MessageRelay<S> {
    /// Relay with the default history window and body limit.
    pub fn new(storage: S) -> Self {
        Self::with_limits(storage, HISTORY_LIMIT, DEFAULT_MAX_BODY_LEN)
    }

    /// Relay with explicit limits.
    pub fn with_limits(storage: S, history_limit: usize, max_body_len: usize) -> Self {
        Self { storage, history_limit, max_body_len }
    }

    /// Backing storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// History window replayed on join.
    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Send `body` from `connection_id` to `room`.
    ///
    /// Checks membership, then the body. On success the message is persisted
    /// (which assigns its sequence number and timestamp) and delivered to
    /// every member, the sender included.
    ///
    /// # Errors
    ///
    /// - `NotAMember` if the connection is not joined to `room`
    /// - `EmptyBody` / `BodyTooLong` on validation failure
    /// - `Persistence` if storage rejects the append; nothing is broadcast
    pub fn send(
        &self,
        rooms: &RoomManager,
        connection_id: u64,
        room: &RoomKey,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, RelayError> {
        rooms
            .with_room(room, |members| {
                if !members.contains(connection_id) {
                    return Err(RelayError::NotAMember { room: room.to_string() });
                }
                self.validate_body(body)?;

                let message = self.storage.append_message(room, sender, body).inspect_err(|err| {
                    warn!(connection_id, room = %room, error = %err, "message not persisted");
                })?;

                let delivered = members.broadcast(&ServerMessage::Message(message.clone()), None);
                debug!(connection_id, room = %room, seq = message.seq, delivered, "message relayed");

                Ok(message)
            })
            .unwrap_or_else(|| Err(RelayError::NotAMember { room: room.to_string() }))
    }

    /// Deliver up to `limit` most recent messages of `room`, oldest first, to
    /// `member` only.
    ///
    /// A batch is sent even when the room has no history, so the joiner can
    /// tell replay finished. On failure the member gets a
    /// `PersistenceFailure` error instead.
    ///
    /// # Errors
    ///
    /// `Persistence` if the history could not be read.
    pub fn replay_history(
        &self,
        member: &Member,
        room: &RoomKey,
        limit: usize,
    ) -> Result<usize, RelayError> {
        match self.storage.recent_messages(room, limit) {
            Ok(messages) => {
                let count = messages.len();
                member.outbox.deliver(ServerMessage::HistoryBatch { room: room.to_string(), messages });
                Ok(count)
            },
            Err(err) => {
                let err = RelayError::from(err);
                member.outbox.deliver(ServerMessage::Error(err.to_payload(Some(room))));
                Err(err)
            },
        }
    }

    fn validate_body(&self, body: &str) -> Result<(), RelayError> {
        if body.trim().is_empty() {
            return Err(RelayError::EmptyBody);
        }
        if body.len() > self.max_body_len {
            return Err(RelayError::BodyTooLong { len: body.len(), max: self.max_body_len });
        }
        Ok(())
    }
}

impl<S: Storage> HistoryReplay for MessageRelay<S> {
    fn replay(&self, member: &Member, room: &RoomKey) -> Result<usize, RelayError> {
        self.replay_history(member, room, self.history_limit)
    }
}
