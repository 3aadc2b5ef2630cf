//! Tagged events carried in frame payloads.
//!
//! One variant per event kind. Payloads are CBOR maps keyed by the
//! kebab-case variant name, so an unknown or misshapen event fails to decode
//! at the boundary instead of reaching the relay half-formed.

use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{
    Frame,
    errors::{ProtocolError, Result},
};

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientMessage {
    /// First event on every connection: present a credential token.
    Authenticate {
        /// Opaque credential issued by the identity provider
        token: String,
    },
    /// Join a room by key.
    Join {
        /// Room key
        room: String,
    },
    /// Join the private room shared with `peer`; the server derives the key.
    JoinPrivate {
        /// User id of the other participant
        peer: String,
    },
    /// Leave a room.
    Leave {
        /// Room key
        room: String,
    },
    /// Send a text message to a room.
    Send {
        /// Room key
        room: String,
        /// Message text
        body: String,
    },
    /// Call offer for another connection.
    SignalOffer {
        /// Target connection id
        to: u64,
        /// Opaque signaling blob
        payload: Bytes,
    },
    /// Call answer for another connection.
    SignalAnswer {
        /// Target connection id
        to: u64,
        /// Opaque signaling blob
        payload: Bytes,
    },
    /// ICE candidate for another connection.
    SignalIce {
        /// Target connection id
        to: u64,
        /// Opaque signaling blob
        payload: Bytes,
    },
    /// Liveness probe; answered with [`ServerMessage::Pong`].
    Ping,
    /// Answer to a server [`ServerMessage::Ping`].
    Pong,
}

impl ClientMessage {
    /// Event name, for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::Join { .. } => "join",
            Self::JoinPrivate { .. } => "join-private",
            Self::Leave { .. } => "leave",
            Self::Send { .. } => "send",
            Self::SignalOffer { .. } => "signal-offer",
            Self::SignalAnswer { .. } => "signal-answer",
            Self::SignalIce { .. } => "signal-ice",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    /// Encode into a frame.
    pub fn into_frame(&self) -> Result<Frame> {
        encode(self)
    }

    /// Decode from a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        decode(&frame.payload)
    }
}

/// A persisted chat message as delivered to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Room key
    pub room: String,
    /// Position in the room's log, dense from 0
    pub seq: u64,
    /// Sender user id
    pub sender: String,
    /// Sender display name at send time
    pub sender_name: String,
    /// Message text as submitted
    pub body: String,
    /// Server-assigned timestamp, Unix milliseconds
    pub time: u64,
}

/// Membership change visible to the other members of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// Room key
    pub room: String,
    /// Connection that joined or left; usable as a signaling target
    pub connection_id: u64,
    /// User id bound to the connection
    pub user_id: String,
    /// Display name bound to the connection
    pub display_name: String,
}

/// Which signaling step a relayed blob belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Call offer
    Offer,
    /// Call answer
    Answer,
    /// ICE candidate
    Ice,
}

/// Error codes reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Credential missing, invalid or expired; the connection is closed.
    AuthError,
    /// Event other than `authenticate` before authentication completed.
    NotAuthenticated,
    /// Caller is not a member of the room it addressed.
    NotAMember,
    /// Message body is empty after trimming.
    EmptyBody,
    /// Message body exceeds the configured limit.
    BodyTooLong,
    /// Room key is not acceptable.
    InvalidRoom,
    /// Message could not be stored; it was not delivered to anyone.
    PersistenceFailure,
    /// Payload did not decode into a known event.
    Protocol,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Error report sent to a single client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
    /// Room the failed request addressed, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
}

impl ErrorPayload {
    /// Error without a room context.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), room: None }
    }

    /// Attach the room the failed request addressed.
    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }
}

/// Events sent by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Authentication succeeded; the connection is active.
    Authenticated {
        /// Connection id other clients use to address signaling
        connection_id: u64,
        /// Verified user id
        user_id: String,
        /// Verified display name
        display_name: String,
    },
    /// Join acknowledged. Followed by a history batch for the room.
    Joined {
        /// Room key
        room: String,
        /// Members after the join, including the caller
        member_count: usize,
    },
    /// Leave acknowledged.
    Left {
        /// Room key
        room: String,
    },
    /// A new message in a room the connection has joined.
    Message(ChatMessage),
    /// Recent history, oldest first, sent only to a joining connection.
    HistoryBatch {
        /// Room key
        room: String,
        /// Messages, oldest first
        messages: Vec<ChatMessage>,
    },
    /// Another connection joined a room.
    PresenceJoined(PresenceEvent),
    /// Another connection left a room or disconnected.
    PresenceLeft(PresenceEvent),
    /// Signaling blob relayed from another connection.
    SignalIncoming {
        /// Sender connection id
        from: u64,
        /// Sender display name, when the sender is authenticated
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_name: Option<String>,
        /// Signaling step
        kind: SignalKind,
        /// Blob, verbatim
        payload: Bytes,
    },
    /// A request from this connection failed.
    Error(ErrorPayload),
    /// Heartbeat probe; answer with [`ClientMessage::Pong`].
    Ping,
    /// Answer to a client [`ClientMessage::Ping`].
    Pong,
}

impl ServerMessage {
    /// Shorthand for an error event.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload::new(code, message))
    }

    /// Encode into a frame.
    pub fn into_frame(&self) -> Result<Frame> {
        encode(self)
    }

    /// Decode from a frame.
    pub fn from_frame(frame: &Frame) -> Result<Self> {
        decode(&frame.payload)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Frame> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtocolError::CborEncode(e.to_string()))?;
    Ok(Frame::new(buf))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::CborDecode(e.to_string()))
}
