//! Persistence gateway.
//!
//! Trait-based abstraction over the durable message log. The trait is
//! synchronous: callers hold a room's membership lock across append and
//! fan-out, so an append must complete before anyone else can send to that
//! room. Joins, leaves and disconnect cleanup in that room wait on the same
//! write, so the runtime calls the driver from the blocking pool.
//!
//! The gateway is the only timestamp authority. Clients never supply times;
//! each append is stamped with the storage clock, clamped so a room's log
//! never goes backwards even if the wall clock does.

mod chaotic;
mod error;
mod memory;
mod redb;

pub use chaotic::ChaoticStorage;
pub use error::StorageError;
pub use memory::MemoryStorage;
use roomcast_core::{Identity, RoomKey, RoomKind};
use roomcast_proto::ChatMessage;
use serde::{Deserialize, Serialize};

pub use self::redb::RedbStorage;

/// Source of wall-clock milliseconds for message timestamps.
pub type Clock = fn() -> u64;

/// Wall-clock milliseconds since the Unix epoch. A clock before 1970 reads
/// as zero; the per-room clamp keeps ordering intact regardless.
#[allow(clippy::disallowed_methods)]
pub fn system_clock_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Metadata recorded the first time a room is seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRoomMetadata {
    /// Private or group
    pub kind: RoomKind,
    /// User id that created the room
    pub created_by: String,
    /// Creation time, Unix milliseconds
    pub created_at_ms: u64,
}

/// Durable message log and room index.
///
/// Must be Clone (shared by the relay and the runtime), Send + Sync, and
/// synchronous. Implementations share internal state, so clones see the same
/// data.
pub trait Storage: Clone + Send + Sync + 'static {
    /// Append a message to a room's log.
    ///
    /// Assigns the next sequence number (dense from 0) and a timestamp no
    /// earlier than the room's previous message. Creates the room record if
    /// this is its first message.
    fn append_message(
        &self,
        room: &RoomKey,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StorageError>;

    /// Up to `limit` most recent messages of a room, oldest first.
    fn recent_messages(&self, room: &RoomKey, limit: usize)
    -> Result<Vec<ChatMessage>, StorageError>;

    /// Sequence number of the latest message. `None` for an empty room.
    fn latest_seq(&self, room: &RoomKey) -> Result<Option<u64>, StorageError>;

    /// Return the room's metadata, recording `metadata` first if the room is
    /// unknown. Existing metadata is never overwritten.
    fn find_or_create_room(
        &self,
        room: &RoomKey,
        metadata: &StoredRoomMetadata,
    ) -> Result<StoredRoomMetadata, StorageError>;

    /// Room metadata. `None` if the room was never recorded.
    fn room_metadata(&self, room: &RoomKey) -> Result<Option<StoredRoomMetadata>, StorageError>;

    /// All recorded rooms. Order is not guaranteed.
    fn list_rooms(&self) -> Result<Vec<RoomKey>, StorageError>;
}
