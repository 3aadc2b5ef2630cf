//! Redb-backed durable storage implementation.
//!
//! Uses Redb's ACID transactions with Copy-on-Write for crash safety.
//! Message logs and room records survive server restarts.

use std::{path::Path, sync::Arc};

use redb::{Database, ReadableTable, TableDefinition};
use roomcast_core::{Identity, RoomKey};
use roomcast_proto::ChatMessage;
use serde::{Serialize, de::DeserializeOwned};

use super::{Clock, Storage, StorageError, StoredRoomMetadata, system_clock_ms};

/// Table: messages
/// Key: room key bytes, 0x00, seq as big-endian u64
/// Value: CBOR-encoded ChatMessage
const MESSAGES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("messages");

/// Table: rooms
/// Key: room key bytes
/// Value: CBOR-encoded StoredRoomMetadata
const ROOMS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rooms");

/// Durable storage backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbStorage {
    db: Arc<Database>,
    clock: Clock,
}

impl RedbStorage {
    /// Open or create a Redb database at the given path.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Self::open_with_clock(path, system_clock_ms)
    }

    /// Open with an explicit timestamp source.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Io` if the database cannot be opened or created.
    pub fn open_with_clock(path: impl AsRef<Path>, clock: Clock) -> Result<Self, StorageError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(MESSAGES).map_err(io)?;
            let _ = txn.open_table(ROOMS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db), clock })
    }

    /// Latest stored message of a room, if any.
    fn last_message<T: ReadableTable<&'static [u8], &'static [u8]>>(
        table: &T,
        room: &RoomKey,
    ) -> Result<Option<ChatMessage>, StorageError> {
        let start = encode_message_key(room, 0);
        let end = encode_message_key(room, u64::MAX);

        let mut range = table.range(start.as_slice()..=end.as_slice()).map_err(io)?;
        match range.next_back() {
            Some(entry) => {
                let (_, value) = entry.map_err(io)?;
                Ok(Some(decode_cbor(value.value())?))
            },
            None => Ok(None),
        }
    }
}

impl Storage for RedbStorage {
    fn append_message(
        &self,
        room: &RoomKey,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StorageError> {
        let now = (self.clock)();
        let txn = self.db.begin_write().map_err(io)?;

        let message = {
            let mut messages = txn.open_table(MESSAGES).map_err(io)?;

            let (seq, time) = match Self::last_message(&messages, room)? {
                Some(last) => (last.seq + 1, last.time.max(now)),
                None => (0, now),
            };

            let message = ChatMessage {
                room: room.to_string(),
                seq,
                sender: sender.user_id.clone(),
                sender_name: sender.display_name.clone(),
                body: body.to_string(),
                time,
            };

            let key = encode_message_key(room, seq);
            let value = encode_cbor(&message)?;
            messages.insert(key.as_slice(), value.as_slice()).map_err(io)?;
            message
        };

        {
            let mut rooms = txn.open_table(ROOMS).map_err(io)?;
            let key = room.as_str().as_bytes();

            if rooms.get(key).map_err(io)?.is_none() {
                let metadata = StoredRoomMetadata {
                    kind: room.kind(),
                    created_by: sender.user_id.clone(),
                    created_at_ms: message.time,
                };
                let value = encode_cbor(&metadata)?;
                rooms.insert(key, value.as_slice()).map_err(io)?;
            }
        }

        txn.commit().map_err(io)?;

        Ok(message)
    }

    fn recent_messages(
        &self,
        room: &RoomKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        let start = encode_message_key(room, 0);
        let end = encode_message_key(room, u64::MAX);

        let mut messages = Vec::with_capacity(limit.min(64));
        for entry in table.range(start.as_slice()..=end.as_slice()).map_err(io)?.rev().take(limit) {
            let (_, value) = entry.map_err(io)?;
            messages.push(decode_cbor(value.value())?);
        }

        messages.reverse();
        Ok(messages)
    }

    fn latest_seq(&self, room: &RoomKey) -> Result<Option<u64>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(MESSAGES).map_err(io)?;

        Ok(Self::last_message(&table, room)?.map(|m| m.seq))
    }

    fn find_or_create_room(
        &self,
        room: &RoomKey,
        metadata: &StoredRoomMetadata,
    ) -> Result<StoredRoomMetadata, StorageError> {
        let txn = self.db.begin_write().map_err(io)?;

        let stored = {
            let mut table = txn.open_table(ROOMS).map_err(io)?;
            let key = room.as_str().as_bytes();

            let existing = match table.get(key).map_err(io)? {
                Some(value) => Some(decode_cbor::<StoredRoomMetadata>(value.value())?),
                None => None,
            };

            match existing {
                Some(existing) => existing,
                None => {
                    let value = encode_cbor(metadata)?;
                    table.insert(key, value.as_slice()).map_err(io)?;
                    metadata.clone()
                },
            }
        };

        txn.commit().map_err(io)?;

        Ok(stored)
    }

    fn room_metadata(&self, room: &RoomKey) -> Result<Option<StoredRoomMetadata>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(ROOMS).map_err(io)?;

        match table.get(room.as_str().as_bytes()).map_err(io)? {
            Some(value) => Ok(Some(decode_cbor(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_rooms(&self) -> Result<Vec<RoomKey>, StorageError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(ROOMS).map_err(io)?;

        let mut rooms = Vec::new();
        for entry in table.iter().map_err(io)? {
            let (key, _) = entry.map_err(io)?;
            let name = std::str::from_utf8(key.value())
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            let room =
                RoomKey::parse(name).map_err(|e| StorageError::Serialization(e.to_string()))?;
            rooms.push(room);
        }

        Ok(rooms)
    }
}

fn io(e: impl std::fmt::Display) -> StorageError {
    StorageError::Io(e.to_string())
}

fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(bytes)
}

fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    ciborium::from_reader(bytes).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Encode (room, seq) as a message key.
///
/// Layout: [room key bytes][0x00][seq: 8 bytes BE]
/// Room keys never contain control characters, so the separator keeps one
/// room's range disjoint from every other room's, and big-endian seq makes
/// lexicographic order match numeric order.
fn encode_message_key(room: &RoomKey, seq: u64) -> Vec<u8> {
    let name = room.as_str().as_bytes();
    let mut key = Vec::with_capacity(name.len() + 9);
    key.extend_from_slice(name);
    key.push(0);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use roomcast_core::RoomKind;
    use tempfile::tempdir;

    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn room(name: &str) -> RoomKey {
        RoomKey::parse(name).unwrap()
    }

    #[test]
    fn test_message_key_ordering() {
        let general = room("general");
        let low = encode_message_key(&general, 1);
        let high = encode_message_key(&general, 256);
        assert!(low < high);

        // "ab" must not fall inside the range of "a"
        let a_end = encode_message_key(&room("a"), u64::MAX);
        let ab_start = encode_message_key(&room("ab"), 0);
        assert!(ab_start > a_end);
    }

    #[test]
    fn test_append_sequential() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let general = room("general");

        for i in 0..3 {
            let msg = storage.append_message(&general, &alice(), "hello").unwrap();
            assert_eq!(msg.seq, i);
        }

        assert_eq!(storage.latest_seq(&general).unwrap(), Some(2));
    }

    #[test]
    fn test_latest_seq_empty_room() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert_eq!(storage.latest_seq(&room("nobody-here")).unwrap(), None);
    }

    #[test]
    fn test_rooms_do_not_bleed() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        storage.append_message(&room("a"), &alice(), "in a").unwrap();
        storage.append_message(&room("ab"), &alice(), "in ab").unwrap();
        storage.append_message(&room("ab"), &alice(), "in ab again").unwrap();

        let a = storage.recent_messages(&room("a"), 50).unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].body, "in a");
        assert_eq!(storage.latest_seq(&room("a")).unwrap(), Some(0));
        assert_eq!(storage.latest_seq(&room("ab")).unwrap(), Some(1));
    }

    #[test]
    fn test_recent_messages_window() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let general = room("general");

        for i in 0..60 {
            storage.append_message(&general, &alice(), &format!("m{i}")).unwrap();
        }

        let recent = storage.recent_messages(&general, 50).unwrap();
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0].body, "m10");
        assert_eq!(recent[49].body, "m59");
        assert!(recent.windows(2).all(|w| w[0].seq + 1 == w[1].seq));
    }

    #[test]
    fn test_append_records_room() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let dm = RoomKey::private("bob", "alice").unwrap();

        storage.append_message(&dm, &alice(), "hi").unwrap();

        let metadata = storage.room_metadata(&dm).unwrap().unwrap();
        assert_eq!(metadata.kind, RoomKind::Private);
        assert_eq!(metadata.created_by, "alice");
        assert_eq!(storage.list_rooms().unwrap(), vec![dm]);
    }

    #[test]
    fn test_find_or_create_room_idempotent() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();
        let general = room("general");

        let first =
            StoredRoomMetadata { kind: RoomKind::Group, created_by: "alice".into(), created_at_ms: 100 };
        let second =
            StoredRoomMetadata { kind: RoomKind::Group, created_by: "bob".into(), created_at_ms: 200 };

        assert_eq!(storage.find_or_create_room(&general, &first).unwrap(), first);
        assert_eq!(storage.find_or_create_room(&general, &second).unwrap(), first);
        assert_eq!(storage.room_metadata(&general).unwrap(), Some(first));
    }

    #[test]
    fn test_room_metadata_not_found() {
        let dir = tempdir().unwrap();
        let storage = RedbStorage::open(dir.path().join("test.redb")).unwrap();

        assert!(storage.room_metadata(&room("missing")).unwrap().is_none());
        assert!(storage.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_preserves_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.redb");
        let general = room("general");

        {
            let storage = RedbStorage::open(&path).unwrap();
            storage.append_message(&general, &alice(), "before restart").unwrap();
        }

        let storage = RedbStorage::open(&path).unwrap();
        let next = storage.append_message(&general, &alice(), "after restart").unwrap();
        assert_eq!(next.seq, 1);

        let bodies: Vec<_> = storage
            .recent_messages(&general, 50)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, ["before restart", "after restart"]);
    }
}
