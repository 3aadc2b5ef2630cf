//! In-memory storage.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use roomcast_core::{Identity, RoomKey};
use roomcast_proto::ChatMessage;

use super::{Clock, Storage, StorageError, StoredRoomMetadata, system_clock_ms};

/// In-memory storage for tests and single-process deployments.
///
/// Messages are kept per room in sequence order, so `recent_messages` is a
/// slice of the tail. All state sits behind one mutex shared by clones.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryStorageInner>>,
    clock: Clock,
}

#[derive(Default)]
struct MemoryStorageInner {
    rooms: HashMap<RoomKey, StoredRoomMetadata>,
    messages: HashMap<RoomKey, Vec<ChatMessage>>,
}

impl MemoryStorage {
    /// Empty storage stamped by the system clock.
    pub fn new() -> Self {
        Self::with_clock(system_clock_ms)
    }

    /// Empty storage stamped by `clock`.
    pub fn with_clock(clock: Clock) -> Self {
        Self { inner: Arc::new(Mutex::new(MemoryStorageInner::default())), clock }
    }

    /// Number of rooms with at least one message.
    pub fn room_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Total number of messages across all rooms.
    pub fn message_count(&self) -> usize {
        self.lock().messages.values().map(Vec::len).sum()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStorageInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn append_message(
        &self,
        room: &RoomKey,
        sender: &Identity,
        body: &str,
    ) -> Result<ChatMessage, StorageError> {
        let now = (self.clock)();
        let mut inner = self.lock();

        let log = inner.messages.entry(room.clone()).or_default();
        let (seq, time) = match log.last() {
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
        log.push(message.clone());

        inner.rooms.entry(room.clone()).or_insert_with(|| StoredRoomMetadata {
            kind: room.kind(),
            created_by: sender.user_id.clone(),
            created_at_ms: time,
        });

        Ok(message)
    }

    fn recent_messages(
        &self,
        room: &RoomKey,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, StorageError> {
        let inner = self.lock();
        let Some(log) = inner.messages.get(room) else {
            return Ok(Vec::new());
        };

        let start = log.len().saturating_sub(limit);
        Ok(log[start..].to_vec())
    }

    fn latest_seq(&self, room: &RoomKey) -> Result<Option<u64>, StorageError> {
        Ok(self.lock().messages.get(room).and_then(|log| log.last()).map(|m| m.seq))
    }

    fn find_or_create_room(
        &self,
        room: &RoomKey,
        metadata: &StoredRoomMetadata,
    ) -> Result<StoredRoomMetadata, StorageError> {
        Ok(self.lock().rooms.entry(room.clone()).or_insert_with(|| metadata.clone()).clone())
    }

    fn room_metadata(&self, room: &RoomKey) -> Result<Option<StoredRoomMetadata>, StorageError> {
        Ok(self.lock().rooms.get(room).cloned())
    }

    fn list_rooms(&self) -> Result<Vec<RoomKey>, StorageError> {
        Ok(self.lock().rooms.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use roomcast_core::RoomKind;

    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn room(name: &str) -> RoomKey {
        RoomKey::parse(name).unwrap()
    }

    #[test]
    fn append_assigns_dense_sequence() {
        let storage = MemoryStorage::new();
        let general = room("general");

        for i in 0..5 {
            let msg = storage.append_message(&general, &alice(), &format!("m{i}")).unwrap();
            assert_eq!(msg.seq, i);
        }

        assert_eq!(storage.latest_seq(&general).unwrap(), Some(4));
        assert_eq!(storage.latest_seq(&room("other")).unwrap(), None);
    }

    #[test]
    fn rooms_have_independent_logs() {
        let storage = MemoryStorage::new();
        storage.append_message(&room("a"), &alice(), "1").unwrap();
        storage.append_message(&room("a"), &alice(), "2").unwrap();
        let msg = storage.append_message(&room("b"), &alice(), "3").unwrap();

        assert_eq!(msg.seq, 0);
        assert_eq!(storage.room_count(), 2);
        assert_eq!(storage.message_count(), 3);
    }

    #[test]
    fn recent_returns_tail_oldest_first() {
        let storage = MemoryStorage::new();
        let general = room("general");
        for i in 0..10 {
            storage.append_message(&general, &alice(), &i.to_string()).unwrap();
        }

        let recent = storage.recent_messages(&general, 3).unwrap();
        let bodies: Vec<_> = recent.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, ["7", "8", "9"]);

        assert_eq!(storage.recent_messages(&general, 50).unwrap().len(), 10);
        assert!(storage.recent_messages(&room("empty"), 50).unwrap().is_empty());
    }

    static BACKWARDS_CLOCK: AtomicU64 = AtomicU64::new(10_000);

    fn backwards_clock() -> u64 {
        BACKWARDS_CLOCK.fetch_sub(1_000, Ordering::SeqCst)
    }

    #[test]
    fn timestamps_never_go_backwards() {
        let storage = MemoryStorage::with_clock(backwards_clock);
        let general = room("general");

        let first = storage.append_message(&general, &alice(), "a").unwrap();
        let second = storage.append_message(&general, &alice(), "b").unwrap();
        let third = storage.append_message(&general, &alice(), "c").unwrap();

        assert!(second.time >= first.time);
        assert!(third.time >= second.time);
    }

    #[test]
    fn first_append_records_room() {
        let storage = MemoryStorage::new();
        let dm = RoomKey::private("alice", "bob").unwrap();
        storage.append_message(&dm, &alice(), "hi").unwrap();

        let metadata = storage.room_metadata(&dm).unwrap().unwrap();
        assert_eq!(metadata.kind, RoomKind::Private);
        assert_eq!(metadata.created_by, "alice");
        assert_eq!(storage.list_rooms().unwrap(), vec![dm]);
    }

    #[test]
    fn find_or_create_keeps_existing_metadata() {
        let storage = MemoryStorage::new();
        let general = room("general");
        let first = StoredRoomMetadata {
            kind: RoomKind::Group,
            created_by: "alice".into(),
            created_at_ms: 1,
        };
        let second = StoredRoomMetadata { created_by: "bob".into(), ..first.clone() };

        assert_eq!(storage.find_or_create_room(&general, &first).unwrap(), first);
        assert_eq!(storage.find_or_create_room(&general, &second).unwrap(), first);
    }
}
