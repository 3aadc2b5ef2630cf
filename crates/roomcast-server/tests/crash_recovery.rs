//! Crash recovery tests for `RedbStorage`.
//!
//! These tests verify that history and room records persist across database
//! close/reopen cycles, simulating server restarts.

mod common;

use common::{Client, driver_with_storage};
use roomcast_core::{Identity, RoomKey, RoomKind};
use roomcast_proto::ServerMessage;
use roomcast_server::storage::{RedbStorage, Storage, StoredRoomMetadata};
use tempfile::tempdir;

fn general() -> RoomKey {
    RoomKey::parse("general").unwrap()
}

#[test]
fn messages_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("history.redb");
    let alice = Identity::new("alice", "Alice");

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        for i in 0..10 {
            storage.append_message(&general(), &alice, &format!("m{i}")).unwrap();
        }
        // Database dropped
    }

    let storage = RedbStorage::open(&db_path).unwrap();
    assert_eq!(storage.latest_seq(&general()).unwrap(), Some(9));

    let messages = storage.recent_messages(&general(), 100).unwrap();
    let bodies: Vec<_> = messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, ["m0", "m1", "m2", "m3", "m4", "m5", "m6", "m7", "m8", "m9"]);
    assert!(messages.iter().all(|m| m.sender == "alice" && m.sender_name == "Alice"));
}

#[test]
fn sequence_continues_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("history.redb");
    let alice = Identity::new("alice", "Alice");

    let last_time = {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.append_message(&general(), &alice, "before").unwrap().time
    };

    let storage = RedbStorage::open(&db_path).unwrap();
    let after = storage.append_message(&general(), &alice, "after").unwrap();

    assert_eq!(after.seq, 1);
    assert!(after.time >= last_time);
}

#[test]
fn room_records_survive_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("history.redb");
    let dm = RoomKey::private("alice", "bob").unwrap();
    let metadata = StoredRoomMetadata {
        kind: RoomKind::Private,
        created_by: "bob".into(),
        created_at_ms: 1_700_000_000_000,
    };

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        storage.find_or_create_room(&dm, &metadata).unwrap();
        storage.append_message(&general(), &Identity::new("carol", "Carol"), "hello").unwrap();
    }

    let storage = RedbStorage::open(&db_path).unwrap();
    let mut rooms = storage.list_rooms().unwrap();
    rooms.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(rooms, vec![dm.clone(), general()]);
    assert_eq!(storage.room_metadata(&dm).unwrap(), Some(metadata));
}

#[test]
fn rooms_stay_isolated_across_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("history.redb");
    let alice = Identity::new("alice", "Alice");
    let random = RoomKey::parse("random").unwrap();
    // Shares a prefix with "random"; keys must not bleed into each other.
    let randomness = RoomKey::parse("randomness").unwrap();

    {
        let storage = RedbStorage::open(&db_path).unwrap();
        for i in 0..5 {
            storage.append_message(&random, &alice, &format!("r{i}")).unwrap();
            storage.append_message(&randomness, &alice, &format!("x{i}")).unwrap();
        }
    }

    let storage = RedbStorage::open(&db_path).unwrap();
    assert_eq!(storage.latest_seq(&random).unwrap(), Some(4));
    assert_eq!(storage.latest_seq(&randomness).unwrap(), Some(4));
    assert!(storage.recent_messages(&random, 50).unwrap().iter().all(|m| m.body.starts_with('r')));
    assert!(storage.recent_messages(&randomness, 50).unwrap().iter().all(|m| m.body.starts_with('x')));
}

#[test]
fn history_is_replayed_after_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("history.redb");

    {
        let driver = driver_with_storage(RedbStorage::open(&db_path).unwrap());
        let mut alice = Client::connect(&driver, "alice");
        alice.join(&driver, "general");
        alice.say(&driver, "general", "before the crash");
    }

    let driver = driver_with_storage(RedbStorage::open(&db_path).unwrap());
    let mut bob = Client::connect(&driver, "bob");
    bob.join(&driver, "general");

    let batch = bob
        .drain()
        .into_iter()
        .find_map(|e| match e {
            ServerMessage::HistoryBatch { messages, .. } => Some(messages),
            _ => None,
        })
        .unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].body, "before the crash");
    assert_eq!(batch[0].sender, "alice");
}
