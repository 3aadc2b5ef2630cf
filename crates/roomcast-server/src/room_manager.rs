//! Room Manager
//!
//! Tracks which connections are joined to which room and directs fan-out.
//! Membership is live state only: a room exists in the index while it has at
//! least one member and is retired the moment the last member leaves. History
//! is owned by storage and outlives membership.
//!
//! Each room has its own lock. The index lock is held only long enough to
//! find or insert a room's entry, so joins and sends in different rooms never
//! contend. Lock order is index → room → memberships; the room lock is never
//! held while acquiring the index lock.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use roomcast_core::{Identity, RoomKey};
use roomcast_proto::{PresenceEvent, ServerMessage};
use tracing::{debug, warn};

use crate::{outbox::Outbox, relay::RelayError};

/// A connection joined to a room.
#[derive(Debug, Clone)]
pub struct Member {
    /// Connection id
    pub connection_id: u64,
    /// Identity bound to the connection
    pub identity: Identity,
    /// Where events for this connection go
    pub outbox: Outbox,
}

impl Member {
    fn presence(&self, room: &RoomKey) -> PresenceEvent {
        PresenceEvent {
            room: room.to_string(),
            connection_id: self.connection_id,
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
        }
    }
}

/// Live membership of one room.
#[derive(Debug)]
pub struct Room {
    key: RoomKey,
    members: BTreeMap<u64, Member>,
    /// Set when the room is removed from the index. A joiner holding a stale
    /// handle must retry against a fresh entry.
    retired: bool,
}

impl Room {
    fn new(key: RoomKey) -> Self {
        Self { key, members: BTreeMap::new(), retired: false }
    }

    /// Room key.
    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    /// Whether `connection_id` is a member.
    pub fn contains(&self, connection_id: u64) -> bool {
        self.members.contains_key(&connection_id)
    }

    /// Member connection ids, ascending.
    pub fn member_ids(&self) -> Vec<u64> {
        self.members.keys().copied().collect()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the room has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Deliver `message` to every member except `exclude`.
    ///
    /// Returns the number of outboxes that accepted it. A member whose
    /// connection is already gone is skipped.
    pub fn broadcast(&self, message: &ServerMessage, exclude: Option<u64>) -> usize {
        self.members
            .values()
            .filter(|member| Some(member.connection_id) != exclude)
            .filter(|member| member.outbox.deliver(message.clone()))
            .count()
    }
}

/// Outcome of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinResult {
    /// Members after the join, including the caller
    pub member_count: usize,
    /// False if the caller was already a member
    pub newly_joined: bool,
    /// Messages replayed to the joiner. `None` if no replay ran or it failed.
    pub replayed: Option<usize>,
}

/// Delivers a room's recent history to a joining member.
///
/// Called with the room lock held, so nothing else is broadcast to the room
/// until the replay has been queued.
pub trait HistoryReplay {
    /// Queue the history batch on `member`'s outbox.
    ///
    /// # Errors
    ///
    /// Returns the failure after reporting it to the member.
    fn replay(&self, member: &Member, room: &RoomKey) -> Result<usize, RelayError>;
}

/// Per-room membership with a reverse index for disconnect cleanup.
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomKey, Arc<Mutex<Room>>>>,
    memberships: RwLock<HashMap<u64, BTreeSet<RoomKey>>>,
}

impl RoomManager {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `member` to `room`.
    ///
    /// The joiner receives, in order: `joined`, then its history batch. The
    /// other members receive `presence-joined`. Joining a room the
    /// connection is already in re-sends `joined` and changes nothing else.
    pub fn join<H: HistoryReplay>(&self, member: Member, room: &RoomKey, history: &H) -> JoinResult {
        loop {
            let handle = self.room_entry(room);
            let mut guard = lock_room(&handle);
            if guard.retired {
                continue;
            }

            let connection_id = member.connection_id;

            if guard.contains(connection_id) {
                member.outbox.deliver(ServerMessage::Joined {
                    room: room.to_string(),
                    member_count: guard.len(),
                });
                return JoinResult { member_count: guard.len(), newly_joined: false, replayed: None };
            }

            let member_count = guard.len() + 1;
            member.outbox.deliver(ServerMessage::Joined { room: room.to_string(), member_count });

            let presence = ServerMessage::PresenceJoined(member.presence(room));
            guard.members.insert(connection_id, member.clone());

            let replayed = match history.replay(&member, room) {
                Ok(count) => Some(count),
                Err(err) => {
                    warn!(connection_id, room = %room, error = %err, "history replay failed");
                    None
                },
            };

            let notified = guard.broadcast(&presence, Some(connection_id));
            self.memberships_mut().entry(connection_id).or_default().insert(room.clone());

            debug!(connection_id, room = %room, member_count, notified, "joined room");
            return JoinResult { member_count, newly_joined: true, replayed };
        }
    }

    /// Remove a connection from a room.
    ///
    /// Remaining members receive `presence-left`. Returns `false` (and does
    /// nothing) if the connection was not a member.
    pub fn leave(&self, connection_id: u64, room: &RoomKey) -> bool {
        let Some(handle) = self.room_handle(room) else {
            return false;
        };

        let now_empty = {
            let mut guard = lock_room(&handle);
            let Some(member) = guard.members.remove(&connection_id) else {
                return false;
            };

            let notified =
                guard.broadcast(&ServerMessage::PresenceLeft(member.presence(room)), None);

            let mut memberships = self.memberships_mut();
            if let Some(rooms) = memberships.get_mut(&connection_id) {
                rooms.remove(room);
                if rooms.is_empty() {
                    memberships.remove(&connection_id);
                }
            }

            debug!(connection_id, room = %room, remaining = guard.len(), notified, "left room");
            guard.is_empty()
        };

        if now_empty {
            self.retire_if_empty(room);
        }
        true
    }

    /// Remove a connection from every room it joined. Returns those rooms.
    pub fn leave_all(&self, connection_id: u64) -> Vec<RoomKey> {
        let rooms = self.rooms_of(connection_id);
        rooms.into_iter().filter(|room| self.leave(connection_id, room)).collect()
    }

    /// Connection ids currently joined to `room`, ascending.
    pub fn members_of(&self, room: &RoomKey) -> Vec<u64> {
        self.with_room(room, Room::member_ids).unwrap_or_default()
    }

    /// Rooms `connection_id` is currently joined to, sorted.
    pub fn rooms_of(&self, connection_id: u64) -> Vec<RoomKey> {
        self.memberships
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&connection_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run `f` with the room locked. `None` if the room has no members.
    ///
    /// Nothing can join, leave or broadcast to the room while `f` runs.
    pub fn with_room<R>(&self, room: &RoomKey, f: impl FnOnce(&Room) -> R) -> Option<R> {
        let handle = self.room_handle(room)?;
        let guard = lock_room(&handle);
        if guard.retired {
            return None;
        }
        Some(f(&guard))
    }

    /// Number of rooms with at least one member.
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn room_handle(&self, room: &RoomKey) -> Option<Arc<Mutex<Room>>> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner).get(room).cloned()
    }

    fn room_entry(&self, room: &RoomKey) -> Arc<Mutex<Room>> {
        if let Some(handle) = self.room_handle(room) {
            return handle;
        }

        self.rooms
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(room.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Room::new(room.clone()))))
            .clone()
    }

    fn retire_if_empty(&self, room: &RoomKey) {
        let mut rooms = self.rooms.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handle) = rooms.get(room).cloned() else {
            return;
        };

        let mut guard = lock_room(&handle);
        if guard.is_empty() {
            guard.retired = true;
            rooms.remove(room);
        }
    }

    fn memberships_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, BTreeSet<RoomKey>>> {
        self.memberships.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_room(handle: &Arc<Mutex<Room>>) -> MutexGuard<'_, Room> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}
