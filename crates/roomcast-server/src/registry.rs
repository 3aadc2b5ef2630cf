//! Session registry: connection id → verified identity.
//!
//! A connection is bound to an identity exactly once, when authentication
//! succeeds. The binding never changes afterwards; re-authenticating on the
//! same connection is rejected with [`RegistryError::AlreadyBound`]. The
//! registry also holds each session's outbox so signaling can reach a
//! connection by id without going through a room.
//!
//! Multiple connections may carry the same user id. They are independent
//! sessions.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use roomcast_core::Identity;

use crate::outbox::Outbox;

/// Errors from registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// The connection already has an identity.
    #[error("connection {0} is already bound to an identity")]
    AlreadyBound(u64),
}

#[derive(Debug)]
struct SessionEntry {
    identity: Identity,
    outbox: Outbox,
}

/// Registry of authenticated sessions.
///
/// Shared between the driver and the signaling relay. Readers never block
/// each other.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, SessionEntry>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `identity` to `connection_id`.
    ///
    /// # Errors
    ///
    /// [`RegistryError::AlreadyBound`] if the connection is already bound. The
    /// existing binding is left untouched.
    pub fn register(
        &self,
        connection_id: u64,
        identity: Identity,
        outbox: Outbox,
    ) -> Result<(), RegistryError> {
        let mut sessions = self.write();
        if sessions.contains_key(&connection_id) {
            return Err(RegistryError::AlreadyBound(connection_id));
        }

        sessions.insert(connection_id, SessionEntry { identity, outbox });
        Ok(())
    }

    /// Identity bound to a connection. `None` if unauthenticated or gone.
    pub fn lookup(&self, connection_id: u64) -> Option<Identity> {
        self.read().get(&connection_id).map(|entry| entry.identity.clone())
    }

    /// Outbox of a bound connection.
    pub fn outbox(&self, connection_id: u64) -> Option<Outbox> {
        self.read().get(&connection_id).map(|entry| entry.outbox.clone())
    }

    /// Display name of a bound connection.
    pub fn presence(&self, connection_id: u64) -> Option<String> {
        self.read().get(&connection_id).map(|entry| entry.identity.display_name.clone())
    }

    /// Remove a binding. Returns the identity if one was bound; a second call
    /// is a no-op.
    pub fn unregister(&self, connection_id: u64) -> Option<Identity> {
        self.write().remove(&connection_id).map(|entry| entry.identity)
    }

    /// Number of bound connections.
    pub fn session_count(&self) -> usize {
        self.read().len()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<u64, SessionEntry>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<u64, SessionEntry>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}
