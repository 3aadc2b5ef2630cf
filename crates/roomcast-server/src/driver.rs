//! Server driver.
//!
//! The connection lifecycle controller. Ties together the per-connection
//! state machines, the session registry, the room manager and the relays.
//!
//! Sans-IO: the runtime feeds [`ServerEvent`]s in and executes the returned
//! [`ServerAction`]s. Everything a client should see is pushed onto that
//! client's outbox during processing. The driver takes `&self` so the runtime
//! can process events for different connections concurrently; shared state
//! sits behind fine-grained locks.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use bytes::Bytes;
use roomcast_core::{
    AuthError, Connection, ConnectionAction, ConnectionConfig, ConnectionError, ConnectionState,
    Environment, Identity, IdentityVerifier, RoomKey,
};
use roomcast_proto::{ClientMessage, ErrorCode, ErrorPayload, ServerMessage, SignalKind};
use tracing::{debug, info, warn};

use crate::{
    outbox::{DEFAULT_OUTBOX_CAPACITY, Outbox},
    registry::SessionRegistry,
    relay::{DEFAULT_MAX_BODY_LEN, HISTORY_LIMIT, MESSAGE_ENVELOPE_RESERVE, MessageRelay},
    room_manager::{Member, RoomManager},
    server_error::ServerError,
    signaling::SignalingRelay,
    storage::{Storage, StoredRoomMetadata},
};

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Connection configuration (timeouts, heartbeat interval)
    pub connection: ConnectionConfig,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Messages replayed to a joining connection
    pub history_limit: usize,
    /// Maximum message body, in bytes
    pub max_body_len: usize,
    /// Events a connection may have queued before it is shed
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            max_connections: 10_000,
            history_limit: HISTORY_LIMIT,
            max_body_len: DEFAULT_MAX_BODY_LEN,
            outbox_capacity: DEFAULT_OUTBOX_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Upper bound on the encoded size of one `history-batch` event.
    ///
    /// The runtime refuses configurations where this exceeds the frame
    /// payload limit, since such a batch could never be written.
    pub fn history_batch_bound(&self) -> usize {
        self.history_limit
            .max(1)
            .saturating_mul(self.max_body_len.saturating_add(MESSAGE_ENVELOPE_RESERVE))
            .saturating_add(MESSAGE_ENVELOPE_RESERVE)
    }
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (production or tests).
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID, from [`ServerDriver::allocate_connection_id`]
        session_id: u64,
        /// Queue the runtime drains onto the connection
        outbox: Outbox,
    },

    /// A client event was decoded from a connection
    MessageReceived {
        /// Connection that sent the event
        session_id: u64,
        /// The decoded event
        message: ClientMessage,
    },

    /// A frame arrived intact but its payload is not a known event
    MalformedMessage {
        /// Connection that sent the frame
        session_id: u64,
        /// Decoder error
        reason: String,
    },

    /// A connection was closed (by peer or error)
    ConnectionClosed {
        /// Connection that was closed
        session_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Periodic tick for timeout and heartbeat checking
    Tick,
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Close a connection. Its state has already been cleaned up; the
    /// runtime only needs to tear down the transport.
    CloseConnection {
        /// Session to close
        session_id: u64,
        /// Reason for closure
        reason: String,
    },
}

struct ConnectionSlot<I>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = std::time::Duration>,
{
    connection: Connection<I>,
    outbox: Outbox,
}

type SlotHandle<I> = Arc<Mutex<ConnectionSlot<I>>>;

/// Lifecycle controller for every connection on the server.
pub struct ServerDriver<E, S, V>
where
    E: Environment,
    S: Storage,
    V: IdentityVerifier,
{
    /// Connection state machines (session_id → slot)
    connections: RwLock<HashMap<u64, SlotHandle<E::Instant>>>,
    /// Verified identities, shared with signaling
    registry: Arc<SessionRegistry>,
    /// Live room membership
    rooms: RoomManager,
    /// Persist-then-broadcast and history replay
    relay: MessageRelay<S>,
    /// Point-to-point blobs
    signaling: SignalingRelay,
    /// Credential check
    verifier: V,
    /// Environment (time, RNG)
    env: E,
    /// Server configuration
    config: ServerConfig,
}

impl<E, S, V> ServerDriver<E, S, V>
where
    E: Environment,
    S: Storage,
    V: IdentityVerifier,
{
    /// Create a new server driver.
    pub fn new(env: E, storage: S, verifier: V, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        Self {
            connections: RwLock::new(HashMap::new()),
            signaling: SignalingRelay::new(Arc::clone(&registry)),
            registry,
            rooms: RoomManager::new(),
            relay: MessageRelay::with_limits(storage, config.history_limit, config.max_body_len),
            verifier,
            env,
            config,
        }
    }

    /// Pick an unused, non-zero connection id.
    pub fn allocate_connection_id(&self) -> u64 {
        loop {
            let id = self.env.random_u64();
            if id != 0 && !self.connections_read().contains_key(&id) {
                return id;
            }
        }
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    ///
    /// # Errors
    ///
    /// Only for driver bookkeeping failures (unknown or duplicate session).
    /// Client mistakes are reported to the client, not returned here.
    pub fn process_event(&self, event: ServerEvent) -> Result<Vec<ServerAction>, ServerError> {
        match event {
            ServerEvent::ConnectionAccepted { session_id, outbox } => {
                self.handle_connection_accepted(session_id, outbox)
            },
            ServerEvent::MessageReceived { session_id, message } => {
                self.handle_message_received(session_id, message)
            },
            ServerEvent::MalformedMessage { session_id, reason } => {
                self.handle_malformed_message(session_id, &reason)
            },
            ServerEvent::ConnectionClosed { session_id, reason } => {
                self.disconnect(session_id, &reason);
                Ok(Vec::new())
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    fn handle_connection_accepted(
        &self,
        session_id: u64,
        outbox: Outbox,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let now = self.env.now();
        let mut connections = self.connections_write();

        if connections.contains_key(&session_id) {
            return Err(ServerError::SessionAlreadyExists(session_id));
        }

        if connections.len() >= self.config.max_connections {
            warn!(session_id, max = self.config.max_connections, "connection limit reached");
            return Ok(vec![ServerAction::CloseConnection {
                session_id,
                reason: "max connections exceeded".to_string(),
            }]);
        }

        let connection = Connection::new(session_id, now, self.config.connection.clone());
        connections.insert(session_id, Arc::new(Mutex::new(ConnectionSlot { connection, outbox })));

        debug!(session_id, "connection accepted");
        Ok(Vec::new())
    }

    fn handle_message_received(
        &self,
        session_id: u64,
        message: ClientMessage,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let slot = self.slot(session_id).ok_or(ServerError::SessionNotFound(session_id))?;
        let now = self.env.now();

        let mut guard = lock_slot(&slot);
        guard.connection.update_activity(now);

        match guard.connection.state() {
            ConnectionState::Connecting => {
                let verdict = match &message {
                    ClientMessage::Authenticate { token } => self
                        .verifier
                        .verify(token, self.env.wall_clock_secs())
                        .map_err(|err| ServerMessage::error(ErrorCode::AuthError, err.to_string())),
                    other => Err(ServerMessage::error(
                        ErrorCode::NotAuthenticated,
                        format!("{}: expected authenticate, got {}", AuthError::Missing, other.kind()),
                    )),
                };

                guard.connection.begin_authentication(now)?;

                match verdict {
                    Ok(identity) => {
                        self.registry.register(session_id, identity.clone(), guard.outbox.clone())?;
                        guard.connection.complete_authentication(identity.clone(), now)?;
                        guard.outbox.deliver(ServerMessage::Authenticated {
                            connection_id: session_id,
                            user_id: identity.user_id.clone(),
                            display_name: identity.display_name.clone(),
                        });

                        info!(session_id, user_id = %identity.user_id, "connection authenticated");
                        Ok(Vec::new())
                    },
                    Err(rejection) => {
                        guard.connection.reject();
                        guard.outbox.deliver(rejection);
                        drop(guard);

                        let reason = "authentication failed".to_string();
                        self.disconnect(session_id, &reason);
                        Ok(vec![ServerAction::CloseConnection { session_id, reason }])
                    },
                }
            },

            ConnectionState::Active => {
                let identity = guard.connection.identity().cloned().ok_or(
                    ConnectionError::InvalidState {
                        state: ConnectionState::Active,
                        operation: "dispatch",
                    },
                )?;
                let outbox = guard.outbox.clone();
                drop(guard);

                self.dispatch(session_id, &identity, &outbox, message);
                Ok(Vec::new())
            },

            state @ (ConnectionState::Authenticating | ConnectionState::Disconnected) => {
                debug!(session_id, ?state, kind = message.kind(), "event ignored");
                Ok(Vec::new())
            },
        }
    }

    /// Route an event from an active connection.
    fn dispatch(&self, session_id: u64, identity: &Identity, outbox: &Outbox, message: ClientMessage) {
        match message {
            ClientMessage::Join { room } => match RoomKey::parse(room.as_str()) {
                Ok(key) => self.join_room(session_id, identity, outbox, &key),
                Err(err) => reject_room(outbox, &room, &err),
            },

            ClientMessage::JoinPrivate { peer } => {
                match RoomKey::private(&identity.user_id, &peer) {
                    Ok(key) => self.join_room(session_id, identity, outbox, &key),
                    Err(err) => reject_room(outbox, &peer, &err),
                }
            },

            ClientMessage::Leave { room } => match RoomKey::parse(room.as_str()) {
                Ok(key) => {
                    if self.rooms.leave(session_id, &key) {
                        outbox.deliver(ServerMessage::Left { room: key.to_string() });
                    } else {
                        outbox.deliver(ServerMessage::Error(
                            ErrorPayload::new(ErrorCode::NotAMember, "not a member of this room")
                                .with_room(key.as_str()),
                        ));
                    }
                },
                Err(err) => reject_room(outbox, &room, &err),
            },

            ClientMessage::Send { room, body } => match RoomKey::parse(room.as_str()) {
                Ok(key) => {
                    if let Err(err) = self.relay.send(&self.rooms, session_id, &key, identity, &body)
                    {
                        debug!(session_id, room = %key, error = %err, "send rejected");
                        outbox.deliver(ServerMessage::Error(err.to_payload(Some(&key))));
                    }
                },
                Err(err) => reject_room(outbox, &room, &err),
            },

            ClientMessage::SignalOffer { to, payload } => {
                self.signal(session_id, outbox, to, SignalKind::Offer, payload);
            },
            ClientMessage::SignalAnswer { to, payload } => {
                self.signal(session_id, outbox, to, SignalKind::Answer, payload);
            },
            ClientMessage::SignalIce { to, payload } => {
                self.signal(session_id, outbox, to, SignalKind::Ice, payload);
            },

            ClientMessage::Ping => {
                outbox.deliver(ServerMessage::Pong);
            },
            ClientMessage::Pong => {},

            ClientMessage::Authenticate { .. } => {
                outbox.deliver(ServerMessage::error(
                    ErrorCode::Protocol,
                    "connection is already authenticated",
                ));
            },
        }
    }

    fn join_room(&self, session_id: u64, identity: &Identity, outbox: &Outbox, key: &RoomKey) {
        let metadata = StoredRoomMetadata {
            kind: key.kind(),
            created_by: identity.user_id.clone(),
            created_at_ms: self.env.wall_clock_secs().saturating_mul(1000),
        };
        if let Err(err) = self.relay.storage().find_or_create_room(key, &metadata) {
            warn!(session_id, room = %key, error = %err, "room record not stored");
        }

        let member =
            Member { connection_id: session_id, identity: identity.clone(), outbox: outbox.clone() };
        let result = self.rooms.join(member, key, &self.relay);

        // A disconnect may have swept this connection's rooms while the join
        // was in flight.
        if result.newly_joined && self.slot(session_id).is_none() {
            self.rooms.leave(session_id, key);
        }
    }

    fn signal(&self, from: u64, outbox: &Outbox, to: u64, kind: SignalKind, payload: Bytes) {
        if let Err(err) = self.signaling.relay(from, to, kind, payload) {
            debug!(session_id = from, to, error = %err, "signal rejected");
            outbox.deliver(ServerMessage::error(ErrorCode::Protocol, err.to_string()));
        }
    }

    fn handle_malformed_message(
        &self,
        session_id: u64,
        reason: &str,
    ) -> Result<Vec<ServerAction>, ServerError> {
        let slot = self.slot(session_id).ok_or(ServerError::SessionNotFound(session_id))?;
        let guard = lock_slot(&slot);

        debug!(session_id, reason, "malformed event");
        guard.outbox.deliver(ServerMessage::error(ErrorCode::Protocol, reason));
        Ok(Vec::new())
    }

    /// Tear down everything a connection holds.
    ///
    /// Removes it from every room (members get `presence-left`), drops its
    /// identity binding and forgets the state machine. Safe to call more than
    /// once; returns `false` if the connection was already gone.
    pub fn disconnect(&self, session_id: u64, reason: &str) -> bool {
        let Some(slot) = self.connections_write().remove(&session_id) else {
            return false;
        };

        let was_active = lock_slot(&slot).connection.close();
        let rooms = self.rooms.leave_all(session_id);
        let identity = self.registry.unregister(session_id);

        info!(
            session_id,
            reason,
            was_active,
            user_id = identity.as_ref().map_or("-", |i| i.user_id.as_str()),
            rooms = rooms.len(),
            "connection closed"
        );
        true
    }

    fn handle_tick(&self) -> Vec<ServerAction> {
        let now = self.env.now();
        let mut actions = Vec::new();

        let slots: Vec<(u64, SlotHandle<E::Instant>)> = self
            .connections_read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        for (session_id, slot) in slots {
            let (conn_actions, outbox) = {
                let mut guard = lock_slot(&slot);
                if guard.outbox.is_overflowed() {
                    drop(guard);
                    let reason = "outbound queue full".to_string();
                    warn!(session_id, "reader fell behind, shedding connection");
                    self.disconnect(session_id, &reason);
                    actions.push(ServerAction::CloseConnection { session_id, reason });
                    continue;
                }
                (guard.connection.tick(now), guard.outbox.clone())
            };

            for action in conn_actions {
                match action {
                    ConnectionAction::SendPing => {
                        outbox.deliver(ServerMessage::Ping);
                    },
                    ConnectionAction::Close { reason } => {
                        self.disconnect(session_id, &reason);
                        actions.push(ServerAction::CloseConnection { session_id, reason });
                    },
                }
            }
        }

        actions
    }

    /// Number of open connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.connections_read().len()
    }

    /// Lifecycle state of a connection. `None` once it is gone.
    pub fn connection_state(&self, session_id: u64) -> Option<ConnectionState> {
        self.slot(session_id).map(|slot| lock_slot(&slot).connection.state())
    }

    /// Session registry.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Room manager.
    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    /// Storage backend.
    pub fn storage(&self) -> &S {
        self.relay.storage()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Environment.
    pub fn env(&self) -> &E {
        &self.env
    }

    fn slot(&self, session_id: u64) -> Option<SlotHandle<E::Instant>> {
        self.connections_read().get(&session_id).cloned()
    }

    fn connections_read(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<u64, SlotHandle<E::Instant>>> {
        self.connections.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn connections_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, SlotHandle<E::Instant>>> {
        self.connections.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E, S, V> fmt::Debug for ServerDriver<E, S, V>
where
    E: Environment,
    S: Storage,
    V: IdentityVerifier,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connection_count", &self.connection_count())
            .field("session_count", &self.registry.session_count())
            .field("room_count", &self.rooms.room_count())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn lock_slot<I>(slot: &Mutex<ConnectionSlot<I>>) -> MutexGuard<'_, ConnectionSlot<I>>
where
    I: Copy + Ord + Send + Sync + std::ops::Sub<Output = std::time::Duration>,
{
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn reject_room(outbox: &Outbox, room: &str, err: &roomcast_core::RoomKeyError) {
    outbox.deliver(ServerMessage::Error(
        ErrorPayload::new(ErrorCode::InvalidRoom, err.to_string()).with_room(room),
    ));
}
