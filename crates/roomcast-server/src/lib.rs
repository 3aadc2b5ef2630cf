//! Roomcast relay server.
//!
//! Room-scoped text messaging and point-to-point call signaling over QUIC.
//! Clients authenticate with a signed token, join rooms, receive a bounded
//! backlog on join, and see every message in the order storage assigned it.
//!
//! # Architecture
//!
//! [`ServerDriver`] is the Sans-IO core: it consumes [`ServerEvent`]s, pushes
//! client-visible events onto per-connection [`Outbox`]es and returns
//! [`ServerAction`]s. [`Server`] is the production glue that feeds it from
//! Quinn connections and drains each outbox onto the wire.
//!
//! # Components
//!
//! - [`ServerDriver`]: connection lifecycle controller (pure logic, no I/O)
//! - [`SessionRegistry`]: connection id → verified identity
//! - [`RoomManager`]: per-room membership, one lock per room
//! - [`MessageRelay`]: persist-then-broadcast, history replay
//! - [`SignalingRelay`]: blobs forwarded between connections by id
//! - [`storage`]: the persistence gateway (memory, redb, chaos wrapper)
//! - [`Server`]: production runtime over [`QuinnTransport`] and [`SystemEnv`]

#![forbid(unsafe_code)]

mod driver;
mod error;
mod outbox;
mod registry;
mod relay;
mod room_manager;
mod server_error;
mod signaling;
pub mod storage;
mod system_env;
mod transport;

use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::BytesMut;
pub use driver::{ServerAction, ServerConfig as DriverConfig, ServerDriver, ServerEvent};
pub use error::ServerError;
pub use outbox::{DEFAULT_OUTBOX_CAPACITY, Outbox, OutboxReceiver};
pub use registry::{RegistryError, SessionRegistry};
pub use relay::{
    DEFAULT_MAX_BODY_LEN, HISTORY_LIMIT, MESSAGE_ENVELOPE_RESERVE, MessageRelay, RelayError,
};
use roomcast_core::HmacTokenVerifier;
use roomcast_proto::{ClientMessage, Frame, FrameHeader, ServerMessage};
pub use room_manager::{HistoryReplay, JoinResult, Member, Room, RoomManager};
pub use server_error::ServerError as DriverError;
pub use signaling::{MAX_SIGNAL_PAYLOAD, SignalError, SignalingRelay};
pub use storage::{ChaoticStorage, MemoryStorage, RedbStorage, Storage, StorageError};
pub use system_env::SystemEnv;
use tokio::sync::RwLock;
pub use transport::{PendingConnection, QuinnConnection, QuinnTransport};

/// How long a connection told to close may keep flushing its outbox.
const CLOSE_GRACE: Duration = Duration::from_millis(250);

/// Upper bound on waiting for a writer to drain after its reader ended.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Transport handles for connections the driver may ask to close.
struct SharedState {
    /// Map of session ID to QUIC connection
    connections: RwLock<HashMap<u64, QuinnConnection>>,
}

/// Driver as run by [`Server`]: system clock, HMAC tokens.
pub type ProductionDriver<S> = ServerDriver<SystemEnv, S, HmacTokenVerifier>;

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:4433")
    pub bind_address: String,
    /// Path to TLS certificate (PEM format)
    pub cert_path: Option<String>,
    /// Path to TLS private key (PEM format)
    pub key_path: Option<String>,
    /// Shared secret for verifying HMAC credential tokens
    pub token_secret: String,
    /// How often timeouts and heartbeats are checked
    pub tick_interval: Duration,
    /// Driver configuration (timeouts, limits)
    pub driver: DriverConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:4433".to_string(),
            cert_path: None,
            key_path: None,
            token_secret: String::new(),
            tick_interval: Duration::from_secs(1),
            driver: DriverConfig::default(),
        }
    }
}

/// Production Roomcast server.
///
/// Wraps `ServerDriver` with Quinn QUIC transport and system environment.
pub struct Server<S: Storage> {
    /// The Sans-IO driver, shared by every connection task
    driver: Arc<ProductionDriver<S>>,
    /// QUIC endpoint
    transport: QuinnTransport,
    /// Tick period
    tick_interval: Duration,
}

impl<S: Storage> Server<S> {
    /// Create and bind a new server on top of `storage`.
    ///
    /// # Errors
    ///
    /// `Config` if the token secret is empty, history batches could outgrow a
    /// frame or TLS material is unusable,
    /// `Transport` if the address cannot be bound, `Storage` if the room
    /// index cannot be read.
    pub fn bind(config: ServerRuntimeConfig, storage: S) -> Result<Self, ServerError> {
        if config.token_secret.is_empty() {
            return Err(ServerError::Config("token secret must not be empty".to_string()));
        }

        let batch_bound = config.driver.history_batch_bound();
        if batch_bound > FrameHeader::MAX_PAYLOAD_SIZE as usize {
            return Err(ServerError::Config(format!(
                "history limit {} with body limit {} allows {batch_bound}-byte history batches, frame limit is {}",
                config.driver.history_limit,
                config.driver.max_body_len,
                FrameHeader::MAX_PAYLOAD_SIZE,
            )));
        }

        let known_rooms = storage.list_rooms()?.len();

        let env = SystemEnv::new();
        let verifier = HmacTokenVerifier::new(config.token_secret.as_bytes());
        let driver = ServerDriver::new(env, storage, verifier, config.driver);

        let transport = QuinnTransport::bind(
            &config.bind_address,
            config.cert_path.as_deref(),
            config.key_path.as_deref(),
        )?;

        tracing::info!(known_rooms, "storage ready");

        Ok(Self { driver: Arc::new(driver), transport, tick_interval: config.tick_interval })
    }

    /// Run the server, accepting connections until the endpoint closes.
    ///
    /// # Errors
    ///
    /// `Transport` if the local address cannot be read at startup.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!(addr = %self.transport.local_addr()?, "server starting");

        let shared = Arc::new(SharedState { connections: RwLock::new(HashMap::new()) });

        let ticker = tokio::spawn(run_ticker(
            Arc::clone(&self.driver),
            Arc::clone(&shared),
            self.tick_interval,
        ));

        while let Some(pending) = self.transport.accept().await {
            let driver = Arc::clone(&self.driver);
            let shared = Arc::clone(&shared);

            tokio::spawn(async move {
                match pending.establish().await {
                    Ok(conn) => {
                        if let Err(e) = handle_connection(conn, driver, shared).await {
                            tracing::debug!(error = %e, "connection ended with error");
                        }
                    },
                    Err(e) => tracing::debug!(error = %e, "handshake failed"),
                }
            });
        }

        ticker.abort();
        tracing::info!("server stopped");
        Ok(())
    }

    /// Local address the server is bound to.
    ///
    /// # Errors
    ///
    /// `Transport` if the socket address cannot be read.
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// The driver, for inspection.
    pub fn driver(&self) -> Arc<ProductionDriver<S>> {
        Arc::clone(&self.driver)
    }
}

/// Drive timeouts and heartbeats.
async fn run_ticker<S: Storage>(
    driver: Arc<ProductionDriver<S>>,
    shared: Arc<SharedState>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match driver.process_event(ServerEvent::Tick) {
            Ok(actions) => execute_actions(actions, &shared).await,
            Err(e) => tracing::warn!(error = %e, "tick failed"),
        }
    }
}

/// Handle a single QUIC connection from accept to cleanup.
async fn handle_connection<S: Storage>(
    conn: QuinnConnection,
    driver: Arc<ProductionDriver<S>>,
    shared: Arc<SharedState>,
) -> Result<(), ServerError> {
    let session_id = driver.allocate_connection_id();
    let (outbox, outbox_rx) = Outbox::with_capacity(driver.config().outbox_capacity);

    tracing::debug!(session_id, remote = %conn.remote_addr(), "new connection");

    shared.connections.write().await.insert(session_id, conn.clone());

    let actions = driver.process_event(ServerEvent::ConnectionAccepted { session_id, outbox })?;
    if !actions.is_empty() {
        execute_actions(actions, &shared).await;
        return Ok(());
    }

    let (send, recv) = match conn.accept_bi().await {
        Ok(streams) => streams,
        Err(e) => {
            driver.process_event(ServerEvent::ConnectionClosed {
                session_id,
                reason: "no stream opened".to_string(),
            })?;
            shared.connections.write().await.remove(&session_id);
            return Err(e);
        },
    };

    let writer = tokio::spawn(write_outbox(session_id, send, outbox_rx));
    let reason = read_frames(session_id, recv, &driver, &shared).await;

    driver.process_event(ServerEvent::ConnectionClosed { session_id, reason: reason.clone() })?;
    shared.connections.write().await.remove(&session_id);

    // Every outbox clone is gone after cleanup, so the writer flushes what is
    // queued and finishes the stream.
    let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await;
    conn.close(0u32.into(), reason.as_bytes());

    Ok(())
}

/// Read frames until the stream ends or a frame cannot be recovered from.
///
/// Returns the reason the connection is ending.
async fn read_frames<S: Storage>(
    session_id: u64,
    mut recv: quinn::RecvStream,
    driver: &Arc<ProductionDriver<S>>,
    shared: &SharedState,
) -> String {
    let mut header_buf = [0u8; FrameHeader::SIZE];

    loop {
        if let Err(e) = recv.read_exact(&mut header_buf).await {
            tracing::debug!(session_id, error = %e, "read ended");
            return "connection closed".to_string();
        }

        let payload_size = match FrameHeader::from_bytes(&header_buf) {
            Ok(header) => header.payload_size() as usize,
            Err(e) => {
                tracing::warn!(session_id, error = %e, "invalid frame header");
                return format!("protocol error: {e}");
            },
        };

        let mut payload = vec![0u8; payload_size];
        if let Err(e) = recv.read_exact(&mut payload).await {
            tracing::debug!(session_id, error = %e, "payload read ended");
            return "connection closed".to_string();
        }

        let event = match ClientMessage::from_frame(&Frame::new(payload)) {
            Ok(message) => ServerEvent::MessageReceived { session_id, message },
            Err(e) if !e.is_fatal() => {
                ServerEvent::MalformedMessage { session_id, reason: e.to_string() }
            },
            Err(e) => return format!("protocol error: {e}"),
        };

        // A send holds its room lock across a storage write, so the driver
        // runs on the blocking pool. Awaiting it keeps this connection's
        // events in order.
        let blocking = Arc::clone(driver);
        match tokio::task::spawn_blocking(move || blocking.process_event(event)).await {
            Ok(Ok(actions)) => execute_actions(actions, shared).await,
            Ok(Err(DriverError::SessionNotFound(_))) => {
                return "connection closed by server".to_string();
            },
            Ok(Err(e)) => tracing::warn!(session_id, error = %e, "event processing failed"),
            Err(e) => {
                tracing::error!(session_id, error = %e, "event task failed");
                return "internal error".to_string();
            },
        }
    }
}

/// Drain a connection's outbox onto its send stream.
async fn write_outbox(session_id: u64, mut send: quinn::SendStream, mut rx: OutboxReceiver) {
    let mut buf = BytesMut::with_capacity(4096);

    while let Some(message) = rx.recv().await {
        if let Err(e) = encode_into(&message, &mut buf) {
            tracing::error!(session_id, error = %e, "failed to encode server event");
            continue;
        }

        if let Err(e) = send.write_all(&buf).await {
            tracing::debug!(session_id, error = %e, "write failed");
            return;
        }
    }

    let _ = send.finish();
}

fn encode_into(message: &ServerMessage, buf: &mut BytesMut) -> Result<(), ServerError> {
    buf.clear();
    message.into_frame()?.encode(buf)?;
    Ok(())
}

/// Execute server actions.
async fn execute_actions(actions: Vec<ServerAction>, shared: &SharedState) {
    for action in actions {
        match action {
            ServerAction::CloseConnection { session_id, reason } => {
                tracing::info!(session_id, %reason, "closing connection");
                if let Some(conn) = shared.connections.write().await.remove(&session_id) {
                    tokio::spawn(async move {
                        tokio::time::sleep(CLOSE_GRACE).await;
                        conn.close(0u32.into(), reason.as_bytes());
                    });
                }
            },
        }
    }
}
