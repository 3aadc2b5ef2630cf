//! Connection lifecycle state machine.
//!
//! Tracks one connection from transport accept to teardown, plus heartbeats
//! and timeouts. Uses the action pattern: methods take time as input and
//! return actions for the driver to execute, so the state machine stays pure.
//!
//! # State Machine
//!
//! ```text
//! ┌────────────┐ authenticate ┌────────────────┐   verified   ┌────────┐
//! │ Connecting │─────────────>│ Authenticating │─────────────>│ Active │
//! └────────────┘              └────────────────┘              └────────┘
//!       │                             │                            │
//!       │ timeout                     │ rejected / timeout         │ close / idle
//!       ↓                             ↓                            ↓
//!                          ┌──────────────────┐
//!                          │   Disconnected   │ (terminal)
//!                          └──────────────────┘
//! ```
//!
//! A rejected connection never passes through `Active`, so it never holds an
//! identity.

use std::{
    ops::Sub,
    time::{Duration, Instant},
};

use crate::{error::ConnectionError, identity::Identity};

/// Time allowed between transport accept and a verified credential.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum time allowed without any inbound activity while active.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Interval at which active connections are pinged.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// Actions returned by the connection state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Send a heartbeat ping to the peer
    SendPing,

    /// Close the connection with this reason
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport accepted, waiting for a credential
    Connecting,
    /// Credential received, verification in progress
    Authenticating,
    /// Identity bound, relay operations allowed
    Active,
    /// Terminal
    Disconnected,
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for presenting and verifying a credential
    pub handshake_timeout: Duration,
    /// Idle timeout before disconnecting an active connection
    pub idle_timeout: Duration,
    /// Heartbeat interval (should be < idle_timeout / 2)
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

/// Connection state machine.
///
/// Pure: no I/O and no environment stored. Generic over `Instant` so tests
/// can use virtual time.
#[derive(Debug, Clone)]
pub struct Connection<I = Instant>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    connection_id: u64,
    state: ConnectionState,
    config: ConnectionConfig,
    last_activity: I,
    last_heartbeat: Option<I>,
    identity: Option<Identity>,
}

impl<I> Connection<I>
where
    I: Copy + Ord + Send + Sync + Sub<Output = Duration>,
{
    /// Create a new connection in [`ConnectionState::Connecting`].
    pub fn new(connection_id: u64, now: I, config: ConnectionConfig) -> Self {
        Self {
            connection_id,
            state: ConnectionState::Connecting,
            config,
            last_activity: now,
            last_heartbeat: None,
            identity: None,
        }
    }

    /// Transport-assigned connection id.
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Bound identity. `None` unless the connection reached `Active`.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// True while relay operations are allowed.
    pub fn is_active(&self) -> bool {
        self.state == ConnectionState::Active
    }

    /// A credential arrived; verification starts.
    ///
    /// # Errors
    ///
    /// `ConnectionError::InvalidState` unless in `Connecting`.
    pub fn begin_authentication(&mut self, now: I) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connecting {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "begin_authentication",
            });
        }

        self.state = ConnectionState::Authenticating;
        self.last_activity = now;
        Ok(())
    }

    /// The credential was verified; bind the identity.
    ///
    /// # Errors
    ///
    /// `ConnectionError::InvalidState` unless in `Authenticating`.
    pub fn complete_authentication(
        &mut self,
        identity: Identity,
        now: I,
    ) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Authenticating {
            return Err(ConnectionError::InvalidState {
                state: self.state,
                operation: "complete_authentication",
            });
        }

        self.identity = Some(identity);
        self.state = ConnectionState::Active;
        self.last_activity = now;
        self.last_heartbeat = Some(now);
        Ok(())
    }

    /// The credential was rejected. Goes straight to `Disconnected` without
    /// binding anything.
    pub fn reject(&mut self) {
        self.identity = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Mark the connection disconnected.
    ///
    /// Returns `true` if it was active, i.e. the caller owes room and
    /// presence cleanup. Closing twice returns `false` the second time.
    pub fn close(&mut self) -> bool {
        let was_active = self.state == ConnectionState::Active;
        self.state = ConnectionState::Disconnected;
        was_active
    }

    /// Record inbound activity.
    ///
    /// Events processed concurrently can arrive with timestamps out of
    /// order; activity never moves backwards.
    pub fn update_activity(&mut self, now: I) {
        self.last_activity = self.last_activity.max(now);
    }

    /// Elapsed time since last activity if the applicable timeout is
    /// exceeded, `None` otherwise.
    pub fn check_timeout(&self, now: I) -> Option<Duration> {
        let elapsed = since(now, self.last_activity);

        let timeout = match self.state {
            ConnectionState::Connecting | ConnectionState::Authenticating => {
                self.config.handshake_timeout
            },
            ConnectionState::Active => self.config.idle_timeout,
            ConnectionState::Disconnected => return None,
        };

        if elapsed > timeout { Some(elapsed) } else { None }
    }

    /// Periodic maintenance: timeouts and heartbeats.
    ///
    /// A timeout moves the connection to `Disconnected` and yields a single
    /// `Close`. Sending a ping does not count as activity; only inbound
    /// traffic keeps a connection alive.
    pub fn tick(&mut self, now: I) -> Vec<ConnectionAction> {
        if let Some(elapsed) = self.check_timeout(now) {
            let reason = if self.state == ConnectionState::Active {
                ConnectionError::IdleTimeout { elapsed }
            } else {
                ConnectionError::HandshakeTimeout { elapsed }
            };

            self.state = ConnectionState::Disconnected;
            return vec![ConnectionAction::Close { reason: reason.to_string() }];
        }

        if self.state != ConnectionState::Active {
            return Vec::new();
        }

        let due = self
            .last_heartbeat
            .is_none_or(|last| since(now, last) >= self.config.heartbeat_interval);

        if due {
            self.last_heartbeat = Some(now);
            vec![ConnectionAction::SendPing]
        } else {
            Vec::new()
        }
    }
}

/// `now - earlier`, zero if `earlier` is the later instant.
fn since<I>(now: I, earlier: I) -> Duration
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    if now > earlier { now - earlier } else { Duration::ZERO }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Identity {
        Identity::new("alice", "Alice")
    }

    fn active(now: Instant) -> Connection {
        let mut conn = Connection::new(1, now, ConnectionConfig::default());
        conn.begin_authentication(now).unwrap();
        conn.complete_authentication(alice(), now).unwrap();
        conn
    }

    #[test]
    fn happy_path_binds_identity() {
        let t0 = Instant::now();
        let conn = active(t0);

        assert_eq!(conn.state(), ConnectionState::Active);
        assert_eq!(conn.identity(), Some(&alice()));
        assert_eq!(conn.connection_id(), 1);
    }

    #[test]
    fn rejected_connection_never_holds_identity() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(7, t0, ConnectionConfig::default());
        conn.begin_authentication(t0).unwrap();
        conn.reject();

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(conn.identity().is_none());
        assert!(!conn.close(), "rejected connections owe no cleanup");
    }

    #[test]
    fn cannot_skip_authenticating() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(7, t0, ConnectionConfig::default());

        let err = conn.complete_authentication(alice(), t0).unwrap_err();
        assert!(matches!(err, ConnectionError::InvalidState {
            state: ConnectionState::Connecting,
            ..
        }));
    }

    #[test]
    fn cannot_authenticate_twice() {
        let t0 = Instant::now();
        let mut conn = active(t0);
        assert!(conn.begin_authentication(t0).is_err());
    }

    #[test]
    fn close_reports_cleanup_once() {
        let t0 = Instant::now();
        let mut conn = active(t0);
        assert!(conn.close());
        assert!(!conn.close());
    }

    #[test]
    fn handshake_timeout_closes() {
        let t0 = Instant::now();
        let mut conn: Connection = Connection::new(1, t0, ConnectionConfig::default());

        let actions = conn.tick(t0 + DEFAULT_HANDSHAKE_TIMEOUT + Duration::from_secs(1));
        assert_eq!(actions.len(), 1);
        assert!(matches!(&actions[0], ConnectionAction::Close { reason } if reason.contains("handshake")));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn idle_timeout_closes_active() {
        let t0 = Instant::now();
        let mut conn = active(t0);

        let actions = conn.tick(t0 + DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1));
        assert!(matches!(&actions[..], [ConnectionAction::Close { reason }] if reason.contains("idle")));
    }

    #[test]
    fn heartbeat_due_after_interval() {
        let t0 = Instant::now();
        let mut conn = active(t0);

        assert!(conn.tick(t0 + Duration::from_secs(1)).is_empty());

        let t1 = t0 + DEFAULT_HEARTBEAT_INTERVAL;
        assert_eq!(conn.tick(t1), vec![ConnectionAction::SendPing]);
        assert!(conn.tick(t1 + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn pings_alone_do_not_keep_connection_alive() {
        let t0 = Instant::now();
        let mut conn = active(t0);

        let mut now = t0;
        let mut closed = false;
        for _ in 0..10 {
            now += DEFAULT_HEARTBEAT_INTERVAL;
            if conn.tick(now).iter().any(|a| matches!(a, ConnectionAction::Close { .. })) {
                closed = true;
                break;
            }
        }
        assert!(closed);
    }

    #[test]
    fn activity_defers_idle_timeout() {
        let t0 = Instant::now();
        let mut conn = active(t0);

        let t1 = t0 + DEFAULT_IDLE_TIMEOUT - Duration::from_secs(1);
        conn.update_activity(t1);
        assert!(conn.check_timeout(t1 + Duration::from_secs(30)).is_none());
    }

    #[test]
    fn stale_instants_do_not_underflow() {
        // Virtual-clock instants; plain `Duration` subtraction panics on underflow.
        let t0 = Duration::from_secs(100);
        let mut conn = Connection::new(1, t0, ConnectionConfig::default());
        conn.begin_authentication(t0).unwrap();
        conn.complete_authentication(alice(), t0).unwrap();

        conn.update_activity(t0 + Duration::from_secs(5));
        conn.update_activity(t0 + Duration::from_secs(2));
        assert!(conn.check_timeout(t0).is_none());
        let early = conn.tick(t0 + Duration::from_secs(1));
        assert!(!early.iter().any(|a| matches!(a, ConnectionAction::Close { .. })));

        let late = t0 + Duration::from_secs(5) + DEFAULT_IDLE_TIMEOUT + Duration::from_secs(1);
        assert!(matches!(&conn.tick(late)[..], [ConnectionAction::Close { .. }]));
    }
}
