//! Driver error types.
//!
//! Errors here are about the driver's own bookkeeping. Relay failures a
//! client caused (not a member, empty body, ...) never surface as a
//! `ServerError`; they are reported to that client as `error` events.

use std::fmt;

use roomcast_core::ConnectionError;

use crate::registry::RegistryError;

/// Errors that can occur while the driver processes an event.
#[derive(Debug)]
pub enum ServerError {
    /// Session not found.
    ///
    /// The transport reported an event for a connection the driver does not
    /// know, usually one that was just closed. Safe to ignore.
    SessionNotFound(u64),

    /// Session id already in use.
    ///
    /// The transport handed out a duplicate connection id. Ids come from a
    /// CSPRNG, so this indicates a bug.
    SessionAlreadyExists(u64),

    /// Session registry rejected a binding.
    Registry(RegistryError),

    /// Connection state machine rejected a transition.
    Connection(ConnectionError),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionNotFound(id) => write!(f, "session not found: {id}"),
            Self::SessionAlreadyExists(id) => write!(f, "session already exists: {id}"),
            Self::Registry(err) => write!(f, "registry error: {err}"),
            Self::Connection(err) => write!(f, "connection error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Registry(err) => Some(err),
            Self::Connection(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RegistryError> for ServerError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<ConnectionError> for ServerError {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}
