//! Roomcast core.
//!
//! Sans-IO pieces shared by the server and tools: the per-connection
//! lifecycle state machine, identities and room keys, credential
//! verification, and the [`Environment`] abstraction that keeps time and
//! randomness injectable.
//!
//! Nothing here performs I/O. Methods take the current time as a parameter
//! and return actions for the caller to execute.

pub mod auth;
pub mod connection;
pub mod env;
pub mod error;
pub mod identity;

pub use auth::{AuthError, HmacTokenVerifier, IdentityVerifier, TokenClaims};
pub use connection::{Connection, ConnectionAction, ConnectionConfig, ConnectionState};
pub use env::Environment;
pub use error::ConnectionError;
pub use identity::{Identity, RoomKey, RoomKeyError, RoomKind};
