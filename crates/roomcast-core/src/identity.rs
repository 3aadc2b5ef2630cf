//! Identities and room keys.
//!
//! A private room's key is derived from its two participants so that either
//! side computes the same key without coordination. Group rooms are named
//! freely.

use std::{borrow::Cow, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum room key length in bytes.
pub const MAX_ROOM_KEY_LEN: usize = 256;

/// Prefix shared by every private room key.
pub const PRIVATE_ROOM_PREFIX: &str = "dm_";

/// Verified user identity, bound to a connection once and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Stable user identifier
    pub user_id: String,
    /// Name shown to other users
    pub display_name: String,
}

impl Identity {
    /// Build an identity.
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), display_name: display_name.into() }
    }
}

/// Why a room key was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomKeyError {
    /// Key or participant id is empty
    #[error("room key is empty")]
    Empty,

    /// Key exceeds [`MAX_ROOM_KEY_LEN`]
    #[error("room key is {len} bytes (max {MAX_ROOM_KEY_LEN})")]
    TooLong {
        /// Actual length in bytes
        len: usize,
    },

    /// Key contains control characters
    #[error("room key contains control characters")]
    ControlCharacter,
}

/// Whether a room is a two-party conversation or an open group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomKind {
    /// Two fixed participants, key derived by [`RoomKey::private`]
    Private,
    /// Open membership, free-form name
    Group,
}

/// Validated room key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomKey(String);

impl RoomKey {
    /// Validate a key received from a client.
    pub fn parse(key: impl Into<String>) -> Result<Self, RoomKeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(RoomKeyError::Empty);
        }
        if key.len() > MAX_ROOM_KEY_LEN {
            return Err(RoomKeyError::TooLong { len: key.len() });
        }
        if key.chars().any(char::is_control) {
            return Err(RoomKeyError::ControlCharacter);
        }
        Ok(Self(key))
    }

    /// Key of the private room shared by users `a` and `b`.
    ///
    /// Pure and order-independent: `private(a, b) == private(b, a)`. Ids are
    /// escaped before joining so no `_` inside an id can shift the boundary;
    /// distinct pairs therefore never share a key. Plain ids read naturally:
    /// `private("bob", "alice")` is `dm_alice_bob`.
    pub fn private(a: &str, b: &str) -> Result<Self, RoomKeyError> {
        if a.is_empty() || b.is_empty() {
            return Err(RoomKeyError::Empty);
        }

        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self::parse(format!("{PRIVATE_ROOM_PREFIX}{}_{}", escape(lo), escape(hi)))
    }

    /// Private or group.
    pub fn kind(&self) -> RoomKind {
        if self.private_participants().is_some() { RoomKind::Private } else { RoomKind::Group }
    }

    /// The two participant ids of a private key, sorted. `None` for group keys.
    pub fn private_participants(&self) -> Option<(String, String)> {
        let rest = self.0.strip_prefix(PRIVATE_ROOM_PREFIX)?;
        let (lo, hi) = rest.split_once('_')?;
        if lo.is_empty() || hi.is_empty() || hi.contains('_') {
            return None;
        }
        Some((unescape(lo)?, unescape(hi)?))
    }

    /// Key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoomKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoomKey {
    type Error = RoomKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoomKey> for String {
    fn from(key: RoomKey) -> Self {
        key.0
    }
}

fn escape(id: &str) -> Cow<'_, str> {
    if id.contains(['%', '_']) {
        Cow::Owned(id.replace('%', "%25").replace('_', "%5F"))
    } else {
        Cow::Borrowed(id)
    }
}

fn unescape(part: &str) -> Option<String> {
    let mut out = String::with_capacity(part.len());
    let mut rest = part;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        match rest.get(pos..pos + 3)? {
            "%25" => out.push('%'),
            "%5F" => out.push('_'),
            _ => return None,
        }
        rest = &rest[pos + 3..];
    }
    out.push_str(rest);
    Some(out)
}
