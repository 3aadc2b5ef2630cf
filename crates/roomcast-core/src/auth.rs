//! Credential verification.
//!
//! The relay does not issue or store credentials. It receives an opaque token
//! on each new connection and asks an [`IdentityVerifier`] who it belongs to.
//!
//! [`HmacTokenVerifier`] is the bundled verifier: tokens are CBOR claims
//! signed with HMAC-SHA256 under a secret shared with the issuer,
//!
//! ```text
//! hex(cbor(claims)) "." hex(hmac_sha256(secret, cbor(claims)))
//! ```

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::identity::Identity;

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on accepted token length, checked before any decoding.
pub const MAX_TOKEN_LEN: usize = 4096;

/// Why a credential was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No token presented
    #[error("missing token")]
    Missing,

    /// Token malformed or signature mismatch
    #[error("invalid token: {0}")]
    Invalid(String),

    /// Token was valid but has expired
    #[error("token expired at {expired_at}")]
    Expired {
        /// Expiry, Unix seconds
        expired_at: u64,
    },
}

/// Resolves a credential token to an identity.
///
/// Called once per connection. Implementations must be stateless with
/// respect to connections; the same token verifies the same way every time
/// until it expires.
pub trait IdentityVerifier: Send + Sync + 'static {
    /// Verify `token` at wall-clock time `now_secs`.
    fn verify(&self, token: &str, now_secs: u64) -> Result<Identity, AuthError>;
}

/// Signed token contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id
    pub sub: String,
    /// Display name; the user id is used when absent or empty
    #[serde(default)]
    pub name: Option<String>,
    /// Expiry, Unix seconds
    pub exp: u64,
}

/// HMAC-SHA256 token verifier.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    secret: Vec<u8>,
}

impl HmacTokenVerifier {
    /// Verifier for tokens signed with `secret`.
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self { secret: secret.as_ref().to_vec() }
    }

    /// Mint a token for `claims`.
    ///
    /// Issuance normally lives with the identity provider; this exists for
    /// tooling and tests that need to speak to a relay.
    pub fn issue(&self, claims: &TokenClaims) -> Result<String, AuthError> {
        let mut body = Vec::new();
        ciborium::into_writer(claims, &mut body)
            .map_err(|e| AuthError::Invalid(format!("claims encode failed: {e}")))?;

        let mut mac = self.mac()?;
        mac.update(&body);
        let signature = mac.finalize().into_bytes();

        Ok(format!("{}.{}", hex::encode(&body), hex::encode(signature)))
    }

    fn mac(&self) -> Result<HmacSha256, AuthError> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthError::Invalid(format!("verifier key rejected: {e}")))
    }
}

impl std::fmt::Debug for HmacTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacTokenVerifier").finish_non_exhaustive()
    }
}

impl IdentityVerifier for HmacTokenVerifier {
    fn verify(&self, token: &str, now_secs: u64) -> Result<Identity, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        if token.len() > MAX_TOKEN_LEN {
            return Err(AuthError::Invalid("token too long".into()));
        }

        let (body_hex, sig_hex) =
            token.split_once('.').ok_or_else(|| AuthError::Invalid("malformed token".into()))?;
        let body =
            hex::decode(body_hex).map_err(|_| AuthError::Invalid("malformed claims".into()))?;
        let signature =
            hex::decode(sig_hex).map_err(|_| AuthError::Invalid("malformed signature".into()))?;

        // Signature first: nothing inside the claims is trusted before this.
        let mut mac = self.mac()?;
        mac.update(&body);
        mac.verify_slice(&signature).map_err(|_| AuthError::Invalid("bad signature".into()))?;

        let claims: TokenClaims = ciborium::from_reader(&body[..])
            .map_err(|e| AuthError::Invalid(format!("claims decode failed: {e}")))?;

        if claims.sub.is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        if claims.exp <= now_secs {
            return Err(AuthError::Expired { expired_at: claims.exp });
        }

        let display_name = claims.name.filter(|n| !n.trim().is_empty()).unwrap_or_else(|| claims.sub.clone());
        Ok(Identity { user_id: claims.sub, display_name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn claims(sub: &str) -> TokenClaims {
        TokenClaims { sub: sub.into(), name: Some(format!("{sub} (display)")), exp: NOW + 3600 }
    }

    #[test]
    fn issued_token_verifies() {
        let verifier = HmacTokenVerifier::new(b"secret");
        let token = verifier.issue(&claims("alice")).unwrap();

        let identity = verifier.verify(&token, NOW).unwrap();
        assert_eq!(identity, Identity::new("alice", "alice (display)"));
    }

    #[test]
    fn missing_token() {
        let verifier = HmacTokenVerifier::new(b"secret");
        assert_eq!(verifier.verify("", NOW), Err(AuthError::Missing));
        assert_eq!(verifier.verify("   ", NOW), Err(AuthError::Missing));
    }

    #[test]
    fn wrong_secret_is_invalid() {
        let token = HmacTokenVerifier::new(b"one").issue(&claims("alice")).unwrap();
        let result = HmacTokenVerifier::new(b"two").verify(&token, NOW);
        assert!(matches!(result, Err(AuthError::Invalid(_))));
    }

    #[test]
    fn tampered_claims_are_invalid() {
        let verifier = HmacTokenVerifier::new(b"secret");
        let token = verifier.issue(&claims("alice")).unwrap();
        let (_, sig) = token.split_once('.').unwrap();

        let mut forged = Vec::new();
        ciborium::into_writer(&claims("mallory"), &mut forged).unwrap();
        let forged = format!("{}.{sig}", hex::encode(forged));

        assert!(matches!(verifier.verify(&forged, NOW), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn expired_token() {
        let verifier = HmacTokenVerifier::new(b"secret");
        let token = verifier.issue(&TokenClaims { exp: NOW, ..claims("alice") }).unwrap();
        assert_eq!(verifier.verify(&token, NOW), Err(AuthError::Expired { expired_at: NOW }));
    }

    #[test]
    fn garbage_is_invalid() {
        let verifier = HmacTokenVerifier::new(b"secret");
        for token in ["nodot", "zz.zz", "abcd.", ".abcd"] {
            assert!(matches!(verifier.verify(token, NOW), Err(AuthError::Invalid(_))), "{token}");
        }
    }

    #[test]
    fn display_name_falls_back_to_user_id() {
        let verifier = HmacTokenVerifier::new(b"secret");
        let token = verifier.issue(&TokenClaims { name: None, ..claims("bob") }).unwrap();
        assert_eq!(verifier.verify(&token, NOW).unwrap().display_name, "bob");
    }
}
