//! Bearer-token identity verification at the connection boundary.
//!
//! Every connection presents an opaque credential during the handshake.
//! [`IdentityVerifier::verify`] either resolves it to an [`Identity`] or
//! rejects with [`AuthError::Unauthenticated`] before any room logic runs.
//! Everything downstream trusts the returned identity.
//!
//! Token issuance (login, MFA, rotation) lives in a separate service; this
//! module only validates HS256-signed tokens. [`IdentityVerifier::mint`]
//! exists for provisioning tools and tests.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A verified participant identity, immutable for the connection lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: Uuid,
    pub display_name: String,
    /// Clinical role, e.g. `"physician"` or `"nurse"`. Opaque to the
    /// backbone; authorization decisions belong to the issuing service.
    pub role: String,
    /// Stable RGBA color derived from the participant id, used by clients
    /// to render cursors consistently across sessions.
    pub color_hint: [f32; 4],
}

impl Identity {
    pub fn new(id: Uuid, display_name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role: role.into(),
            color_hint: color_from_id(id),
        }
    }
}

/// Stable color from the participant id hash.
pub fn color_from_id(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// JWT claims carried by a credential.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// Participant id (UUID).
    sub: String,
    /// Display name.
    name: String,
    /// Clinical role.
    role: String,
    /// Expiration time (Unix timestamp).
    exp: u64,
    /// Issued at time (Unix timestamp).
    iat: u64,
}

/// Authentication failures. The connection is refused before any state
/// changes.
#[derive(Debug, Clone)]
pub enum AuthError {
    Unauthenticated(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unauthenticated(reason) => write!(f, "Unauthenticated: {reason}"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Stateless credential verifier. Safe to share across connections and
/// services; the case-update API reuses the same instance for its bearer
/// check.
pub struct IdentityVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl IdentityVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::default(),
        }
    }

    /// Resolve a credential to an [`Identity`].
    ///
    /// Fails when the credential is missing, malformed, expired, or names
    /// a principal id that is not a UUID.
    pub fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        if credential.is_empty() {
            return Err(AuthError::Unauthenticated("missing credential".into()));
        }
        let data = decode::<Claims>(credential, &self.decoding, &self.validation)
            .map_err(|e| AuthError::Unauthenticated(e.to_string()))?;
        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|e| AuthError::Unauthenticated(format!("invalid subject: {e}")))?;
        Ok(Identity::new(id, data.claims.name, data.claims.role))
    }

    /// Mint a token for the given principal, valid for `ttl_secs`.
    pub fn mint(
        &self,
        id: Uuid,
        display_name: &str,
        role: &str,
        ttl_secs: u64,
    ) -> Result<String, AuthError> {
        let now = epoch_secs();
        let claims = Claims {
            sub: id.to_string(),
            name: display_name.to_string(),
            role: role.to_string(),
            exp: now + ttl_secs,
            iat: now,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Unauthenticated(e.to_string()))
    }
}

pub(crate) fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
