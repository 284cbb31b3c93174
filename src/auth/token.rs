//! Bearer token issuance, verification, and grace-window refresh (C2).
//!
//! No user database is in scope: credentials are a single static
//! username/password pair supplied by configuration, hashed with `bcrypt`.
//! Tokens are signed JWTs (`jsonwebtoken`), HS256, carrying the principal
//! in `sub` and the usual `iat`/`exp` claims.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Window after expiry during which a signature-valid token may still be
/// exchanged for a fresh one via `/auth/refresh`.
pub const REFRESH_GRACE: chrono::Duration = chrono::Duration::hours(24);

/// JWT claims issued by this gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Principal identifier (the username).
    pub sub: String,
    /// Issued-at, seconds since epoch.
    pub iat: i64,
    /// Expiry, seconds since epoch.
    pub exp: i64,
}

/// Issues and verifies bearer tokens against a single configured secret.
#[derive(Clone)]
pub struct TokenService {
    secret: String,
    expires_in: chrono::Duration,
}

/// Outcome of verifying a token: either it is valid, or it is expired but
/// still within the refresh grace window (signature still checks out).
pub enum Verification {
    /// Token is valid right now.
    Valid(Claims),
    /// Token's signature checks out but it has expired; still refreshable
    /// if within [`REFRESH_GRACE`].
    ExpiredWithinGrace(Claims),
}

impl TokenService {
    /// Build a token service. `expires_in` is the lifetime assigned to
    /// freshly issued tokens (from `JWT_EXPIRES_IN`).
    pub fn new(secret: impl Into<String>, expires_in: chrono::Duration) -> Self {
        Self {
            secret: secret.into(),
            expires_in,
        }
    }

    /// Issue a fresh token for `principal`.
    pub fn issue(&self, principal: &str) -> Result<String> {
        let now = chrono::Utc::now();
        let claims = Claims {
            sub: principal.to_string(),
            iat: now.timestamp(),
            exp: (now + self.expires_in).timestamp(),
        };
        jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| BridgeError::Authentication(format!("failed to sign token: {e}")).into())
    }

    /// Verify a token's signature and parse its claims, ignoring expiry.
    /// Callers use this to distinguish "expired but refreshable" from
    /// "signature invalid" (hard-rejected, never refreshable).
    fn decode_ignoring_expiry(&self, token: &str) -> Result<Claims> {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        validation.validate_exp = false;
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )
        .map_err(|e| BridgeError::Authentication(format!("invalid token signature: {e}")))?;
        Ok(data.claims)
    }

    /// Verify a token is currently valid (signature checks out and it has
    /// not expired). Used at WebSocket upgrade and `/auth/verify`.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
        let data = jsonwebtoken::decode::<Claims>(
            token,
            &jsonwebtoken::DecodingKey::from_secret(self.secret.as_bytes()),
            &mut validation,
        )
        .map_err(|e| BridgeError::Authentication(format!("invalid or expired token: {e}")))?;
        Ok(data.claims)
    }

    /// Classify a token for refresh purposes: valid-now, expired-but-within-grace,
    /// or hard-rejected (bad signature, or expired past the grace window).
    pub fn classify_for_refresh(&self, token: &str) -> Result<Verification> {
        let claims = self.decode_ignoring_expiry(token)?;
        let now = chrono::Utc::now().timestamp();
        if claims.exp >= now {
            return Ok(Verification::Valid(claims));
        }
        let grace_deadline = claims.exp + REFRESH_GRACE.num_seconds();
        if now <= grace_deadline {
            Ok(Verification::ExpiredWithinGrace(claims))
        } else {
            Err(BridgeError::Authentication("token expired past the refresh grace window".to_string()).into())
        }
    }

    /// Refresh a token: re-issue with a fresh `iat`/`exp` for the same
    /// principal, provided it classifies as valid or within grace.
    pub fn refresh(&self, token: &str) -> Result<String> {
        let claims = match self.classify_for_refresh(token)? {
            Verification::Valid(c) => c,
            Verification::ExpiredWithinGrace(c) => c,
        };
        self.issue(&claims.sub)
    }
}

/// Hash a plaintext password for storage/comparison via `bcrypt`.
pub fn hash_password(plaintext: &str) -> Result<String> {
    bcrypt::hash(plaintext, bcrypt::DEFAULT_COST)
        .map_err(|e| BridgeError::Internal(format!("failed to hash password: {e}")).into())
}

/// Verify a plaintext password against a stored bcrypt hash.
pub fn verify_password(plaintext: &str, hash: &str) -> Result<bool> {
    bcrypt::verify(plaintext, hash)
        .map_err(|e| BridgeError::Internal(format!("failed to verify password: {e}")).into())
}
