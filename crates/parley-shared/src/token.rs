//! Signed session tokens.
//!
//! A token is `base64url(claims_json) "." base64url(ed25519_signature)`, where
//! the signature covers the encoded claims segment. The server signs tokens at
//! login and verifies them on every authenticated request and on WebSocket
//! connection.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

/// Payload carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// The authenticated user.
    pub sub: UserId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Issues and verifies session tokens with the server's Ed25519 key.
#[derive(Clone)]
pub struct TokenSigner {
    signing_key: SigningKey,
    ttl: Duration,
}

impl TokenSigner {
    /// Random per-process key. Tokens do not survive a restart.
    pub fn generate(ttl: Duration) -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
            ttl,
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32], ttl: Duration) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
            ttl,
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Issue a token for `user` valid for the configured TTL.
    pub fn issue(&self, user: UserId) -> String {
        let now = Utc::now();
        self.issue_claims(&SessionClaims {
            sub: user,
            issued_at: now,
            expires_at: self.expires_from(now),
        })
    }

    /// Expiry for a token issued at `now`, saturating at the latest
    /// representable instant.
    fn expires_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn issue_claims(&self, claims: &SessionClaims) -> String {
        // Serializing a struct of ids and timestamps cannot fail.
        let json = serde_json::to_vec(claims).unwrap_or_default();
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = self.signing_key.sign(payload.as_bytes());
        format!("{payload}.{}", URL_SAFE_NO_PAD.encode(signature.to_bytes()))
    }

    /// Check signature and expiry, returning the claims.
    pub fn verify(&self, token: &str) -> Result<SessionClaims, TokenError> {
        verify_with_key(token, &self.signing_key.verifying_key())
    }
}

pub fn verify_with_key(token: &str, key: &VerifyingKey) -> Result<SessionClaims, TokenError> {
    let (payload, signature) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| TokenError::Malformed)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| TokenError::Malformed)?;

    key.verify(payload.as_bytes(), &signature)
        .map_err(|_| TokenError::BadSignature)?;

    let json = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| TokenError::Malformed)?;
    let claims: SessionClaims = serde_json::from_slice(&json).map_err(|_| TokenError::Malformed)?;

    if Utc::now() >= claims.expires_at {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}
