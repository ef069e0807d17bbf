//! Revocable sessions: JWT tokens paired with store-resident records.
//!
//! A token is valid only while both its signature verifies and its
//! session record exists in the store. Deleting the record revokes the
//! token immediately, even though the signature stays cryptographically
//! valid until `exp`.

use crate::error::SessionError;
use crate::store::{SessionRecord, Store};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    /// User the session belongs to
    pub sub: String,
    /// Session ID keying the store record
    pub sid: String,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub secret: String,
    pub ttl_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: Uuid::new_v4().to_string(),
            ttl_hours: 24,
        }
    }
}

/// Issues and validates session tokens
pub struct SessionManager {
    store: Arc<dyn Store>,
    config: SessionConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl SessionManager {
    pub fn new(store: Arc<dyn Store>, config: SessionConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            store,
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// Create a session: a signed token plus the store record backing it.
    /// Returns the token and the session ID.
    pub async fn create(&self, user_id: &str) -> Result<(String, String), SessionError> {
        let now = Utc::now();
        let ttl = chrono::Duration::hours(self.config.ttl_hours);
        let session_id = Uuid::new_v4().to_string();

        let claims = SessionClaims {
            sub: user_id.to_string(),
            sid: session_id.clone(),
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|_| SessionError::InvalidToken)?;

        let record = SessionRecord {
            user_id: user_id.to_string(),
            created_at: now.timestamp(),
            expires_at: (now + ttl).timestamp(),
        };
        self.store
            .put_session(
                &session_id,
                &record,
                Duration::from_secs((self.config.ttl_hours * 3600) as u64),
            )
            .await?;

        Ok((token, session_id))
    }

    /// Validate a token. Requires a verified signature AND a live store
    /// record; a deleted or expired record rejects the token as expired.
    pub async fn validate(&self, token: &str) -> Result<String, SessionError> {
        let data = decode::<SessionClaims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| SessionError::InvalidToken)?;

        let record = self
            .store
            .get_session(&data.claims.sid)
            .await?
            .ok_or(SessionError::Expired)?;

        if record.expires_at <= Utc::now().timestamp() {
            return Err(SessionError::Expired);
        }

        Ok(record.user_id)
    }

    /// Revoke a session server-side
    pub async fn revoke(&self, session_id: &str) -> Result<(), SessionError> {
        self.store.delete_session(session_id).await?;
        Ok(())
    }

    /// Revoke the session a token belongs to
    pub async fn revoke_token(&self, token: &str) -> Result<(), SessionError> {
        let data = decode::<SessionClaims>(token, &self.decoding_key, &Validation::default())
            .map_err(|_| SessionError::InvalidToken)?;
        self.revoke(&data.claims.sid).await
    }

    /// Extract a bearer token from an Authorization header value
    pub fn extract_bearer(auth_header: &str) -> Option<&str> {
        auth_header.strip_prefix("Bearer ")
    }
}
