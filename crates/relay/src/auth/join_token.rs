// Short-lived, single-purpose join tokens for WebSocket upgrades.
//
// A join token is distinct from the primary access token: it carries the
// target session, an optional batch id (owner-class tokens only) and a fixed
// purpose tag. Each token id (`jti`) may be consumed once.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::jwt::current_unix_timestamp;

pub const JOIN_TOKEN_PURPOSE: &str = "session_join";
pub const DEFAULT_JOIN_TOKEN_TTL_SECONDS: i64 = 60;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum JoinTokenError {
    #[error("join token is malformed or has a bad signature")]
    Invalid,
    #[error("join token has expired")]
    Expired,
    #[error("token was not issued for joining a session")]
    WrongPurpose,
    #[error("join token carries a malformed subject")]
    InvalidSubject,
    #[error("join token has already been used")]
    AlreadyUsed,
    #[error("failed to encode join token: {0}")]
    Encode(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct RawJoinClaims {
    sub: String,
    sid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bid: Option<String>,
    purpose: String,
    jti: String,
    iat: i64,
    exp: i64,
}

/// Validated join token claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinClaims {
    pub user_id: Uuid,
    pub session_id: Uuid,
    /// Present only on owner-class tokens.
    pub batch_id: Option<Uuid>,
    pub token_id: Uuid,
    pub issued_at: i64,
    pub expires_at: i64,
}

impl JoinClaims {
    pub fn is_owner_class(&self) -> bool {
        self.batch_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedJoinToken {
    pub token: String,
    pub expires_in: i64,
}

pub struct JoinTokenAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    /// Consumed token ids mapped to their expiry.
    consumed: Mutex<HashMap<Uuid, i64>>,
}

impl JoinTokenAuthority {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            anyhow::bail!("join token secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            consumed: Mutex::new(HashMap::new()),
        })
    }

    pub fn issue(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        batch_id: Option<Uuid>,
        ttl: Duration,
    ) -> Result<IssuedJoinToken, JoinTokenError> {
        let now = current_unix_timestamp().map_err(|error| JoinTokenError::Encode(error.to_string()))?;
        self.encode_claims(user_id, session_id, batch_id, ttl, now)
    }

    /// Mints a token at an arbitrary issue time. Test builds only.
    #[cfg(test)]
    pub(crate) fn issue_at(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        batch_id: Option<Uuid>,
        ttl: Duration,
        issued_at: i64,
    ) -> Result<IssuedJoinToken, JoinTokenError> {
        self.encode_claims(user_id, session_id, batch_id, ttl, issued_at)
    }

    fn encode_claims(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        batch_id: Option<Uuid>,
        ttl: Duration,
        issued_at: i64,
    ) -> Result<IssuedJoinToken, JoinTokenError> {
        let expires_in = i64::try_from(ttl.as_secs()).unwrap_or(DEFAULT_JOIN_TOKEN_TTL_SECONDS);
        let claims = RawJoinClaims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            bid: batch_id.map(|batch_id| batch_id.to_string()),
            purpose: JOIN_TOKEN_PURPOSE.to_string(),
            jti: Uuid::new_v4().to_string(),
            iat: issued_at,
            exp: issued_at + expires_in,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|error| JoinTokenError::Encode(error.to_string()))?;

        Ok(IssuedJoinToken { token, expires_in })
    }

    /// Checks signature, expiry and purpose. Does not consume the token;
    /// session-id match and the primary credential are checked by the caller.
    pub fn validate(&self, token: &str) -> Result<JoinClaims, JoinTokenError> {
        let raw = decode::<RawJoinClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|error| match error.kind() {
                ErrorKind::ExpiredSignature => JoinTokenError::Expired,
                _ => JoinTokenError::Invalid,
            })?
            .claims;

        if raw.purpose != JOIN_TOKEN_PURPOSE {
            return Err(JoinTokenError::WrongPurpose);
        }

        let parse = |value: &str| Uuid::parse_str(value).map_err(|_| JoinTokenError::InvalidSubject);
        Ok(JoinClaims {
            user_id: parse(&raw.sub)?,
            session_id: parse(&raw.sid)?,
            batch_id: raw.bid.as_deref().map(parse).transpose()?,
            token_id: parse(&raw.jti)?,
            issued_at: raw.iat,
            expires_at: raw.exp,
        })
    }

    /// Marks the token id as used. A second consume of the same id fails
    /// until the token's own expiry has passed.
    pub fn consume(&self, claims: &JoinClaims) -> Result<(), JoinTokenError> {
        let now = current_unix_timestamp().map_err(|_| JoinTokenError::Invalid)?;
        if claims.expires_at < now {
            return Err(JoinTokenError::Expired);
        }

        let mut consumed = self.consumed.lock().map_err(|_| JoinTokenError::Invalid)?;
        consumed.retain(|_, expires_at| *expires_at >= now);
        if consumed.contains_key(&claims.token_id) {
            return Err(JoinTokenError::AlreadyUsed);
        }
        consumed.insert(claims.token_id, claims.expires_at);
        Ok(())
    }

    #[cfg(test)]
    fn consumed_len(&self) -> usize {
        self.consumed.lock().map(|consumed| consumed.len()).unwrap_or_default()
    }
}
