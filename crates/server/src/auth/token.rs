// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HS256 bearer tokens.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by every control-plane token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User or agent id.
    pub sub: String,
    pub role: String,
    /// Expiry, epoch seconds.
    pub exp: u64,
    /// Issued-at, epoch seconds.
    pub iat: u64,
    /// Token id, the blacklist key.
    pub jti: String,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "sessionId")]
    pub session_id: Option<String>,
}

/// Token verification failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// Bad signature or malformed token.
    Failed,
    Expired,
    Blacklisted,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed => f.write_str("invalid token"),
            Self::Expired => f.write_str("token expired"),
            Self::Blacklisted => f.write_str("token blacklisted"),
        }
    }
}

impl std::error::Error for AuthError {}

/// HMAC key pair plus validation rules.
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenKeys {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        match jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation) {
            Ok(data) => Ok(data.claims),
            Err(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => Err(AuthError::Expired),
                _ => Err(AuthError::Failed),
            },
        }
    }

    /// Issue a fresh token for `sub` with a new token id.
    pub fn issue(
        &self,
        sub: &str,
        role: &str,
        session_id: Option<String>,
        ttl_secs: u64,
    ) -> Result<(String, Claims), AuthError> {
        let now = crate::epoch_ms() / 1000;
        let claims = Claims {
            sub: sub.to_owned(),
            role: role.to_owned(),
            exp: now + ttl_secs,
            iat: now,
            jti: uuid::Uuid::new_v4().to_string(),
            session_id,
        };
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|_| AuthError::Failed)?;
        Ok((token, claims))
    }
}

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;
