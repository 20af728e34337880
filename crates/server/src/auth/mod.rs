// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authentication and session management: token verification, blacklist,
//! rate limiting, per-user session caps, and in-band rotation.

pub mod blacklist;
pub mod permission;
pub mod rate_limit;
pub mod session;
pub mod token;

use crate::config::ServerConfig;
use crate::error::ErrorCode;

use blacklist::Blacklist;
use rate_limit::RateLimiter;
use session::SessionManager;
use token::{AuthError, Claims, TokenKeys};

/// Aggregated auth services, constructor-injected into the transport layer.
pub struct AuthService {
    pub keys: TokenKeys,
    pub blacklist: Blacklist,
    pub rate_limiter: RateLimiter,
    pub sessions: SessionManager,
    rotation_threshold_secs: u64,
    token_ttl_secs: u64,
}

impl AuthService {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            keys: TokenKeys::new(config.auth_secret.as_bytes()),
            blacklist: Blacklist::new(),
            rate_limiter: RateLimiter::new(
                config.rate_limit_max,
                config.rate_limit_window_ms,
                config.rate_limit_block_ms,
            ),
            sessions: SessionManager::new(config.max_sessions_per_user),
            rotation_threshold_secs: config.rotation_threshold_secs,
            token_ttl_secs: config.token_ttl_secs,
        }
    }

    /// Verify a bearer token: signature and expiry first, then blacklist.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.keys.verify(token)?;
        if self.blacklist.contains(&claims.jti) {
            return Err(AuthError::Blacklisted);
        }
        Ok(claims)
    }

    /// If the verified token is close to expiry, issue a replacement for the
    /// same subject. Returns `(token, expires_at_secs)`.
    pub fn maybe_rotate(&self, claims: &Claims) -> Option<(String, u64)> {
        let now = crate::epoch_ms() / 1000;
        if claims.exp.saturating_sub(now) >= self.rotation_threshold_secs {
            return None;
        }
        self.keys
            .issue(&claims.sub, &claims.role, claims.session_id.clone(), self.token_ttl_secs)
            .ok()
            .map(|(token, rotated)| (token, rotated.exp))
    }
}

impl AuthError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Failed => ErrorCode::AuthFailed,
            Self::Expired => ErrorCode::TokenExpired,
            Self::Blacklisted => ErrorCode::TokenBlacklisted,
        }
    }
}
