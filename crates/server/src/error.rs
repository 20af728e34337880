// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error codes surfaced to clients in `ERROR` envelopes and REST responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    AuthFailed,
    TokenExpired,
    TokenBlacklisted,
    PermissionDenied,
    ValidationFailed,
    RateLimit,
    ResourceExhausted,
    AgentNotFound,
    CommandNotFound,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthFailed => "AUTH_FAILED",
            Self::TokenExpired => "TOKEN_EXPIRED",
            Self::TokenBlacklisted => "TOKEN_BLACKLISTED",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::RateLimit => "RATE_LIMIT",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::AgentNotFound => "AGENT_NOT_FOUND",
            Self::CommandNotFound => "COMMAND_NOT_FOUND",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may retry on the same connection.
    pub fn recoverable(&self) -> bool {
        match self {
            Self::AuthFailed
            | Self::TokenExpired
            | Self::TokenBlacklisted
            | Self::PermissionDenied
            | Self::Internal => false,
            Self::ValidationFailed
            | Self::RateLimit
            | Self::ResourceExhausted
            | Self::AgentNotFound
            | Self::CommandNotFound => true,
        }
    }

    /// WebSocket close code used when this error terminates the connection.
    /// `None` means the connection stays open.
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Self::AuthFailed
            | Self::TokenExpired
            | Self::TokenBlacklisted
            | Self::PermissionDenied => Some(close::POLICY),
            Self::Internal => Some(close::INTERNAL),
            _ => None,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            Self::AuthFailed | Self::TokenExpired | Self::TokenBlacklisted => 401,
            Self::PermissionDenied => 403,
            Self::ValidationFailed => 400,
            Self::RateLimit => 429,
            Self::ResourceExhausted => 429,
            Self::AgentNotFound | Self::CommandNotFound => 404,
            Self::Internal => 500,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// WebSocket close codes used by the control plane.
pub mod close {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Protocol error.
    pub const PROTOCOL: u16 = 1002;
    /// Policy violation: auth failure, missing init.
    pub const POLICY: u16 = 1008;
    /// Internal server error.
    pub const INTERNAL: u16 = 1011;
}

/// Top-level error response envelope for REST endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Error body with machine-readable code and human-readable message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

impl ErrorCode {
    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody {
            code: self.as_str().to_owned(),
            message: message.into(),
            recoverable: self.recoverable(),
            original_message_id: None,
        }
    }

    pub fn to_http_response(
        &self,
        message: impl Into<String>,
    ) -> (axum::http::StatusCode, axum::Json<ErrorResponse>) {
        let status = axum::http::StatusCode::from_u16(self.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        let body = ErrorResponse { error: self.to_error_body(message) };
        (status, axum::Json(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_close_with_policy_code() {
        assert_eq!(ErrorCode::AuthFailed.close_code(), Some(1008));
        assert_eq!(ErrorCode::TokenExpired.close_code(), Some(1008));
        assert_eq!(ErrorCode::Internal.close_code(), Some(1011));
        assert_eq!(ErrorCode::ValidationFailed.close_code(), None);
    }

    #[test]
    fn recoverability_follows_taxonomy() {
        assert!(!ErrorCode::AuthFailed.recoverable());
        assert!(!ErrorCode::Internal.recoverable());
        assert!(ErrorCode::ValidationFailed.recoverable());
        assert!(ErrorCode::RateLimit.recoverable());
        assert!(ErrorCode::ResourceExhausted.recoverable());
    }
}
