//! Application error model with MCP error mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error handling,
//! classifies upstream failures as retryable or fatal, and maps each variant to
//! the appropriate MCP `ErrorData` type for protocol compliance.

use rmcp::model::ErrorData;
use serde_json::json;
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the mail agent may encounter. Each variant maps
/// to an appropriate MCP error code in [`ErrorData`].
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid user input (validation failed, malformed request)
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Resource not found (mailbox, thread, label, draft)
    #[error("not found: {0}")]
    NotFound(String),
    /// Authentication failure (bad credentials, account disabled)
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    /// No upstream session is established for the agent
    #[error("no upstream session: {0}")]
    NoSession(String),
    /// Upstream asked us to slow down
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Transient upstream failure (connection reset, server busy)
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    /// Operation timeout (TCP connect, TLS handshake, IMAP response)
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Conflict (mailbox UIDVALIDITY changed, state inconsistent)
    #[error("conflict: {0}")]
    Conflict(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Convenience constructor for `InvalidInput`
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Whether the failure is transient and worth another attempt
    ///
    /// Rate limits, transient unavailability and timeouts are retryable.
    /// Auth, not-found, validation and conflicts are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Unavailable(_) | Self::Timeout(_)
        )
    }

    /// Convert to MCP `ErrorData`
    ///
    /// Maps each `AppError` variant to the appropriate MCP error type and
    /// includes a structured `code` field for client error handling.
    ///
    /// # Mappings
    ///
    /// - `InvalidInput` → `invalid_params`
    /// - `NotFound` → `resource_not_found`
    /// - `AuthFailed`, `NoSession`, `Conflict` → `invalid_request`
    /// - `RateLimited`, `Unavailable`, `Timeout`, `Internal` → `internal_error`
    pub fn to_error_data(&self) -> ErrorData {
        match self {
            Self::InvalidInput(msg) => {
                ErrorData::invalid_params(msg.clone(), Some(json!({ "code": "invalid_input" })))
            }
            Self::NotFound(msg) => {
                ErrorData::resource_not_found(msg.clone(), Some(json!({ "code": "not_found" })))
            }
            Self::AuthFailed(msg) => {
                ErrorData::invalid_request(msg.clone(), Some(json!({ "code": "auth_failed" })))
            }
            Self::NoSession(msg) => {
                ErrorData::invalid_request(msg.clone(), Some(json!({ "code": "no_session" })))
            }
            Self::RateLimited(msg) => ErrorData::internal_error(
                msg.clone(),
                Some(json!({ "code": "rate_limited", "retryable": true })),
            ),
            Self::Unavailable(msg) => ErrorData::internal_error(
                msg.clone(),
                Some(json!({ "code": "unavailable", "retryable": true })),
            ),
            Self::Timeout(msg) => ErrorData::internal_error(
                msg.clone(),
                Some(json!({ "code": "timeout", "retryable": true })),
            ),
            Self::Conflict(msg) => {
                ErrorData::invalid_request(msg.clone(), Some(json!({ "code": "conflict" })))
            }
            Self::Internal(msg) => {
                ErrorData::internal_error(msg.clone(), Some(json!({ "code": "internal" })))
            }
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Internal(format!("cache database error: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(format!("serialization failure: {e}"))
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
