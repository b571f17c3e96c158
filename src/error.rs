//! Error types for shop_sync

use crate::models::{IncompleteReason, RecordKind};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for shop_sync operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network failure or server-side hiccup (timeout, connect, 5xx); retried
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Marketplace asked us to slow down (HTTP 429); retried after the delay
    #[error("Rate limited by marketplace (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Missing, expired or rejected credentials; never retried
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Non-retryable HTTP error status code
    #[error("HTTP error: {0}")]
    HttpStatus(reqwest::StatusCode),

    /// Failed to parse a JSON body or stored payload
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Remote record is missing a required field or has a bad value
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Cursor handed to sync belongs to a different record kind
    #[error("Cursor for {found} cannot be used to sync {expected}")]
    InvalidCursor {
        expected: RecordKind,
        found: RecordKind,
    },

    /// Another session for this kind is already running
    #[error("Sync already in progress for {0}")]
    SyncInProgress(RecordKind),

    /// Session stopped early; everything up to the returned cursor is committed
    #[error("Sync of {kind} incomplete: {reason}")]
    SyncIncomplete {
        kind: RecordKind,
        reason: IncompleteReason,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A thread panicked while holding the database lock
    #[error("Database lock poisoned")]
    StorePoisoned,

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Create an auth error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    /// Create an invalid record error
    pub fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord(message.into())
    }

    /// Whether the same request may succeed if sent again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::TransientNetwork(_) | Self::RateLimited { .. }
        )
    }

    /// Whether the error ends the sync session without a partial result
    pub fn is_fatal(&self) -> bool {
        !self.is_retryable() && !matches!(self, Self::SyncIncomplete { .. })
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return match status.as_u16() {
                401 | 403 => SyncError::Auth(err.to_string()),
                408 | 500..=599 => SyncError::TransientNetwork(err.to_string()),
                _ => SyncError::HttpStatus(status),
            };
        }
        if err.is_decode() {
            return SyncError::InvalidRecord(err.to_string());
        }
        // timeout, connect, request and body failures are all worth another try
        SyncError::TransientNetwork(err.to_string())
    }
}

/// Result alias for shop_sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
