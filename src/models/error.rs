//! Error types for reroll.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad input, bad config)
//! - I^B materialized: Endpoint failures (non-2xx, timeout, unreachable)
//! - K_i violated: Internal invariant violations (bugs)

use std::time::Duration;
use thiserror::Error;

/// Maximum number of response body characters kept in a request error.
pub const ERROR_BODY_LIMIT: usize = 500;

/// Top-level error type for reroll.
#[derive(Debug, Error)]
pub enum RerollError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED - Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED - Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════
    #[error("Request failed (status {status}): {body}")]
    Request { status: u16, body: String },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED - Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RerollError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Build a request error, truncating the response body.
    pub fn request(status: u16, body: &str) -> Self {
        Self::Request {
            status,
            body: body.chars().take(ERROR_BODY_LIMIT).collect(),
        }
    }

    /// Check if an HTTP attempt that failed with this error should be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Network(_) | Self::Unreachable(_) => true,
            Self::Request { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Check if a turn that failed with this error may fall back to the
    /// original assistant message instead of failing the whole record.
    ///
    /// An unreachable endpoint is not recoverable per turn: every following
    /// turn would fail the same way.
    pub fn is_turn_recoverable(&self) -> bool {
        !matches!(self, Self::Unreachable(_) | Self::Internal(_) | Self::Io { .. })
    }
}

/// Result type alias for reroll.
pub type Result<T> = std::result::Result<T, RerollError>;
