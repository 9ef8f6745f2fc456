//! Error types for remote API operations.
//!
//! Structured errors carrying the failing operation's context so retry
//! classification and user-facing messages never lose the originating call.

use thiserror::Error;

/// Errors surfaced by the remote API adapter.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Network-level error (DNS resolution, connection refused, TLS, broken
    /// stream, etc.)
    #[error("network error during {context}: {source}")]
    Network {
        /// The operation that failed (e.g. `list children of <id>`).
        context: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout during {context}")]
    Timeout {
        /// The operation that timed out.
        context: String,
    },

    /// HTTP error response from the remote service.
    #[error("HTTP {status} during {context}")]
    HttpStatus {
        /// The operation that returned the error status.
        context: String,
        /// The HTTP status code.
        status: u16,
        /// Service-reported reason (e.g. `userRateLimitExceeded`), if the
        /// error body carried one.
        reason: Option<String>,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
    },

    /// Response body could not be decoded into the expected shape.
    #[error("decode error during {context}: {source}")]
    Decode {
        /// The operation whose response failed to decode.
        context: String,
        /// The underlying decode error.
        #[source]
        source: reqwest::Error,
    },

    /// Authentication is unavailable: token acquisition or refresh failed.
    #[error("authentication failed during {context}: {message}")]
    Auth {
        /// The operation that required authentication.
        context: String,
        /// Collaborator-supplied failure detail.
        message: String,
    },
}

impl ApiError {
    /// Creates a network error.
    pub fn network(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Network {
            context: context.into(),
            source,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(context: impl Into<String>) -> Self {
        Self::Timeout {
            context: context.into(),
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(context: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            context: context.into(),
            status,
            reason: None,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with reason and Retry-After context.
    pub fn http_status_full(
        context: impl Into<String>,
        status: u16,
        reason: Option<String>,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            context: context.into(),
            status,
            reason,
            retry_after,
        }
    }

    /// Creates a decode error.
    pub fn decode(context: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Decode {
            context: context.into(),
            source,
        }
    }

    /// Creates an authentication error.
    pub fn auth(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Auth {
            context: context.into(),
            message: message.into(),
        }
    }

    /// The HTTP status code, when this error carries one.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The Retry-After header value, when this error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<&str> {
        match self {
            Self::HttpStatus { retry_after, .. } => retry_after.as_deref(),
            _ => None,
        }
    }
}
