//! Error types for the sitemap insight pipeline.
//!
//! This module provides structured error handling with:
//! - `AppError`: Domain-specific errors for crawl, insight and job operations
//! - `Result<T>`: Type alias for Results using AppError
//!
//! Budget exhaustion and duplicate batch items are deliberately absent: both are
//! normal outcomes and never travel as errors.

use std::time::Duration;
use thiserror::Error;

// ============================================================================
// DOMAIN ERROR TYPE
// ============================================================================

/// Domain-specific errors for application operations.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid or malformed URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A request did not finish within its per-request timeout
    #[error("Network timeout: {0}")]
    NetworkTimeout(String),

    /// Connection refused, DNS failure, TLS failure...
    #[error("Network connection error: {0}")]
    NetworkConnection(String),

    /// Response body could not be understood
    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    /// Circuit breaker is open; the downstream service was not called
    #[error("Service unavailable ({service}): retry in {}s", retry_in.as_secs())]
    ServiceUnavailable {
        service: &'static str,
        retry_in: Duration,
    },

    /// Downstream call failed while the breaker was closed
    #[error("Downstream failure ({service}): {message}")]
    DownstreamFailure {
        service: &'static str,
        message: String,
    },

    /// Database operation failed
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Job not found
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Generic error with context
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::NetworkTimeout(msg.into())
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::NetworkConnection(msg.into())
    }

    /// Create a downstream failure
    pub fn downstream(service: &'static str, msg: impl Into<String>) -> Self {
        Self::DownstreamFailure {
            service,
            message: msg.into(),
        }
    }

    /// Create a database error
    pub fn database(msg: impl Into<String>) -> Self {
        Self::DatabaseError(msg.into())
    }

    /// True for errors raised by the circuit breaker without calling the service.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, Self::ServiceUnavailable { .. })
    }
}

/// Result type alias using AppError.
pub type Result<T> = std::result::Result<T, AppError>;
