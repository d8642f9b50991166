//! Error types for the Trunchbull core crate.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// Top-level error type for all Trunchbull core operations.
#[derive(Debug, Error)]
pub enum TrunchbullError {
    #[error("not authenticated with {provider}")]
    NotAuthenticated { provider: String },

    #[error("access token for {provider} has expired")]
    AuthExpired { provider: String },

    #[error("rate limited by upstream")]
    RateLimited { retry_after: Option<Duration> },

    #[error("timed out waiting for a {provider} rate limit permit")]
    RateLimitTimeout { provider: String },

    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("malformed response (field `{field}`): {message}")]
    MalformedResponse { field: String, message: String },

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("sync cancelled")]
    Cancelled,
}

/// Coarse classification of [`TrunchbullError`], used for retry decisions and
/// by the HTTP layer to pick a status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotAuthenticated,
    AuthExpired,
    RateLimited,
    RateLimitTimeout,
    UpstreamUnavailable,
    MalformedResponse,
    PersistenceFailure,
    Config,
    NotFound,
    Conflict,
    Cancelled,
    Internal,
}

impl TrunchbullError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotAuthenticated { .. } => ErrorKind::NotAuthenticated,
            Self::AuthExpired { .. } => ErrorKind::AuthExpired,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
            Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
            Self::MalformedResponse { .. } => ErrorKind::MalformedResponse,
            Self::PersistenceFailure(_) | Self::Database(_) | Self::Migration(_) => {
                ErrorKind::PersistenceFailure
            }
            Self::Config(_) => ErrorKind::Config,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) | Self::Serialization(_) | Self::Crypto(_) => ErrorKind::Internal,
        }
    }

    /// Whether the orchestrator should retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimited | ErrorKind::RateLimitTimeout | ErrorKind::UpstreamUnavailable
        )
    }

    /// Backoff hint reported by the upstream (`Retry-After`), if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::UpstreamUnavailable { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn upstream(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub(crate) fn malformed(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for TrunchbullError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::malformed("body", e.to_string())
        } else if e.is_timeout() {
            Self::upstream(format!("request timed out: {e}"))
        } else {
            Self::upstream(e.to_string())
        }
    }
}

/// A convenience Result alias that defaults to [`TrunchbullError`].
pub type Result<T> = std::result::Result<T, TrunchbullError>;
