//! Mimir error types

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Mimir error types
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum MimirError {
    // Startup errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("credentials rejected by {dependency}")]
    Auth { dependency: String },

    // Provider/network errors
    #[error("transient failure: {0}")]
    Transient(String),

    /// Rate limited by the provider.
    ///
    /// `retry_after` is populated when the provider response carries a
    /// `Retry-After` header or an SDK throttling hint; `None` otherwise.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("invalid request: {0}")]
    Client(String),

    #[error("unparseable provider response: {0}")]
    Protocol(String),

    // Deadline errors
    #[error("deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("cancelled by caller")]
    Cancelled,

    // Degradation errors
    #[error("circuit open for {dependency}")]
    DependencyOpen { dependency: String },

    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    // Catalog errors
    #[error("model not found in catalog: {0}")]
    ModelNotFound(String),
}

/// Stable error classification for audit records and programmatic branching.
///
/// Every [`MimirError`] maps onto exactly one kind; callers branch on the
/// kind rather than matching error variants directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Auth,
    Transient,
    RateLimited,
    Client,
    Protocol,
    Timeout,
    Cancelled,
    DependencyOpen,
    BackingStoreUnavailable,
    ResourceExhausted,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Transient => "transient",
            Self::RateLimited => "rate_limited",
            Self::Client => "client",
            Self::Protocol => "protocol",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::DependencyOpen => "dependency_open",
            Self::BackingStoreUnavailable => "backing_store_unavailable",
            Self::ResourceExhausted => "resource_exhausted",
        };
        f.write_str(s)
    }
}

impl MimirError {
    /// The stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Auth { .. } => ErrorKind::Auth,
            Self::Transient(_) => ErrorKind::Transient,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Client(_) | Self::ModelNotFound(_) => ErrorKind::Client,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::DependencyOpen { .. } => ErrorKind::DependencyOpen,
            Self::BackingStoreUnavailable(_) => ErrorKind::BackingStoreUnavailable,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Whether this error is transient and the request may succeed on retry.
    ///
    /// Only `Transient` and `RateLimited` qualify. `Timeout` is excluded:
    /// the retry loop checks the remaining deadline budget separately and a
    /// timed-out request has usually spent it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }

    /// Whether the circuit breaker should count this error as a failure.
    ///
    /// Caller-side errors (`Client`, `Auth`, `Cancelled`) say nothing about
    /// dependency health and are not counted.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            Self::Transient(_)
                | Self::RateLimited { .. }
                | Self::Protocol(_)
                | Self::Timeout { .. }
        )
    }

    /// For `RateLimited` errors, the duration the provider suggests waiting.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for MimirError {
    fn from(err: serde_json::Error) -> Self {
        MimirError::Protocol(err.to_string())
    }
}

impl From<sqlx::Error> for MimirError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                MimirError::ResourceExhausted("relational pool checkout timed out".into())
            }
            other => MimirError::BackingStoreUnavailable(other.to_string()),
        }
    }
}

/// Result type alias for mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_and_rate_limited_retry() {
        assert!(MimirError::Transient("dns".into()).is_transient());
        assert!(MimirError::RateLimited { retry_after: None }.is_transient());
        assert!(!MimirError::Client("bad".into()).is_transient());
        assert!(!MimirError::Protocol("garbage".into()).is_transient());
        assert!(!MimirError::Timeout { elapsed_ms: 100 }.is_transient());
        assert!(
            !MimirError::Auth {
                dependency: "provider".into()
            }
            .is_transient()
        );
    }

    #[test]
    fn breaker_ignores_caller_side_errors() {
        assert!(MimirError::Timeout { elapsed_ms: 1 }.counts_against_breaker());
        assert!(MimirError::Protocol("x".into()).counts_against_breaker());
        assert!(!MimirError::Client("x".into()).counts_against_breaker());
        assert!(!MimirError::Cancelled.counts_against_breaker());
        assert!(
            !MimirError::DependencyOpen {
                dependency: "provider".into()
            }
            .counts_against_breaker()
        );
    }

    #[test]
    fn kind_is_stable_for_model_not_found() {
        // Unknown model ids are a caller mistake, not a dependency failure.
        assert_eq!(
            MimirError::ModelNotFound("m".into()).kind(),
            ErrorKind::Client
        );
    }

    #[test]
    fn retry_after_passthrough() {
        let err = MimirError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(MimirError::Cancelled.retry_after(), None);
    }
}
