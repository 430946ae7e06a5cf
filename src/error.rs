//! Error types for the Courier relay

use thiserror::Error;

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Courier relay
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient store or network failure; retryable with backoff
    #[error("transport error: {0}")]
    Transport(String),

    /// Store rejected the call due to quota or rate limiting
    #[error("rate limited by store")]
    RateLimited {
        /// Server-suggested wait before retrying, if provided
        retry_after: Option<std::time::Duration>,
    },

    /// Optimistic-concurrency conflict; re-read and retry
    #[error("record conflict: {0}")]
    Conflict(String),

    /// A wait budget or execution budget was exceeded
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed tool invocation (unknown tool, missing or ill-typed argument)
    #[error("validation failed: {0}")]
    Validation(String),

    /// Disallowed tool invocation (sanitization or denylist rejection)
    #[error("security rejection: {0}")]
    Security(String),

    /// Tool ran but failed (nonzero exit, non-2xx status)
    #[error("execution failed: {0}")]
    Execution(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Pairing or signature verification error
    #[error("auth error: {0}")]
    Auth(String),

    /// Payload encryption/decryption error
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl Error {
    /// Whether this error is worth retrying with backoff.
    ///
    /// Covers transient transport failures, rate limiting, and
    /// optimistic-concurrency conflicts. Everything else is terminal
    /// for the operation that produced it.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::Conflict(_)
        )
    }
}
