//! Error types for conversation memory

use thiserror::Error;

/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in conversation memory
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid token limit, target ratio, or other configuration value
    #[error("configuration error: {0}")]
    Config(String),

    /// Backing store unavailable or operation failed
    #[error("database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Summarizer failed or timed out
    ///
    /// Never escapes the summarization engine; it is converted into the
    /// truncation fallback there.
    #[error("summarizer unavailable: {0}")]
    Summarizer(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Caller supplied an unusable argument
    #[error("invalid input: {0}")]
    InvalidInput(String),

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
}
