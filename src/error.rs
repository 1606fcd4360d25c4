//! Error types for the fluidfeatures client.
//!
//! Callers only ever see [`Error::InvalidArgument`], [`Error::TransactionEnded`]
//! and the configuration variants. Transport, protocol and persistence failures
//! are absorbed by the background loops, which log them and back off.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A feature, version or goal name was empty or otherwise malformed.
    #[error("{0} invalid")]
    InvalidArgument(&'static str),

    /// The transaction was already handed to the reporter.
    #[error("transaction ended")]
    TransactionEnded,

    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to read config file {path}: {source}")]
    ConfigFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    /// The remote authority answered with a non-success status.
    #[error("request to {path} returned {status}{}", .message.as_deref().map(|m| format!(": {}", m)).unwrap_or_default())]
    Status {
        path: String,
        status: u16,
        message: Option<String>,
    },

    /// The response body was missing or not shaped as expected.
    #[error("unexpected response from {path}: {reason}")]
    Protocol { path: String, reason: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] sled::Error),

    /// The bucket store has reached its configured size on disk.
    #[error("bucket store is full ({stored} bytes stored, limit {limit})")]
    StoreFull { stored: u64, limit: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
