//! Error types for Tempo

use thiserror::Error;

/// Result type alias for Tempo operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tempo
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone or speech access was denied; the user must re-authorize
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Assistant connection could not be opened or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed audio payload
    #[error("decode error: {0}")]
    Decode(String),

    /// A single tool call failed to execute
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// Session closed because nobody spoke
    #[error("timed out: {0}")]
    Timeout(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech recognition error
    #[error("recognition error: {0}")]
    Recognition(String),

    /// Speech-to-text error
    #[error("STT error: {0}")]
    Stt(String),

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

    /// WebSocket transport error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl Error {
    /// Whether this error must be surfaced to the user instead of self-healing
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::PermissionDenied(_))
    }
}
