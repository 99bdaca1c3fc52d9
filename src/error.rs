//! WolfRing Error Types

use thiserror::Error;

/// Result type alias for WolfRing operations
pub type Result<T> = std::result::Result<T, Error>;

/// WolfRing error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Codec errors
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Unknown command tag: {0}")]
    UnknownCommand(u8),

    #[error("Empty packet")]
    EmptyPacket,

    #[error("Command mismatch: expected {expected}, found tag {found}")]
    CommandMismatch { expected: String, found: u8 },

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Failed to bind {address}: {reason}")]
    Bind { address: String, reason: String },

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Cannot resolve local address: {0}")]
    AddressResolution(String),

    #[error("Frame checksum mismatch")]
    ChecksumMismatch,

    // Transfer errors
    #[error("Transfer error: {0}")]
    Transfer(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Lifecycle errors
    #[error("Node already joined the cluster")]
    AlreadyJoined,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Shutdown in progress")]
    ShuttingDown,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is transient and the operation may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::ChecksumMismatch
        )
    }

    /// Check if this error should abort node startup
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Bind { .. } | Error::AddressResolution(_) | Error::Config(_) | Error::ConfigParse(_)
        )
    }
}
