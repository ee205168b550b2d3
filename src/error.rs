//! Error types for the skipchain core

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),
    #[error("Invalid block: {0}")]
    InvalidBlock(String),
    #[error("Hash mismatch for block {0}")]
    HashMismatch(String),
    #[error("Missing ancestor at level {level}: {id}")]
    MissingAncestor { level: usize, id: String },
    #[error("Broken forward link at level {level}: {reason}")]
    BrokenLink { level: usize, reason: String },
    #[error("Bad signature on forward link at level {level}: {reason}")]
    BadSignature { level: usize, reason: String },
    #[error("Forward link slot {level} of block {id} is already occupied")]
    ForwardLinkOccupied { level: usize, id: String },
    #[error("Cryptographic error: {0}")]
    CryptoError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Bincode error: {0}")]
    BincodeError(String),
    #[error("Config error: {0}")]
    ConfigError(String),
    #[error("Service is closed")]
    ServiceClosed,
}

impl From<std::io::Error> for ChainError {
    fn from(err: std::io::Error) -> Self {
        ChainError::IoError(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for ChainError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        ChainError::BincodeError(err.to_string())
    }
}

impl From<rusqlite::Error> for ChainError {
    fn from(err: rusqlite::Error) -> Self {
        ChainError::DatabaseError(err.to_string())
    }
}

impl From<toml::de::Error> for ChainError {
    fn from(err: toml::de::Error) -> Self {
        ChainError::ConfigError(err.to_string())
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, ChainError>;
