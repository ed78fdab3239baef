//! Error types for rehydra

use thiserror::Error;

/// Main error type for rehydra
#[derive(Error, Debug)]
pub enum PersistError {
    // ============ Configuration Errors ============
    #[error("key is required in persist config")]
    MissingKey,

    #[error("storage is required in persist config")]
    MissingStorage,

    #[error("Configuration error: {0}")]
    Config(String),

    // ============ Storage Errors ============
    #[error("Storage error: {0}")]
    Storage(String),

    // ============ Codec Errors ============
    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    // ============ Pipeline Errors ============
    #[error("Transform failed for key `{key}`: {reason}")]
    Transform { key: String, reason: String },

    #[error("No transform functions provided for {0}")]
    EmptyTransform(String),

    #[error("Migration to version {version} failed: {reason}")]
    Migration { version: i64, reason: String },

    // ============ Lifecycle Errors ============
    #[error("persist timed out for persist key \"{0}\"")]
    Timeout(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PersistError {
    /// True for errors raised while validating configuration
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            PersistError::MissingKey | PersistError::MissingStorage | PersistError::Config(_)
        )
    }
}

impl From<std::io::Error> for PersistError {
    fn from(err: std::io::Error) -> Self {
        PersistError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for PersistError {
    fn from(err: serde_json::Error) -> Self {
        PersistError::Serialization(err.to_string())
    }
}

/// Result type for rehydra operations
pub type PersistResult<T> = Result<T, PersistError>;
