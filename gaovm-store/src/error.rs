//! Error types for the store crate.

use crate::config::ConfigError;

/// Errors produced by the persistence layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum StoreError {
    /// A configuration value failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
