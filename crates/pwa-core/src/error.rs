//! Error types for pwa-engine

use thiserror::Error;

/// pwa-engine error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Malformed model structure, detected while the model is being built or locked
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Violation of the cache contract (a logic error in the caller or evaluator)
    #[error("Cache contract violation: {0}")]
    CacheContract(String),

    /// Invalid caller input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),
}

impl Error {
    /// `true` for errors that indicate a programming-contract violation.
    pub fn is_contract_violation(&self) -> bool {
        matches!(self, Error::CacheContract(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
