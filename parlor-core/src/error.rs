//! Error taxonomy for store operations.
//!
//! `Configuration` indicates a programming or setup mistake and is not meant
//! to be recovered from. The other variants are recoverable and map onto
//! wire-level responses at the request boundary.

use thiserror::Error;

/// All errors a store operation can raise synchronously.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Unknown slice, duplicate slice name, or other setup mistake.
    #[error("store configuration error: {0}")]
    Configuration(String),

    /// The addressed entity does not exist.
    #[error("entity '{id}' not found in slice '{slice}'")]
    NotFound { slice: String, id: String },

    /// A schema hook rejected an entity. Carries a human-readable reason.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An id or unique field is already in use.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn not_found(slice: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            slice: slice.into(),
            id: id.into(),
        }
    }
}

/// Convenience alias for store results.
pub type Result<T> = std::result::Result<T, StoreError>;
