//! Store error types
//!
//! Typed failures for the persistence layer, carried inside
//! `anyhow::Error` so callers can downcast when they care which case
//! occurred.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Input rejected before touching the store.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A referenced row is missing or a store-level constraint would be
    /// violated.
    #[error("constraint violated: {0}")]
    Constraint(String),

    #[error("migration to version {version} failed: {message}")]
    Migration { version: i64, message: String },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }
}
