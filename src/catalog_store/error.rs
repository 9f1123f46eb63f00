//! Error types for catalog reads and mutations.

use super::models::EntityType;
use thiserror::Error;
use uuid::Uuid;

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

/// Errors surfaced synchronously to callers of the catalog.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// A required field is missing or malformed, or a filter/page is invalid.
    /// Nothing was written.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: Uuid },

    /// The entity changed since the caller read it; re-fetch and retry.
    #[error("{entity_type} {id} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        entity_type: EntityType,
        id: Uuid,
        expected: u64,
        actual: u64,
    },

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl CatalogError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CatalogError::Validation(msg.into())
    }

    pub fn not_found(entity_type: EntityType, id: Uuid) -> Self {
        CatalogError::NotFound { entity_type, id }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, CatalogError::Validation(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, CatalogError::Conflict { .. })
    }
}
