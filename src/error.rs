//! Error types for the object store layer.

use crate::types::EntityId;
use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing schema, bad encryption key, invalid size policy.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Stored schema version differs and migration was not permitted.
    #[error("Migration required: stored schema version {stored}, requested {requested}")]
    Migration { stored: u64, requested: u64 },

    #[error("Transaction error: {0}")]
    Transaction(String),

    /// A raw change notification could not be classified.
    #[error("Subscription decode error: {0}")]
    SubscriptionDecode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Store is closed")]
    Closed,

    #[error("Entity type not in schema: {0}")]
    UnknownEntityType(String),

    #[error("Object not found: {entity_type}/{id}")]
    ObjectNotFound { entity_type: String, id: EntityId },

    #[error("Object is managed by a different store instance")]
    ForeignObject,

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl StoreError {
    /// True for errors raised while validating a configuration or schema.
    pub fn is_configuration(&self) -> bool {
        matches!(self, StoreError::Configuration(_))
    }

    /// True when the stored schema version blocks opening.
    pub fn is_migration(&self) -> bool {
        matches!(self, StoreError::Migration { .. })
    }

    /// True for failures raised inside a write transaction.
    pub fn is_transaction(&self) -> bool {
        matches!(
            self,
            StoreError::Transaction(_)
                | StoreError::UnknownEntityType(_)
                | StoreError::ObjectNotFound { .. }
                | StoreError::ForeignObject
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
