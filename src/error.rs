//! Error types for the object store and tracking session.

use crate::types::{ObjectId, ObjectKey, PropertyKind, TypeTag};
use thiserror::Error;

/// Main error type for store and session operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Instance already attached: {0}")]
    AlreadyAttached(ObjectId),

    #[error("Instance not attached: {0}")]
    NotAttached(ObjectId),

    #[error("Transaction already running")]
    TransactionAlreadyRunning,

    #[error("No transaction running")]
    NoTransaction,

    #[error("No item of type {type_name} found for id {id}")]
    NotFound { type_name: String, id: ObjectId },

    #[error("Unknown type: {0}")]
    UnknownType(String),

    #[error("Unknown type tag: {0}")]
    UnknownTag(TypeTag),

    #[error("Unknown property {property} on {type_name}")]
    UnknownProperty {
        type_name: &'static str,
        property: String,
    },

    #[error("Property {property} is {actual}, not {expected}")]
    InvalidDescriptorUse {
        property: &'static str,
        expected: PropertyKind,
        actual: PropertyKind,
    },

    #[error("Value mismatch: expected {expected}, got {found}")]
    ValueMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Index {index} out of bounds for {property} (len={len})")]
    IndexOutOfBounds {
        property: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Instance already cached: {0}")]
    DuplicateInstance(ObjectId),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Record key mismatch: file holds {found}, expected {expected}")]
    KeyMismatch { expected: ObjectKey, found: ObjectKey },

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
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
