//! Error types for ledger operations

use crate::{DecisionId, DecisionStatus, EntityKind};
use thiserror::Error;

/// Storage substrate errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Transient storage failure during {operation}: {reason}")]
    Transient { operation: String, reason: String },

    #[error("Storage call {operation} timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Condition failed for item {partition_key}/{sort_key}: {reason}")]
    ConditionFailed {
        partition_key: String,
        sort_key: String,
        reason: String,
    },

    #[error("Write batch touches {key} more than once")]
    DuplicateBatchKey { key: String },

    #[error("Storage backend error: {reason}")]
    Backend { reason: String },

    #[error("Serialization failed for {what}: {reason}")]
    Serialization { what: String, reason: String },

    #[error("Corrupt key in {location}")]
    CorruptKey { location: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Transient { .. } | StorageError::Timeout { .. }
        )
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Field {field} is too long: {actual} > {max}")]
    TooLong {
        field: String,
        max: usize,
        actual: usize,
    },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Credential store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Secret {name} is not present in {source_name}")]
    Missing { name: String, source_name: String },

    #[error("Secret {name} still holds its provisioning placeholder")]
    Placeholder { name: String },

    #[error("Secret document is malformed: {reason}")]
    Malformed { reason: String },
}

/// Master error type for all ledger operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("Conflicting write on {kind} {id}: {reason}")]
    Conflict {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    #[error("Decision {decision_id} cannot move from {from} to {to}")]
    InvalidTransition {
        decision_id: DecisionId,
        from: DecisionStatus,
        to: DecisionStatus,
    },

    #[error("Invalid state for {kind} {id}: {reason}")]
    InvalidState {
        kind: EntityKind,
        id: String,
        reason: String,
    },

    #[error("Invalid identifier for {field} {value:?}: {reason}")]
    InvalidIdentifier {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Could not allocate a unique {kind} id after {attempts} attempts")]
    DuplicateId { kind: EntityKind, attempts: u32 },

    #[error("Storage unavailable for {operation} after {attempts} attempts: {last_error}")]
    Unavailable {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl LedgerError {
    /// Whether this error is a transient substrate failure that a retry loop may absorb.
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(e) if e.is_transient())
    }

    /// Whether this error reports an optimistic concurrency loss.
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Result type for all ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
