use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for tspace operations.
///
/// Structured variants for the common cases; free-form `detail` strings only
/// where the failure is genuinely open-ended (corruption reports, internal
/// invariant breaks).
#[derive(Error, Debug)]
pub enum TspaceError {
    // === Transaction errors ===
    /// The requested transaction id is not in the live map.
    #[error("unknown transaction: {txn}")]
    UnknownTransaction { txn: String },

    /// A status change that the transaction state machine forbids.
    #[error("illegal transaction status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// An operation was added to a transaction that is no longer ACTIVE.
    #[error("transaction {txn} is sealed (status {status})")]
    TransactionSealed { txn: String, status: String },

    /// The manager is shutting down and refuses new work.
    #[error("transaction manager is shut down")]
    ManagerShutdown,

    // === Log errors ===
    /// A log segment failed validation (bad magic, version, or header).
    #[error("log segment corrupt: {detail}")]
    LogCorrupt { detail: String },

    /// A snapshot file could not be decoded.
    #[error("snapshot corrupt: '{path}': {detail}")]
    SnapshotCorrupt { path: PathBuf, detail: String },

    /// Command replay failed during startup recovery. Fatal.
    #[error("recovery failed: {detail}")]
    RecoveryFailed { detail: String },

    /// Serialization or deserialization of a durable record failed.
    #[error("codec error: {detail}")]
    Codec { detail: String },

    // === Storage errors ===
    /// Physical store rejected an operation for an entry.
    #[error("storage failure for entry {bucket}:{slot}: {detail}")]
    Storage {
        bucket: u32,
        slot: u64,
        detail: String,
    },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Internal ===
    /// Invariant violation that should never happen.
    #[error("internal error: {detail}")]
    Internal { detail: String },
}

impl TspaceError {
    /// Shorthand for an internal invariant violation.
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::Internal {
            detail: detail.into(),
        }
    }

    /// Shorthand for a codec failure (wraps serde errors at call sites).
    #[must_use]
    pub fn codec(detail: impl std::fmt::Display) -> Self {
        Self::Codec {
            detail: detail.to_string(),
        }
    }
}

/// Convenience alias used across all tspace crates.
pub type Result<T, E = TspaceError> = std::result::Result<T, E>;
