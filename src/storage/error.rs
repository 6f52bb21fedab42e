//! Storage layer error types.

use thiserror::Error;

use crate::storage::page::PageHandle;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database does not exist: {path}")]
    DatabaseDoesNotExist { path: String },

    #[error("Version mismatch in {what}: expected {expected:#x}, found {found:#x}")]
    VersionMismatch {
        what: &'static str,
        expected: u64,
        found: u64,
    },

    #[error("Checksum verification failed for {0}")]
    ChecksumVerificationFailed(String),

    #[error("Corrupted {0}")]
    Corrupted(String),

    #[error("Unexpected end of file at offset {offset}")]
    UnexpectedEndOfFile { offset: u64 },

    #[error("Maximum page count reached: {max}")]
    MaxPageCountReached { max: u32 },

    #[error("Maximum WAL commit number reached")]
    MaxWalCommitNumberReached,

    #[error("Transaction does not exist: {0}")]
    TransactionDoesNotExist(i64),

    #[error("Nested transaction detected on the current thread")]
    NestedTransactionDetected,

    #[error("Transaction scope used from a thread other than the one that began it")]
    TransactionScopeMismatch,

    #[error("Transaction scope already completed")]
    TransactionCompleted,

    #[error("Cannot upgrade a read lock on {target} to a write lock")]
    TransactionUpgradeAttempt { target: u64 },

    #[error("Timed out acquiring lock on {target}")]
    LockTimeout { target: u64 },

    #[error("Invalid page type at {handle}: found marker {marker}")]
    InvalidPageType { handle: PageHandle, marker: u8 },

    #[error("Key too large: {len} bytes")]
    KeyTooLarge { len: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
