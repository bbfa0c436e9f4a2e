//! # Error Kinds
//!
//! Component-local error kinds surfaced by the page store. All fallible
//! operations return `eyre::Result`, which carries context strings on the way
//! up; the kinds below are the matchable core a caller can recover from
//! programmatically via `report.downcast_ref::<StoreError>()`.
//!
//! The kinds divide into four families:
//!
//! - **usage**: caller contract violations (`Disposed`, `OutOfBounds`,
//!   `KeyTooLarge`, `Concurrent`) — surfaced immediately, no recovery.
//! - **consistency**: `ConcurrencyConflict` on an etag mismatch — the write
//!   transaction is rolled back and the store stays usable.
//! - **resource**: `Backing` and `Corrupt` — the transaction rolls back;
//!   header corruption refuses to open the store at all.
//! - **worker-local**: `Cancelled` exits an indexing loop promptly; single
//!   document failures inside a batch are logged and skipped instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage environment is disposed")]
    Disposed,

    #[error("page {page} out of bounds (limit {limit})")]
    OutOfBounds { page: u64, limit: u64 },

    #[error("backing store I/O failure: {0}")]
    Backing(#[from] std::io::Error),

    #[error("store is corrupt: {0}")]
    Corrupt(String),

    #[error("another write transaction is already active")]
    Concurrent,

    #[error("transaction aborted by caller")]
    AbortedByUser,

    #[error("key of {len} bytes exceeds the {max} byte maximum")]
    KeyTooLarge { len: usize, max: usize },

    #[error("key not found")]
    NotFound,

    #[error("etag mismatch: expected {expected:?}, actual {actual:?}")]
    ConcurrencyConflict {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("operation cancelled")]
    Cancelled,
}

/// Extracts the `StoreError` kind from an eyre report, if one is in its chain.
pub fn store_error(report: &eyre::Report) -> Option<&StoreError> {
    report.downcast_ref::<StoreError>()
}
