//! Ledger error types.

use thiserror::Error;

/// Errors from the ledger, Merkle tree, and hash stores.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hash store corrupt: {0}")]
    Corrupt(String),

    #[error("hash position {pos} out of range ({len} stored)")]
    OutOfRange { pos: u64, len: u64 },

    #[error("record {0} not present in ledger")]
    UnknownSeqNo(u64),

    #[error("malformed ledger record: {0}")]
    MalformedRecord(#[from] serde_json::Error),

    #[error("ledger is stopped")]
    Stopped,
}

/// Errors from the transaction (reply) store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stop timed out waiting for {0} reads to complete")]
    StopTimeout(u64),

    #[error("store is not running")]
    NotRunning,
}
