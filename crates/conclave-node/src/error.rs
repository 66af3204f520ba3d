//! Node error types.
//!
//! Two tiers, mirroring the protocol's error discipline:
//! - [`ValidationError`] covers malformed or unauthorized input. It is
//!   absorbed at the node boundary and converted into a drop, a nack or
//!   a blacklist action; it never escapes `prod`.
//! - [`NodeError`] is the fatal surface: storage corruption, stop
//!   timeouts, programmer errors. These propagate to the operator.

use conclave_ledger::{LedgerError, StoreError};
use thiserror::Error;

/// Recoverable faults in inbound messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("message is missing the op field")]
    MissingNodeOp,

    #[error("unknown node op {0:?}")]
    InvalidNodeOp(String),

    #[error("malformed node message: {0}")]
    InvalidNodeMsg(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid client request: {0}")]
    InvalidClientRequest(String),

    #[error("unknown client op {0:?}")]
    InvalidClientOp(String),

    #[error("client message type {0:?} not allowed")]
    InvalidClientMsgType(String),
}

/// Unrecoverable faults surfaced to the caller of `prod`/`stop`.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("ledger failure: {0}")]
    Ledger(#[from] LedgerError),

    #[error("transaction store failure: {0}")]
    Store(#[from] StoreError),

    #[error("configuration failure: {0}")]
    Config(#[from] crate::config::ConfigError),
}
