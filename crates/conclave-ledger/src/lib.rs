//! # conclave-ledger: the append-only commitment store
//!
//! An ordered transaction log with a Compact Merkle Tree (RFC 6962)
//! commitment over it, plus the per-client idempotent reply cache.
//!
//! # Layout on disk
//!
//! ```text
//! {data_dir}/
//! ├── transactions.log          <- line-delimited JSON records
//! ├── hs_merkleLeaves.bin       <- 32-byte leaf hashes, append-only
//! └── hs_merkleNodes.bin        <- 32-byte internal node hashes, append-only
//! ```
//!
//! # Invariants
//!
//! - Records are append-only; the record stored at index `i` carries
//!   `seq_no = i + 1`.
//! - Every append returns an audit path that verifies against the
//!   post-append root.
//! - A `(client_id, req_id)` pair maps to at most one transaction id and
//!   one reply.

mod error;
mod hash_store;
mod ledger;
mod merkle;
mod transaction_store;

pub use error::{LedgerError, StoreError};
pub use hash_store::{FileHashStore, HashStore, MemoryHashStore};
pub use ledger::{Ledger, MerkleProof, TxnRecord};
pub use merkle::{verify_inclusion, CompactMerkleTree};
pub use transaction_store::TransactionStore;
