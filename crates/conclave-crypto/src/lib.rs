//! # conclave-crypto: digests and signatures for Conclave
//!
//! Two small surfaces:
//! - [`hash`]: SHA-256 digests, the RFC 6962 leaf/node hashing used by the
//!   ledger's Merkle tree, request digests and transaction ids.
//! - [`sign`]: Ed25519 signing/verifying wrappers used by the client
//!   authenticator.

pub mod hash;
pub mod sign;

pub use hash::{leaf_hash, node_hash, request_digest_bytes, sha256, txn_id};
pub use sign::{SignError, Signature, SigningKey, VerifyingKey};
