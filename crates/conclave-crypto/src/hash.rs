//! SHA-256 hashing primitives.
//!
//! All hashing in Conclave goes through this module: plain digests,
//! the domain-separated leaf/node hashes of the compact Merkle tree
//! (RFC 6962), canonical request digests, and transaction ids.

use conclave_types::{ClientId, Hash, ReqId, TxnId};
use serde::Serialize;
use sha2::{Digest as _, Sha256};

/// Domain separator for Merkle tree leaves.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separator for internal Merkle tree nodes.
const NODE_PREFIX: u8 = 0x01;

/// SHA-256 of `data`.
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash::from_bytes(hasher.finalize().into())
}

/// Leaf hash of the compact Merkle tree: `SHA-256(0x00 || data)`.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    Hash::from_bytes(hasher.finalize().into())
}

/// Internal node hash: `SHA-256(0x01 || left || right)`.
pub fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    Hash::from_bytes(hasher.finalize().into())
}

/// Canonical bytes of a signable value.
///
/// `postcard` gives a deterministic, compact serialization, so a digest
/// computed on one node matches the digest computed on every other.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    postcard::to_allocvec(value).expect("canonical serialization cannot fail")
}

/// Digest over a request's canonical serialization.
pub fn request_digest_bytes<T: Serialize>(signable: &T) -> Hash {
    sha256(&canonical_bytes(signable))
}

/// Transaction id: `SHA-256(client_id || req_id)` over the decimal
/// rendering of the request number, matching the reply format clients
/// verify against.
pub fn txn_id(client_id: &ClientId, req_id: ReqId) -> TxnId {
    let preimage = format!("{}{}", client_id.as_str(), req_id.as_u64());
    let mut hasher = Sha256::new();
    hasher.update(preimage.as_bytes());
    TxnId::from_bytes(hasher.finalize().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_deterministic() {
        assert_eq!(sha256(b"conclave"), sha256(b"conclave"));
        assert_ne!(sha256(b"conclave"), sha256(b"enclave"));
    }

    #[test]
    fn leaf_and_node_domains_are_separated() {
        // A leaf over (l || r) must differ from the node over l, r
        let l = sha256(b"left");
        let r = sha256(b"right");
        let mut joined = Vec::new();
        joined.extend_from_slice(l.as_bytes());
        joined.extend_from_slice(r.as_bytes());
        assert_ne!(leaf_hash(&joined), node_hash(&l, &r));
    }

    #[test]
    fn rfc6962_empty_leaf_vector() {
        // RFC 6962 test vector: SHA-256(0x00) for the empty leaf
        let expected = "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d";
        assert_eq!(leaf_hash(b"").to_hex(), expected);
    }

    #[test]
    fn txn_id_matches_known_value() {
        // SHA-256("Alice1") — the id every node must derive for Alice's
        // first request
        let id = txn_id(&ClientId::from("Alice"), ReqId::new(1));
        assert_eq!(
            id.to_hex(),
            "9d328d8b7ac56e1f71ce94ed3c7975d63c8b6f1a54d5186de8881cf27dd8b3a9"
        );
        // Deterministic
        assert_eq!(id, txn_id(&ClientId::from("Alice"), ReqId::new(1)));
        assert_ne!(id, txn_id(&ClientId::from("Alice"), ReqId::new(2)));
    }

    #[test]
    fn canonical_bytes_are_stable() {
        #[derive(serde::Serialize)]
        struct Signable<'a> {
            client: &'a str,
            req_id: u64,
        }
        let a = canonical_bytes(&Signable { client: "Alice", req_id: 1 });
        let b = canonical_bytes(&Signable { client: "Alice", req_id: 1 });
        assert_eq!(a, b);
    }
}
