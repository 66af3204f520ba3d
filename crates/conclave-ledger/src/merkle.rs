//! Append-only Compact Merkle Tree (RFC 6962).
//!
//! Leaves are hashed with the `0x00` domain prefix, internal nodes with
//! `0x01`. The tree keeps only the *frontier* (roots of the complete
//! subtrees making up the current size) in memory; every leaf and every
//! internal node produced by an append is persisted to the backing
//! [`HashStore`], and the frontier is rebuilt from the leaves on reopen.

use conclave_crypto::{leaf_hash, node_hash};
use conclave_types::Hash;

use crate::{HashStore, LedgerError};

/// Append-only Merkle tree over a hash store.
#[derive(Debug)]
pub struct CompactMerkleTree<S: HashStore> {
    store: S,
    size: u64,
    /// Frontier of complete-subtree roots, indexed by level: entry `i`
    /// is present iff bit `i` of `size` is set.
    frontier: Vec<Option<Hash>>,
}

impl<S: HashStore> CompactMerkleTree<S> {
    /// Creates an empty tree over a fresh store.
    ///
    /// Returns an error if the store already holds leaves; use
    /// [`CompactMerkleTree::from_store`] to reopen.
    pub fn new(store: S) -> Result<Self, LedgerError> {
        if store.leaf_count() != 0 {
            return Err(LedgerError::Corrupt(
                "store is not empty; reopen with from_store".into(),
            ));
        }
        Ok(Self {
            store,
            size: 0,
            frontier: Vec::new(),
        })
    }

    /// Reopens a tree from a store, rebuilding the frontier from the
    /// persisted leaves.
    pub fn from_store(mut store: S) -> Result<Self, LedgerError> {
        let size = store.leaf_count();
        let levels = 64 - size.leading_zeros() as usize;
        let mut frontier: Vec<Option<Hash>> = vec![None; levels];
        let mut offset = 0u64;
        for level in (0..levels).rev() {
            let width = 1u64 << level;
            if size & width != 0 {
                frontier[level] = Some(subtree_hash(&mut store, offset, offset + width)?);
                offset += width;
            }
        }
        Ok(Self {
            store,
            size,
            frontier,
        })
    }

    /// Number of leaves in the tree.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Root over the current leaves; the all-zero hash for an empty tree.
    pub fn root_hash(&self) -> Hash {
        let mut acc: Option<Hash> = None;
        for entry in &self.frontier {
            if let Some(left) = entry {
                acc = Some(match acc {
                    None => *left,
                    Some(right) => node_hash(left, &right),
                });
            }
        }
        acc.unwrap_or(Hash::EMPTY)
    }

    /// Appends a leaf, returning its index, the audit path from the new
    /// leaf to the post-append root, and the new root.
    pub fn append(&mut self, data: &[u8]) -> Result<(u64, Vec<Hash>, Hash), LedgerError> {
        let leaf = leaf_hash(data);
        self.store.write_leaf(leaf)?;
        let index = self.size;

        let mut path = Vec::new();
        let mut carry = leaf;
        let mut level = 0;
        loop {
            if level == self.frontier.len() {
                self.frontier.push(None);
            }
            match self.frontier[level].take() {
                Some(left) => {
                    path.push(left);
                    carry = node_hash(&left, &carry);
                    self.store.write_node(carry)?;
                    level += 1;
                }
                None => {
                    self.frontier[level] = Some(carry);
                    break;
                }
            }
        }
        // Complete subtrees above the merge point are left siblings on
        // the path to the root
        for entry in &self.frontier[level + 1..] {
            if let Some(h) = entry {
                path.push(*h);
            }
        }

        self.size += 1;
        Ok((index, path, self.root_hash()))
    }

    /// Audit path for leaf `index` in the current tree.
    pub fn audit_path(&mut self, index: u64) -> Result<Vec<Hash>, LedgerError> {
        if index >= self.size {
            return Err(LedgerError::OutOfRange {
                pos: index,
                len: self.size,
            });
        }
        let mut path = Vec::new();
        collect_path(&mut self.store, index, 0, self.size, &mut path)?;
        Ok(path)
    }
}

/// Hash of the subtree over leaves `[lo, hi)`, recomputed from stored
/// leaf hashes (RFC 6962 `MTH`).
fn subtree_hash<S: HashStore>(store: &mut S, lo: u64, hi: u64) -> Result<Hash, LedgerError> {
    debug_assert!(lo < hi);
    if hi - lo == 1 {
        return store.read_leaf(lo);
    }
    let k = largest_power_of_two_below(hi - lo);
    let left = subtree_hash(store, lo, lo + k)?;
    let right = subtree_hash(store, lo + k, hi)?;
    Ok(node_hash(&left, &right))
}

/// Collects the audit path of leaf `index` within `[lo, hi)`, leaf first.
fn collect_path<S: HashStore>(
    store: &mut S,
    index: u64,
    lo: u64,
    hi: u64,
    path: &mut Vec<Hash>,
) -> Result<(), LedgerError> {
    if hi - lo == 1 {
        return Ok(());
    }
    let k = largest_power_of_two_below(hi - lo);
    if index < lo + k {
        collect_path(store, index, lo, lo + k, path)?;
        path.push(subtree_hash(store, lo + k, hi)?);
    } else {
        collect_path(store, index, lo + k, hi, path)?;
        path.push(subtree_hash(store, lo, lo + k)?);
    }
    Ok(())
}

/// Largest power of two strictly less than `n` (for `n >= 2`).
fn largest_power_of_two_below(n: u64) -> u64 {
    debug_assert!(n >= 2);
    let mut k = 1;
    while k * 2 < n {
        k *= 2;
    }
    k
}

/// Verifies an inclusion proof (RFC 9162 algorithm): that `leaf_data`
/// is the leaf at `index` of the tree of `size` leaves with root `root`.
pub fn verify_inclusion(
    leaf_data: &[u8],
    index: u64,
    path: &[Hash],
    root: &Hash,
    size: u64,
) -> bool {
    if index >= size {
        return false;
    }
    let mut fnode = index;
    let mut snode = size - 1;
    let mut acc = leaf_hash(leaf_data);
    for sibling in path {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            acc = node_hash(sibling, &acc);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            acc = node_hash(&acc, sibling);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && acc == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryHashStore;

    fn leaves(n: u64) -> Vec<Vec<u8>> {
        (0..n).map(|i| format!("leaf-{i}").into_bytes()).collect()
    }

    /// Reference MTH: recursive top-down, independent of the frontier
    /// algorithm under test.
    fn reference_root(data: &[Vec<u8>]) -> Hash {
        match data.len() {
            0 => Hash::EMPTY,
            1 => leaf_hash(&data[0]),
            n => {
                let k = largest_power_of_two_below(n as u64) as usize;
                let left = reference_root(&data[..k]);
                let right = reference_root(&data[k..]);
                node_hash(&left, &right)
            }
        }
    }

    #[test]
    fn single_empty_leaf_matches_rfc_vector() {
        let mut tree = CompactMerkleTree::new(MemoryHashStore::new()).unwrap();
        let (_, path, root) = tree.append(b"").unwrap();
        assert!(path.is_empty());
        assert_eq!(
            root.to_hex(),
            "6e340b9cffb37a989ca544e6bb780a2c78901d3fb33738768511a30617afa01d"
        );
    }

    #[test]
    fn incremental_roots_match_reference() {
        let data = leaves(8);
        let mut tree = CompactMerkleTree::new(MemoryHashStore::new()).unwrap();
        for (i, leaf) in data.iter().enumerate() {
            let (index, _, root) = tree.append(leaf).unwrap();
            assert_eq!(index, i as u64);
            assert_eq!(root, reference_root(&data[..=i]), "size {}", i + 1);
        }
    }

    #[test]
    fn append_path_verifies_against_new_root() {
        let data = leaves(9);
        let mut tree = CompactMerkleTree::new(MemoryHashStore::new()).unwrap();
        for (i, leaf) in data.iter().enumerate() {
            let (index, path, root) = tree.append(leaf).unwrap();
            assert!(
                verify_inclusion(leaf, index, &path, &root, i as u64 + 1),
                "append path for leaf {i} must verify"
            );
        }
    }

    #[test]
    fn audit_path_for_seventh_of_ten() {
        let data = leaves(10);
        let mut tree = CompactMerkleTree::new(MemoryHashStore::new()).unwrap();
        let mut root = Hash::EMPTY;
        for leaf in &data {
            root = tree.append(leaf).unwrap().2;
        }
        // Leaf index 6 is the seventh record
        let path = tree.audit_path(6).unwrap();
        assert!(verify_inclusion(&data[6], 6, &path, &root, 10));
        // A different leaf must not verify with this path
        assert!(!verify_inclusion(&data[7], 6, &path, &root, 10));
    }

    #[test]
    fn reopen_from_store_restores_root() {
        let data = leaves(11);
        let mut store = MemoryHashStore::new();
        let mut expected = Hash::EMPTY;
        {
            let mut tree = CompactMerkleTree::new(&mut store).unwrap();
            for leaf in &data {
                expected = tree.append(leaf).unwrap().2;
            }
        }
        let tree = CompactMerkleTree::from_store(store).unwrap();
        assert_eq!(tree.size(), 11);
        assert_eq!(tree.root_hash(), expected);
    }

    #[test]
    fn wrong_index_fails_verification() {
        let data = leaves(4);
        let mut tree = CompactMerkleTree::new(MemoryHashStore::new()).unwrap();
        let mut root = Hash::EMPTY;
        for leaf in &data {
            root = tree.append(leaf).unwrap().2;
        }
        let path = tree.audit_path(2).unwrap();
        assert!(verify_inclusion(&data[2], 2, &path, &root, 4));
        assert!(!verify_inclusion(&data[2], 1, &path, &root, 4));
        assert!(!verify_inclusion(&data[2], 2, &path, &root, 5));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::MemoryHashStore;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Every leaf of a random-sized tree has a verifying audit path.
        #[test]
        fn prop_all_audit_paths_verify(n in 1u64..48) {
            let data: Vec<Vec<u8>> =
                (0..n).map(|i| format!("entry-{i}").into_bytes()).collect();
            let mut tree = CompactMerkleTree::new(MemoryHashStore::new()).unwrap();
            let mut root = Hash::EMPTY;
            for leaf in &data {
                root = tree.append(leaf).unwrap().2;
            }
            for (i, leaf) in data.iter().enumerate() {
                let path = tree.audit_path(i as u64).unwrap();
                prop_assert!(verify_inclusion(leaf, i as u64, &path, &root, n));
            }
        }
    }
}
