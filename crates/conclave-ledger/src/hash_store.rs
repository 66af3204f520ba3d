//! Hash store backends for the Merkle tree.
//!
//! A hash store keeps two append-only sequences of 32-byte hashes: one
//! for leaves, one for internal nodes. Backends are polymorphic behind
//! the [`HashStore`] trait: an in-memory store for tests and ephemeral
//! nodes, and a file-backed store with two fixed-width record files.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use conclave_types::{Hash, HASH_LENGTH};

use crate::LedgerError;

/// Filename of the leaf-hash file.
const LEAF_FILE: &str = "hs_merkleLeaves.bin";

/// Filename of the node-hash file.
const NODE_FILE: &str = "hs_merkleNodes.bin";

/// Append-only storage for Merkle leaf and node hashes.
///
/// Indices are 0-based append order. Implementations must persist writes
/// in order; the single-writer assumption of the node process makes
/// interior synchronization unnecessary.
pub trait HashStore {
    fn write_leaf(&mut self, hash: Hash) -> Result<(), LedgerError>;

    fn write_node(&mut self, hash: Hash) -> Result<(), LedgerError>;

    fn read_leaf(&mut self, index: u64) -> Result<Hash, LedgerError>;

    fn read_node(&mut self, index: u64) -> Result<Hash, LedgerError>;

    fn leaf_count(&self) -> u64;

    fn node_count(&self) -> u64;
}

impl<S: HashStore + ?Sized> HashStore for Box<S> {
    fn write_leaf(&mut self, hash: Hash) -> Result<(), LedgerError> {
        (**self).write_leaf(hash)
    }

    fn write_node(&mut self, hash: Hash) -> Result<(), LedgerError> {
        (**self).write_node(hash)
    }

    fn read_leaf(&mut self, index: u64) -> Result<Hash, LedgerError> {
        (**self).read_leaf(index)
    }

    fn read_node(&mut self, index: u64) -> Result<Hash, LedgerError> {
        (**self).read_node(index)
    }

    fn leaf_count(&self) -> u64 {
        (**self).leaf_count()
    }

    fn node_count(&self) -> u64 {
        (**self).node_count()
    }
}

impl<S: HashStore + ?Sized> HashStore for &mut S {
    fn write_leaf(&mut self, hash: Hash) -> Result<(), LedgerError> {
        (**self).write_leaf(hash)
    }

    fn write_node(&mut self, hash: Hash) -> Result<(), LedgerError> {
        (**self).write_node(hash)
    }

    fn read_leaf(&mut self, index: u64) -> Result<Hash, LedgerError> {
        (**self).read_leaf(index)
    }

    fn read_node(&mut self, index: u64) -> Result<Hash, LedgerError> {
        (**self).read_node(index)
    }

    fn leaf_count(&self) -> u64 {
        (**self).leaf_count()
    }

    fn node_count(&self) -> u64 {
        (**self).node_count()
    }
}

// ============================================================================
// Memory Hash Store
// ============================================================================

/// Ephemeral hash store backed by vectors. Used in tests and for nodes
/// configured with `hash_store.kind = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryHashStore {
    leaves: Vec<Hash>,
    nodes: Vec<Hash>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashStore for MemoryHashStore {
    fn write_leaf(&mut self, hash: Hash) -> Result<(), LedgerError> {
        self.leaves.push(hash);
        Ok(())
    }

    fn write_node(&mut self, hash: Hash) -> Result<(), LedgerError> {
        self.nodes.push(hash);
        Ok(())
    }

    fn read_leaf(&mut self, index: u64) -> Result<Hash, LedgerError> {
        self.leaves
            .get(index as usize)
            .copied()
            .ok_or(LedgerError::OutOfRange {
                pos: index,
                len: self.leaves.len() as u64,
            })
    }

    fn read_node(&mut self, index: u64) -> Result<Hash, LedgerError> {
        self.nodes
            .get(index as usize)
            .copied()
            .ok_or(LedgerError::OutOfRange {
                pos: index,
                len: self.nodes.len() as u64,
            })
    }

    fn leaf_count(&self) -> u64 {
        self.leaves.len() as u64
    }

    fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }
}

// ============================================================================
// File Hash Store
// ============================================================================

/// File-backed hash store: two append-only files of fixed-width 32-byte
/// records, indexed by position.
///
/// Reopening recovers the counts from the file lengths; a length that is
/// not a multiple of the record width means a torn tail and surfaces as
/// [`LedgerError::Corrupt`].
#[derive(Debug)]
pub struct FileHashStore {
    leaf_file: File,
    node_file: File,
    leaf_count: u64,
    node_count: u64,
}

impl FileHashStore {
    /// Opens (or creates) the hash files under `data_dir`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let (leaf_file, leaf_count) = Self::open_one(&dir.join(LEAF_FILE))?;
        let (node_file, node_count) = Self::open_one(&dir.join(NODE_FILE))?;
        Ok(Self {
            leaf_file,
            node_file,
            leaf_count,
            node_count,
        })
    }

    fn open_one(path: &PathBuf) -> Result<(File, u64), LedgerError> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len % HASH_LENGTH as u64 != 0 {
            return Err(LedgerError::Corrupt(format!(
                "{} has a torn tail ({len} bytes)",
                path.display()
            )));
        }
        Ok((file, len / HASH_LENGTH as u64))
    }

    fn write_to(file: &mut File, hash: Hash) -> Result<(), LedgerError> {
        file.write_all(hash.as_bytes())?;
        Ok(())
    }

    fn read_from(file: &mut File, index: u64, len: u64) -> Result<Hash, LedgerError> {
        if index >= len {
            return Err(LedgerError::OutOfRange { pos: index, len });
        }
        let mut buf = [0u8; HASH_LENGTH];
        file.seek(SeekFrom::Start(index * HASH_LENGTH as u64))?;
        file.read_exact(&mut buf)?;
        Ok(Hash::from_bytes(buf))
    }
}

impl HashStore for FileHashStore {
    fn write_leaf(&mut self, hash: Hash) -> Result<(), LedgerError> {
        Self::write_to(&mut self.leaf_file, hash)?;
        self.leaf_count += 1;
        Ok(())
    }

    fn write_node(&mut self, hash: Hash) -> Result<(), LedgerError> {
        Self::write_to(&mut self.node_file, hash)?;
        self.node_count += 1;
        Ok(())
    }

    fn read_leaf(&mut self, index: u64) -> Result<Hash, LedgerError> {
        Self::read_from(&mut self.leaf_file, index, self.leaf_count)
    }

    fn read_node(&mut self, index: u64) -> Result<Hash, LedgerError> {
        Self::read_from(&mut self.node_file, index, self.node_count)
    }

    fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    fn node_count(&self) -> u64 {
        self.node_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_crypto::sha256;

    #[test]
    fn memory_store_round_trip() {
        let mut store = MemoryHashStore::new();
        let a = sha256(b"a");
        let b = sha256(b"b");
        store.write_leaf(a).unwrap();
        store.write_leaf(b).unwrap();
        store.write_node(a).unwrap();

        assert_eq!(store.leaf_count(), 2);
        assert_eq!(store.node_count(), 1);
        assert_eq!(store.read_leaf(0).unwrap(), a);
        assert_eq!(store.read_leaf(1).unwrap(), b);
        assert!(matches!(
            store.read_leaf(2),
            Err(LedgerError::OutOfRange { pos: 2, len: 2 })
        ));
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let hashes: Vec<Hash> = (0u8..5).map(|i| sha256(&[i])).collect();

        {
            let mut store = FileHashStore::open(dir.path()).unwrap();
            for h in &hashes {
                store.write_leaf(*h).unwrap();
            }
            store.write_node(hashes[0]).unwrap();
        }

        let mut store = FileHashStore::open(dir.path()).unwrap();
        assert_eq!(store.leaf_count(), 5);
        assert_eq!(store.node_count(), 1);
        for (i, h) in hashes.iter().enumerate() {
            assert_eq!(store.read_leaf(i as u64).unwrap(), *h);
        }
    }

    #[test]
    fn torn_tail_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileHashStore::open(dir.path()).unwrap();
            store.write_leaf(sha256(b"x")).unwrap();
        }
        // Truncate mid-record
        let path = dir.path().join(LEAF_FILE);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(HASH_LENGTH as u64 - 7).unwrap();

        assert!(matches!(
            FileHashStore::open(dir.path()),
            Err(LedgerError::Corrupt(_))
        ));
    }
}
