//! The transaction ledger: an ordered record log with a Merkle commitment.
//!
//! Every append serializes the record as one JSON line, feeds the same
//! bytes to the Merkle tree as a leaf, and returns the inclusion proof a
//! client needs to verify the transaction against the root.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use conclave_types::{ClientId, Hash, ReqId, SeqNo, Timestamp, TxnId};
use serde::{Deserialize, Serialize};

use crate::{CompactMerkleTree, HashStore, LedgerError};

/// Filename of the record log.
const RECORDS_FILE: &str = "transactions.log";

/// One ledger record. `seq_no` is assigned by the ledger on append:
/// the record stored at index `i` carries `seq_no = i + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub client_id: ClientId,
    pub req_id: ReqId,
    pub txn_id: TxnId,
    pub txn_time: Timestamp,
    pub txn_type: String,
    pub seq_no: SeqNo,
}

impl TxnRecord {
    /// A record awaiting sequence-number assignment by the ledger.
    pub fn new(
        client_id: ClientId,
        req_id: ReqId,
        txn_id: TxnId,
        txn_time: Timestamp,
        txn_type: String,
    ) -> Self {
        Self {
            client_id,
            req_id,
            txn_id,
            txn_time,
            txn_type,
            seq_no: SeqNo::new(0),
        }
    }
}

/// Proof of inclusion returned by an append, merged into the client reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    pub seq_no: SeqNo,
    pub audit_path: Vec<Hash>,
    pub root_hash: Hash,
}

/// Append-only transaction ledger over a hash store.
#[derive(Debug)]
pub struct Ledger<S: HashStore> {
    tree: CompactMerkleTree<S>,
    records: Vec<TxnRecord>,
    file: Option<File>,
    running: bool,
}

impl<S: HashStore> Ledger<S> {
    /// A fresh, purely in-memory ledger (no record file).
    pub fn ephemeral(store: S) -> Result<Self, LedgerError> {
        Ok(Self {
            tree: CompactMerkleTree::new(store)?,
            records: Vec::new(),
            file: None,
            running: true,
        })
    }

    /// Opens (or creates) the ledger under `data_dir`, replaying the
    /// record log and reconciling it with the hash store.
    pub fn open(data_dir: impl AsRef<Path>, store: S) -> Result<Self, LedgerError> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RECORDS_FILE);

        let mut records = Vec::new();
        let mut lines: Vec<String> = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.is_empty() {
                    continue;
                }
                let record: TxnRecord = serde_json::from_str(&line)?;
                let expected = SeqNo::new(records.len() as u64 + 1);
                if record.seq_no != expected {
                    return Err(LedgerError::Corrupt(format!(
                        "record {} carries seq_no {}",
                        expected, record.seq_no
                    )));
                }
                records.push(record);
                lines.push(line);
            }
        }

        let tree = if store.leaf_count() == 0 && !records.is_empty() {
            // Hash store is fresh (e.g. memory store over an existing
            // log); rebuild the tree from the record lines
            let mut tree = CompactMerkleTree::new(store)?;
            for line in &lines {
                tree.append(line.as_bytes())?;
            }
            tree
        } else {
            CompactMerkleTree::from_store(store)?
        };

        if tree.size() != records.len() as u64 {
            return Err(LedgerError::Corrupt(format!(
                "{} records but {} merkle leaves",
                records.len(),
                tree.size()
            )));
        }

        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        tracing::info!(
            records = records.len(),
            root = %tree.root_hash(),
            "ledger opened"
        );
        Ok(Self {
            tree,
            records,
            file: Some(file),
            running: true,
        })
    }

    /// Appends a record, assigning its sequence number, and returns the
    /// stored record together with its inclusion proof.
    pub fn append(
        &mut self,
        mut record: TxnRecord,
    ) -> Result<(TxnRecord, MerkleProof), LedgerError> {
        if !self.running {
            return Err(LedgerError::Stopped);
        }
        record.seq_no = SeqNo::new(self.records.len() as u64 + 1);
        let line = serde_json::to_string(&record)?;

        let (_, audit_path, root_hash) = self.tree.append(line.as_bytes())?;
        if let Some(file) = &mut self.file {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
            file.flush()?;
        }
        self.records.push(record.clone());

        tracing::debug!(seq_no = %record.seq_no, txn_id = %record.txn_id, "appended txn");
        let proof = MerkleProof {
            seq_no: record.seq_no,
            audit_path,
            root_hash,
        };
        Ok((record, proof))
    }

    /// Record at the given 1-based sequence number.
    pub fn get(&self, seq_no: SeqNo) -> Option<&TxnRecord> {
        let n = seq_no.as_u64();
        if n == 0 {
            return None;
        }
        self.records.get(n as usize - 1)
    }

    /// Audit path for the record at `seq_no` in the current tree.
    pub fn audit_path(&mut self, seq_no: SeqNo) -> Result<Vec<Hash>, LedgerError> {
        let n = seq_no.as_u64();
        if n == 0 || n > self.tree.size() {
            return Err(LedgerError::UnknownSeqNo(n));
        }
        self.tree.audit_path(n - 1)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn root_hash(&self) -> Hash {
        self.tree.root_hash()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Flushes and refuses further appends.
    pub fn stop(&mut self) -> Result<(), LedgerError> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        self.running = false;
        Ok(())
    }

}
