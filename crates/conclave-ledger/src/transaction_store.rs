//! Per-client idempotent reply cache.
//!
//! Keeps every executed request's reply, keyed both by transaction id and
//! by `(client_id, req_id)`, so a re-submitted request is answered with
//! the original reply without touching the ledger. The store is generic
//! over the reply type to keep this crate below the protocol layer.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use conclave_types::{ClientId, ReqId, RequestKey, TxnId};

use crate::StoreError;

/// Default patience for `stop` while reads drain.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Reply cache: `txn_id -> reply` plus `(client_id, req_id) -> txn_id`.
///
/// The single `add` is what makes a transaction visible; repeated adds
/// for the same request key are ignored, so the first reply wins and
/// every later read observes it unchanged.
#[derive(Debug)]
pub struct TransactionStore<R> {
    running: bool,
    transactions: HashMap<TxnId, R>,
    processed: HashMap<RequestKey, TxnId>,
    reads_in_flight: Arc<AtomicU64>,
}

/// Tracks one in-flight read; dropping it releases the slot `stop` waits
/// on.
#[derive(Debug)]
pub struct ReadGuard {
    counter: Arc<AtomicU64>,
}

impl Drop for ReadGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<R: Clone> TransactionStore<R> {
    pub fn new() -> Self {
        Self {
            running: true,
            transactions: HashMap::new(),
            processed: HashMap::new(),
            reads_in_flight: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records a reply for `(client_id, req_id)` under `txn_id`.
    ///
    /// Idempotent: a request key already present keeps its original
    /// transaction id and reply.
    pub fn add(&mut self, client_id: ClientId, req_id: ReqId, txn_id: TxnId, reply: R) {
        let key = (client_id, req_id);
        if self.processed.contains_key(&key) {
            return;
        }
        self.processed.insert(key, txn_id);
        self.transactions.insert(txn_id, reply);
    }

    /// Looks up the reply previously recorded for a request, if any.
    pub fn get(&self, client_id: &ClientId, req_id: ReqId) -> Result<Option<R>, StoreError> {
        if !self.running {
            return Err(StoreError::NotRunning);
        }
        let _guard = self.begin_read();
        let key = (client_id.clone(), req_id);
        Ok(self
            .processed
            .get(&key)
            .and_then(|txn_id| self.transactions.get(txn_id))
            .cloned())
    }

    /// Registers an in-flight read; `stop` drains these before closing.
    pub fn begin_read(&self) -> ReadGuard {
        self.reads_in_flight.fetch_add(1, Ordering::SeqCst);
        ReadGuard {
            counter: Arc::clone(&self.reads_in_flight),
        }
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Diagnostic dump of every transaction, ordered by id.
    pub fn all_txns(&self) -> BTreeMap<TxnId, R> {
        self.transactions
            .iter()
            .map(|(id, reply)| (*id, reply.clone()))
            .collect()
    }

    /// Refuses new reads and waits up to `timeout` for in-flight reads
    /// to drain.
    pub fn stop(&mut self, timeout: Duration) -> Result<(), StoreError> {
        self.running = false;
        let start = Instant::now();
        loop {
            let outstanding = self.reads_in_flight.load(Ordering::SeqCst);
            if outstanding == 0 {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(StoreError::StopTimeout(outstanding));
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl<R: Clone> Default for TransactionStore<R> {
    fn default() -> Self {
        Self::new()
    }
}
