//! The three-phase commit state machine, one per protocol instance.
//!
//! A replica is local to one node and one instance. It consumes forwarded
//! request digests and PRE-PREPARE / PREPARE / COMMIT messages from its
//! inbox and surfaces outgoing protocol messages, `Ordered` events and
//! suspicions through its outbox; the owning node drains both ends on
//! every `prod` tick.
//!
//! # Phase progression per `(view_no, pp_seq_no)`
//!
//! ```text
//! UNPREPPED    --receive/issue PRE-PREPARE-->    PREPREPARED
//! PREPREPARED  --2f matching PREPAREs-->         PREPARED   (emit COMMIT)
//! PREPARED     --2f+1 matching COMMITs-->        COMMITTED  (emit Ordered)
//! ```
//!
//! The primary never sends PREPARE; its PRE-PREPARE counts as its
//! prepare vote. Votes are tallied per digest, so only matching-digest
//! messages progress a sequence number, and only against sequence
//! numbers this replica holds a PRE-PREPARE for — a vote for an unknown
//! slot is fabricated and raises suspicion instead of tallying. A
//! replica issues its own PREPARE only after the request has been
//! forwarded to it and the digest verified, but a full commit quorum
//! (2f+1, which implies a prepared quorum elsewhere) orders the binding
//! even while the request body is still in flight here. Ordered events
//! are emitted in strictly increasing `pp_seq_no`; completions that
//! arrive out of order are parked until their predecessors commit.

use std::collections::{HashMap, HashSet, VecDeque};

use conclave_types::{Digest, InstId, NodeName, PpSeqNo, Timestamp, ViewNo};

use crate::message::{Commit, Ordered, PrePrepare, Prepare, ReqDigest, ThreePcMsg};
use crate::suspicion::{Suspicion, SuspicionCode};

/// Upper bound on stashed messages for views this replica has not yet
/// entered; the oldest are discarded beyond it.
const FUTURE_VIEW_STASH_LIMIT: usize = 64;

/// Upper bound on PRE-PREPAREs parked while the primary is undecided.
const AWAITING_PRIMARY_LIMIT: usize = 256;

/// Inputs a node feeds into a replica's inbox.
#[derive(Debug, Clone)]
pub enum ReplicaInMsg {
    /// A client request that crossed the f+1 PROPAGATE threshold.
    ReqDigest(ReqDigest),
    /// A three-phase message from an instance peer on another node.
    ThreePc(ThreePcMsg, NodeName),
}

/// Outputs a replica surfaces through its outbox.
#[derive(Debug, Clone)]
pub enum ReplicaOutMsg {
    /// Broadcast this message to the instance's peer replicas.
    Send(ThreePcMsg),
    /// A `(pp_seq_no → request)` binding committed, in sequence order.
    Ordered(Ordered),
    /// Misbehavior observed; the node decides on blacklisting.
    Suspicion(Suspicion),
}

type SeqKey = (ViewNo, PpSeqNo);

/// Vote tally for one `(view, seq)` slot, per digest and sender.
#[derive(Debug, Default)]
struct VoteTally {
    by_digest: HashMap<Digest, HashSet<NodeName>>,
    voters: HashSet<NodeName>,
}

impl VoteTally {
    /// Records a vote; returns false if the sender already voted on
    /// this slot (with any digest).
    fn record(&mut self, digest: Digest, voter: NodeName) -> bool {
        if !self.voters.insert(voter.clone()) {
            return false;
        }
        self.by_digest.entry(digest).or_default().insert(voter);
        true
    }

    fn count(&self, digest: &Digest) -> usize {
        self.by_digest.get(digest).map_or(0, HashSet::len)
    }
}

/// One protocol instance's state machine on one node.
#[derive(Debug)]
pub struct Replica {
    node_name: NodeName,
    inst_id: InstId,
    is_master: bool,
    f: usize,

    view_no: ViewNo,
    primary_name: Option<NodeName>,

    /// Last sequence number this replica assigned as primary.
    last_assigned: PpSeqNo,
    /// Last sequence number ordered in the current view.
    last_ordered: PpSeqNo,

    /// Requests forwarded by the node, keyed by digest.
    forwarded: HashMap<Digest, ReqDigest>,
    /// Forwarded digests in arrival order.
    arrival: Vec<Digest>,
    /// Forwarded but not yet pre-prepared by us as primary.
    unassigned: VecDeque<Digest>,
    /// Digests whose ordering already completed (any view).
    ordered_digests: HashSet<Digest>,

    /// PRE-PREPAREs this replica issued as primary.
    sent_pre_prepares: HashMap<SeqKey, PrePrepare>,
    /// PRE-PREPAREs accepted from the primary.
    received_pre_prepares: HashMap<SeqKey, PrePrepare>,
    prepare_votes: HashMap<SeqKey, VoteTally>,
    commit_votes: HashMap<SeqKey, VoteTally>,
    /// Slots whose own prepare vote was cast (or stood in for, as
    /// primary).
    prepare_done: HashSet<SeqKey>,
    commit_sent: HashSet<SeqKey>,
    /// Committed but not yet emitted (waiting for predecessors).
    committed: HashMap<PpSeqNo, PrePrepare>,

    /// Messages for views we have not entered yet.
    future_view_stash: VecDeque<(ThreePcMsg, NodeName)>,
    /// PRE-PREPAREs parked until the election settles.
    awaiting_primary: Vec<(PrePrepare, NodeName)>,
    /// Accepted slots whose own PREPARE waits for the request body.
    awaiting_request: Vec<SeqKey>,

    pub inbox: VecDeque<ReplicaInMsg>,
    pub outbox: VecDeque<ReplicaOutMsg>,
}

impl Replica {
    pub fn new(node_name: NodeName, inst_id: InstId, n: usize) -> Self {
        Self {
            node_name,
            inst_id,
            is_master: inst_id.is_master(),
            f: conclave_types::max_failures(n),
            view_no: ViewNo::ZERO,
            primary_name: None,
            last_assigned: PpSeqNo::ZERO,
            last_ordered: PpSeqNo::ZERO,
            forwarded: HashMap::new(),
            arrival: Vec::new(),
            unassigned: VecDeque::new(),
            ordered_digests: HashSet::new(),
            sent_pre_prepares: HashMap::new(),
            received_pre_prepares: HashMap::new(),
            prepare_votes: HashMap::new(),
            commit_votes: HashMap::new(),
            prepare_done: HashSet::new(),
            commit_sent: HashSet::new(),
            committed: HashMap::new(),
            future_view_stash: VecDeque::new(),
            awaiting_primary: Vec::new(),
            awaiting_request: Vec::new(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn inst_id(&self) -> InstId {
        self.inst_id
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    pub fn primary_name(&self) -> Option<&NodeName> {
        self.primary_name.as_ref()
    }

    pub fn is_primary(&self) -> bool {
        self.primary_name.as_ref() == Some(&self.node_name)
    }

    pub fn last_ordered(&self) -> PpSeqNo {
        self.last_ordered
    }

    /// Quorum of prepare votes: `2f` (the primary's PRE-PREPARE stands
    /// in for its PREPARE).
    fn prepare_quorum(&self) -> usize {
        2 * self.f
    }

    /// Quorum of commit votes: `2f + 1`.
    fn commit_quorum(&self) -> usize {
        2 * self.f + 1
    }

    // ========================================================================
    // Queue Servicing
    // ========================================================================

    /// Drains up to `limit` inbox messages; `now` stamps any PRE-PREPARE
    /// this replica issues as primary. Returns the number processed.
    pub fn service_queues(&mut self, limit: usize, now: Timestamp) -> usize {
        let mut processed = 0;
        while processed < limit {
            let Some(msg) = self.inbox.pop_front() else {
                break;
            };
            match msg {
                ReplicaInMsg::ReqDigest(rd) => self.on_req_digest(rd),
                ReplicaInMsg::ThreePc(msg, sender) => self.on_three_pc(msg, sender),
            }
            processed += 1;
        }
        if self.is_primary() {
            self.propose_pending(now);
        }
        processed
    }

    /// The elector decided the primary for this instance and view.
    pub fn set_primary(&mut self, name: NodeName) {
        tracing::debug!(
            node = %self.node_name,
            inst = %self.inst_id,
            view = %self.view_no,
            primary = %name,
            "primary decided"
        );
        self.primary_name = Some(name);
        let parked = std::mem::take(&mut self.awaiting_primary);
        for (pp, sender) in parked {
            self.on_pre_prepare(pp, sender);
        }
    }

    /// Resets all per-view state for the new view. The forwarded-request
    /// buffer survives so the new primary can re-propose whatever was
    /// never ordered.
    pub fn on_view_change(&mut self, new_view: ViewNo) {
        debug_assert!(new_view > self.view_no);
        self.view_no = new_view;
        self.primary_name = None;
        self.last_assigned = PpSeqNo::ZERO;
        self.last_ordered = PpSeqNo::ZERO;
        self.sent_pre_prepares.clear();
        self.received_pre_prepares.clear();
        self.prepare_votes.clear();
        self.commit_votes.clear();
        self.prepare_done.clear();
        self.commit_sent.clear();
        self.committed.clear();
        self.awaiting_primary.clear();
        self.awaiting_request.clear();

        self.unassigned = self
            .arrival
            .iter()
            .filter(|d| !self.ordered_digests.contains(*d))
            .copied()
            .collect();

        // Messages stashed for exactly this view re-enter the inbox;
        // older ones are dead
        let stash = std::mem::take(&mut self.future_view_stash);
        for (msg, sender) in stash {
            if msg.view_no() == new_view {
                self.inbox.push_back(ReplicaInMsg::ThreePc(msg, sender));
            } else if msg.view_no() > new_view {
                self.future_view_stash.push_back((msg, sender));
            }
        }
    }

    // ========================================================================
    // Forwarded Requests
    // ========================================================================

    fn on_req_digest(&mut self, rd: ReqDigest) {
        let digest = rd.digest;
        if self.forwarded.contains_key(&digest) {
            return;
        }
        self.forwarded.insert(digest, rd);
        self.arrival.push(digest);
        if !self.ordered_digests.contains(&digest) {
            self.unassigned.push_back(digest);
        }
        // Slots that were only waiting for this request can prepare now
        let parked = std::mem::take(&mut self.awaiting_request);
        for key in parked {
            self.maybe_send_prepare(key);
        }
    }

    /// As primary, assign the next sequence numbers to every forwarded
    /// request not yet proposed, in arrival order.
    fn propose_pending(&mut self, now: Timestamp) {
        while let Some(digest) = self.unassigned.pop_front() {
            if self.ordered_digests.contains(&digest) {
                continue;
            }
            let Some(rd) = self.forwarded.get(&digest) else {
                continue;
            };
            let pp_seq_no = self.last_assigned.next();
            self.last_assigned = pp_seq_no;
            let pre_prepare = PrePrepare {
                inst_id: self.inst_id,
                view_no: self.view_no,
                pp_seq_no,
                client_id: rd.client_id.clone(),
                req_id: rd.req_id,
                digest,
                pp_time: now,
            };
            tracing::debug!(
                node = %self.node_name,
                inst = %self.inst_id,
                view = %self.view_no,
                seq = %pp_seq_no,
                digest = %digest,
                "issuing PRE-PREPARE"
            );
            let key = (self.view_no, pp_seq_no);
            self.sent_pre_prepares.insert(key, pre_prepare.clone());
            // The primary's PRE-PREPARE is its prepare vote
            self.prepare_votes
                .entry(key)
                .or_default()
                .record(digest, self.node_name.clone());
            self.prepare_done.insert(key);
            self.outbox
                .push_back(ReplicaOutMsg::Send(ThreePcMsg::PrePrepare(pre_prepare)));
            self.try_commit_phase(key);
        }
    }

    // ========================================================================
    // Three-Phase Handlers
    // ========================================================================

    fn on_three_pc(&mut self, msg: ThreePcMsg, sender: NodeName) {
        let view = msg.view_no();
        if view < self.view_no {
            tracing::trace!(
                node = %self.node_name,
                inst = %self.inst_id,
                msg = ?msg,
                "discarding stale-view message"
            );
            return;
        }
        if view > self.view_no {
            if self.future_view_stash.len() >= FUTURE_VIEW_STASH_LIMIT {
                let dropped = self.future_view_stash.pop_front();
                tracing::warn!(
                    node = %self.node_name,
                    inst = %self.inst_id,
                    dropped = ?dropped,
                    "future-view stash full, dropping oldest"
                );
            }
            self.future_view_stash.push_back((msg, sender));
            return;
        }
        match msg {
            ThreePcMsg::PrePrepare(pp) => self.on_pre_prepare(pp, sender),
            ThreePcMsg::Prepare(p) => self.on_prepare(p, sender),
            ThreePcMsg::Commit(c) => self.on_commit(c, sender),
        }
    }

    fn suspect(&mut self, node: NodeName, code: SuspicionCode) {
        tracing::warn!(
            node = %self.node_name,
            inst = %self.inst_id,
            suspect = %node,
            code = %code,
            "raising suspicion"
        );
        self.outbox
            .push_back(ReplicaOutMsg::Suspicion(Suspicion::new(node, code)));
    }

    fn on_pre_prepare(&mut self, pp: PrePrepare, sender: NodeName) {
        if self.ordered_digests.contains(&pp.digest) {
            // Already ordered here, possibly in an earlier view
            tracing::trace!(
                node = %self.node_name,
                inst = %self.inst_id,
                seq = %pp.pp_seq_no,
                "ignoring PRE-PREPARE for already ordered request"
            );
            return;
        }
        if self.is_primary() {
            self.suspect(sender, SuspicionCode::PprToPrimary);
            return;
        }
        let Some(primary) = self.primary_name.clone() else {
            // Primary still undecided; park until the election settles
            if self.awaiting_primary.len() < AWAITING_PRIMARY_LIMIT {
                self.awaiting_primary.push((pp, sender));
            }
            return;
        };
        if sender != primary {
            self.suspect(sender, SuspicionCode::PprFromNonPrimary);
            return;
        }

        let key = (pp.view_no, pp.pp_seq_no);
        if let Some(existing) = self.received_pre_prepares.get(&key) {
            if existing.digest != pp.digest {
                self.suspect(sender, SuspicionCode::DuplicatePprSent);
            }
            return;
        }

        tracing::debug!(
            node = %self.node_name,
            inst = %self.inst_id,
            view = %pp.view_no,
            seq = %pp.pp_seq_no,
            "accepted PRE-PREPARE"
        );
        let digest = pp.digest;
        self.received_pre_prepares.insert(key, pp);
        // The primary's PRE-PREPARE counts as its PREPARE
        self.prepare_votes
            .entry(key)
            .or_default()
            .record(digest, primary);
        self.maybe_send_prepare(key);
        // A commit quorum may already be waiting on this binding
        self.try_order_phase(key);
    }

    /// Issues our own PREPARE for an accepted slot once the request has
    /// been forwarded and the digest verified.
    fn maybe_send_prepare(&mut self, key: SeqKey) {
        if self.prepare_done.contains(&key) {
            return;
        }
        let Some(pp) = self.received_pre_prepares.get(&key) else {
            return;
        };
        let (digest, client_id, req_id) = (pp.digest, pp.client_id.clone(), pp.req_id);
        match self.forwarded.get(&digest) {
            None => {
                // Request still in flight; our PREPARE waits for it
                if !self.awaiting_request.contains(&key) {
                    self.awaiting_request.push(key);
                }
                return;
            }
            Some(rd) => {
                if rd.client_id != client_id || rd.req_id != req_id {
                    // The PRE-PREPARE names a request that does not own
                    // this digest; the binding is bogus and must not
                    // reach ordering
                    tracing::warn!(
                        node = %self.node_name,
                        inst = %self.inst_id,
                        seq = %key.1,
                        digest = %digest,
                        "discarding PRE-PREPARE whose request does not match its digest"
                    );
                    self.received_pre_prepares.remove(&key);
                    return;
                }
            }
        }

        self.prepare_done.insert(key);
        self.prepare_votes
            .entry(key)
            .or_default()
            .record(digest, self.node_name.clone());
        let prepare = Prepare {
            inst_id: self.inst_id,
            view_no: key.0,
            pp_seq_no: key.1,
            digest,
        };
        self.outbox
            .push_back(ReplicaOutMsg::Send(ThreePcMsg::Prepare(prepare)));
        self.try_commit_phase(key);
    }

    fn on_prepare(&mut self, prepare: Prepare, sender: NodeName) {
        if self.primary_name.as_ref() == Some(&sender) {
            self.suspect(sender, SuspicionCode::PrFromPrimary);
            return;
        }
        let key = (prepare.view_no, prepare.pp_seq_no);
        // Votes only tally against a sequence number this replica has a
        // PRE-PREPARE for; anything else is fabricated
        if self.local_digest(key).is_none() {
            self.suspect(sender, SuspicionCode::UnknownPrSent);
            return;
        }
        let fresh = self
            .prepare_votes
            .entry(key)
            .or_default()
            .record(prepare.digest, sender.clone());
        if !fresh {
            self.suspect(sender, SuspicionCode::DuplicatePrSent);
            return;
        }
        self.try_commit_phase(key);
    }

    fn on_commit(&mut self, commit: Commit, sender: NodeName) {
        let key = (commit.view_no, commit.pp_seq_no);
        if self.local_digest(key).is_none() {
            self.suspect(sender, SuspicionCode::UnknownCmSent);
            return;
        }
        let fresh = self
            .commit_votes
            .entry(key)
            .or_default()
            .record(commit.digest, sender.clone());
        if !fresh {
            self.suspect(sender, SuspicionCode::DuplicateCmSent);
            return;
        }
        self.try_order_phase(key);
    }

    /// Moves `(view, seq)` to PREPARED and emits COMMIT once our own
    /// prepare vote is cast and the digest has `2f` matching votes.
    fn try_commit_phase(&mut self, key: SeqKey) {
        if self.commit_sent.contains(&key) || !self.prepare_done.contains(&key) {
            return;
        }
        let Some(digest) = self.local_digest(key) else {
            return;
        };
        let votes = self
            .prepare_votes
            .get(&key)
            .map_or(0, |tally| tally.count(&digest));
        if votes < self.prepare_quorum() {
            return;
        }

        tracing::debug!(
            node = %self.node_name,
            inst = %self.inst_id,
            view = %key.0,
            seq = %key.1,
            "prepared, issuing COMMIT"
        );
        self.commit_sent.insert(key);
        let commit = Commit {
            inst_id: self.inst_id,
            view_no: key.0,
            pp_seq_no: key.1,
            digest,
        };
        self.commit_votes
            .entry(key)
            .or_default()
            .record(digest, self.node_name.clone());
        self.outbox
            .push_back(ReplicaOutMsg::Send(ThreePcMsg::Commit(commit)));
        self.try_order_phase(key);
    }

    /// Moves `(view, seq)` to COMMITTED once the locally held binding
    /// has `2f+1` matching commit votes (which implies a prepared quorum
    /// across the instance), then emits every Ordered next in sequence.
    fn try_order_phase(&mut self, key: SeqKey) {
        if self.committed.contains_key(&key.1) || key.1 <= self.last_ordered {
            return;
        }
        let Some(digest) = self.local_digest(key) else {
            return;
        };
        let votes = self
            .commit_votes
            .get(&key)
            .map_or(0, |tally| tally.count(&digest));
        if votes < self.commit_quorum() {
            return;
        }

        let pre_prepare = self
            .sent_pre_prepares
            .get(&key)
            .or_else(|| self.received_pre_prepares.get(&key))
            .cloned()
            .expect("committed slot must hold a pre-prepare");
        self.committed.insert(key.1, pre_prepare);
        self.emit_ordered();
    }

    /// Emits Ordered events strictly in `pp_seq_no` order.
    fn emit_ordered(&mut self) {
        loop {
            let next = self.last_ordered.next();
            let Some(pp) = self.committed.remove(&next) else {
                break;
            };
            self.last_ordered = next;
            self.ordered_digests.insert(pp.digest);
            self.unassigned.retain(|d| *d != pp.digest);
            tracing::debug!(
                node = %self.node_name,
                inst = %self.inst_id,
                view = %pp.view_no,
                seq = %next,
                "ordered"
            );
            self.outbox.push_back(ReplicaOutMsg::Ordered(Ordered {
                inst_id: self.inst_id,
                view_no: pp.view_no,
                client_id: pp.client_id,
                req_id: pp.req_id,
                digest: pp.digest,
                pp_time: pp.pp_time,
            }));
        }
    }

    /// The digest this replica holds for `(view, seq)`, from its own or
    /// the primary's PRE-PREPARE.
    fn local_digest(&self, key: SeqKey) -> Option<Digest> {
        self.sent_pre_prepares
            .get(&key)
            .or_else(|| self.received_pre_prepares.get(&key))
            .map(|pp| pp.digest)
    }
}
