//! Round-based primary election, one election per protocol instance.
//!
//! Every node nominates deterministically: the candidate for instance
//! `i` in view `v` is the node whose rank is `(v + i) mod N`. Nomination
//! messages still flow so agreement is explicit: a node seeing 2f+1
//! matching nominations declares the candidate with a PRIMARY message,
//! and 2f+1 matching PRIMARY messages decide the election. Split
//! nomination rounds are rerun via REELECTION with a lexicographic
//! tie-break.

use std::collections::{HashMap, HashSet, VecDeque};

use conclave_types::{ranked, InstId, NodeName, ViewNo};

use crate::message::{ElectionMsg, Nomination, Primary, Reelection};
use crate::suspicion::{Suspicion, SuspicionCode};

/// Outputs the elector surfaces through its outbox.
#[derive(Debug, Clone)]
pub enum ElectorOutMsg {
    /// Broadcast this election message to all nodes.
    Send(ElectionMsg),
    /// The election for `(inst_id, view_no)` settled on `name`.
    PrimaryDecided {
        inst_id: InstId,
        view_no: ViewNo,
        name: NodeName,
    },
    /// Misbehavior observed; the node decides on blacklisting.
    Suspicion(Suspicion),
}

/// Election state for one instance in the current view.
#[derive(Debug, Default)]
struct Election {
    round: u32,
    /// Candidate this node nominates in the current round.
    candidate: Option<NodeName>,
    nomination_sent: bool,
    primary_sent: bool,
    decided: Option<NodeName>,
    /// Nomination votes per candidate in the current round.
    nominations: HashMap<NodeName, HashSet<NodeName>>,
    /// Who has nominated in the current round (duplicate detection).
    nominators: HashSet<NodeName>,
    /// PRIMARY declarations per candidate.
    primaries: HashMap<NodeName, HashSet<NodeName>>,
    primary_senders: HashSet<NodeName>,
    /// REELECTION votes per target round.
    reelection_votes: HashMap<u32, HashSet<NodeName>>,
    reelection_sent_for: HashSet<u32>,
}

impl Election {
    fn start_round(&mut self, round: u32, candidate: NodeName) {
        self.round = round;
        self.candidate = Some(candidate);
        self.nomination_sent = false;
        self.primary_sent = false;
        self.nominations.clear();
        self.nominators.clear();
        self.primaries.clear();
        self.primary_senders.clear();
    }
}

/// Upper bound on stashed messages for views not yet entered.
const FUTURE_VIEW_STASH_LIMIT: usize = 256;

/// Deterministically elects one primary per `(instance, view)`.
#[derive(Debug)]
pub struct PrimaryElector {
    node_name: NodeName,
    /// Registry sorted by rank.
    registry: Vec<NodeName>,
    f: usize,
    view_no: ViewNo,
    elections: Vec<Election>,
    /// Everything broadcast in the current view, replayed to lagged peers.
    sent_this_view: Vec<ElectionMsg>,
    /// Messages for views this node has not entered yet; peers may
    /// finish their view change a tick earlier.
    future_view_stash: VecDeque<(ElectionMsg, NodeName)>,

    pub inbox: VecDeque<(ElectionMsg, NodeName)>,
    pub outbox: VecDeque<ElectorOutMsg>,
}

impl PrimaryElector {
    pub fn new(node_name: NodeName, all_nodes: &[NodeName], num_instances: usize) -> Self {
        let registry = ranked(all_nodes);
        let f = conclave_types::max_failures(registry.len());
        let elections = (0..num_instances).map(|_| Election::default()).collect();
        Self {
            node_name,
            registry,
            f,
            view_no: ViewNo::ZERO,
            elections,
            sent_this_view: Vec::new(),
            future_view_stash: VecDeque::new(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
        }
    }

    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    /// The deterministic first-round candidate for an instance: the node
    /// whose rank is `(view + inst) mod N`.
    pub fn expected_primary(&self, inst_id: InstId) -> &NodeName {
        let idx = (self.view_no.as_u64() as usize + inst_id.as_usize()) % self.registry.len();
        &self.registry[idx]
    }

    /// Primary decided for an instance in the current view, if any.
    pub fn decided_primary(&self, inst_id: InstId) -> Option<&NodeName> {
        self.elections
            .get(inst_id.as_usize())
            .and_then(|e| e.decided.as_ref())
    }

    fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    /// Replay material for a peer that connected after the election
    /// messages went out.
    pub fn election_messages_for_lagged(&self) -> Vec<ElectionMsg> {
        self.sent_this_view.clone()
    }

    /// Kick off (or continue) elections for every instance.
    pub fn decide_primaries(&mut self) {
        for idx in 0..self.elections.len() {
            let inst_id = InstId::new(idx as u8);
            if self.elections[idx].decided.is_some() {
                continue;
            }
            if self.elections[idx].candidate.is_none() {
                let candidate = self.expected_primary(inst_id).clone();
                self.elections[idx].start_round(0, candidate);
            }
            self.send_own_nomination(inst_id);
        }
    }

    /// Clears all elections and restarts them for the new view.
    pub fn on_view_change(&mut self, new_view: ViewNo) {
        self.view_no = new_view;
        self.sent_this_view.clear();
        for election in &mut self.elections {
            *election = Election::default();
        }
        // Messages stashed for exactly this view re-enter the inbox
        let stash = std::mem::take(&mut self.future_view_stash);
        for (msg, sender) in stash {
            if msg.view_no() == new_view {
                self.inbox.push_back((msg, sender));
            } else if msg.view_no() > new_view {
                self.future_view_stash.push_back((msg, sender));
            }
        }
        self.decide_primaries();
    }

    /// Drains up to `limit` inbox messages; returns the number processed.
    pub fn service_queues(&mut self, limit: usize) -> usize {
        let mut processed = 0;
        while processed < limit {
            let Some((msg, sender)) = self.inbox.pop_front() else {
                break;
            };
            self.on_election_msg(msg, sender);
            processed += 1;
        }
        processed
    }

    fn on_election_msg(&mut self, msg: ElectionMsg, sender: NodeName) {
        let view = msg.view_no();
        if view < self.view_no {
            tracing::trace!(
                node = %self.node_name,
                our_view = %self.view_no,
                msg_view = %view,
                "discarding election message for a settled view"
            );
            return;
        }
        if view > self.view_no {
            if self.future_view_stash.len() >= FUTURE_VIEW_STASH_LIMIT {
                self.future_view_stash.pop_front();
            }
            self.future_view_stash.push_back((msg, sender));
            return;
        }
        if msg.inst_id().as_usize() >= self.elections.len() {
            tracing::debug!(
                node = %self.node_name,
                inst = %msg.inst_id(),
                "discarding election message for unknown instance"
            );
            return;
        }
        match msg {
            ElectionMsg::Nomination(nom) => self.on_nomination(nom, sender),
            ElectionMsg::Primary(pri) => self.on_primary(pri, sender),
            ElectionMsg::Reelection(rel) => self.on_reelection(rel, sender),
        }
    }

    fn broadcast(&mut self, msg: ElectionMsg) {
        self.sent_this_view.push(msg.clone());
        self.outbox.push_back(ElectorOutMsg::Send(msg));
    }

    fn suspect(&mut self, node: NodeName, code: SuspicionCode) {
        tracing::warn!(node = %self.node_name, suspect = %node, code = %code, "raising suspicion");
        self.outbox
            .push_back(ElectorOutMsg::Suspicion(Suspicion::new(node, code)));
    }

    fn send_own_nomination(&mut self, inst_id: InstId) {
        let election = &mut self.elections[inst_id.as_usize()];
        if election.nomination_sent || election.decided.is_some() {
            return;
        }
        let Some(candidate) = election.candidate.clone() else {
            return;
        };
        election.nomination_sent = true;
        election
            .nominations
            .entry(candidate.clone())
            .or_default()
            .insert(self.node_name.clone());
        election.nominators.insert(self.node_name.clone());
        tracing::debug!(
            node = %self.node_name,
            inst = %inst_id,
            view = %self.view_no,
            candidate = %candidate,
            "nominating"
        );
        let view_no = self.view_no;
        self.broadcast(ElectionMsg::Nomination(Nomination {
            name: candidate,
            inst_id,
            view_no,
        }));
        self.check_nomination_quorum(inst_id);
    }

    fn on_nomination(&mut self, nom: Nomination, sender: NodeName) {
        let election = &mut self.elections[nom.inst_id.as_usize()];
        if !election.nominators.insert(sender.clone()) {
            self.suspect(sender, SuspicionCode::DuplicateNomSent);
            return;
        }
        election
            .nominations
            .entry(nom.name.clone())
            .or_default()
            .insert(sender);
        // A node that has not yet nominated joins the round with its own
        // deterministic choice
        self.send_own_nomination(nom.inst_id);
        self.check_nomination_quorum(nom.inst_id);
        self.check_nomination_tie(nom.inst_id);
    }

    fn check_nomination_quorum(&mut self, inst_id: InstId) {
        let quorum = self.quorum();
        let election = &mut self.elections[inst_id.as_usize()];
        if election.primary_sent || election.decided.is_some() {
            return;
        }
        let winner = election
            .nominations
            .iter()
            .find(|(_, votes)| votes.len() >= quorum)
            .map(|(name, _)| name.clone());
        let Some(name) = winner else {
            return;
        };
        election.primary_sent = true;
        election
            .primaries
            .entry(name.clone())
            .or_default()
            .insert(self.node_name.clone());
        election.primary_senders.insert(self.node_name.clone());
        tracing::debug!(
            node = %self.node_name,
            inst = %inst_id,
            view = %self.view_no,
            primary = %name,
            "declaring primary"
        );
        let view_no = self.view_no;
        self.broadcast(ElectionMsg::Primary(Primary {
            name,
            inst_id,
            view_no,
        }));
        self.check_primary_quorum(inst_id);
    }

    /// A full round with no quorum winner is a split: rerun it among the
    /// top candidates.
    fn check_nomination_tie(&mut self, inst_id: InstId) {
        let n = self.registry.len();
        let quorum = self.quorum();
        let election = &mut self.elections[inst_id.as_usize()];
        if election.decided.is_some() || election.primary_sent {
            return;
        }
        if election.nominators.len() < n {
            return;
        }
        if election
            .nominations
            .values()
            .any(|votes| votes.len() >= quorum)
        {
            return;
        }
        let max_votes = election
            .nominations
            .values()
            .map(HashSet::len)
            .max()
            .unwrap_or(0);
        let mut tie_among: Vec<NodeName> = election
            .nominations
            .iter()
            .filter(|(_, votes)| votes.len() == max_votes)
            .map(|(name, _)| name.clone())
            .collect();
        tie_among.sort();
        let next_round = election.round + 1;
        if !election.reelection_sent_for.insert(next_round) {
            return;
        }
        election
            .reelection_votes
            .entry(next_round)
            .or_default()
            .insert(self.node_name.clone());
        tracing::info!(
            node = %self.node_name,
            inst = %inst_id,
            round = next_round,
            ?tie_among,
            "nomination round split, requesting reelection"
        );
        let view_no = self.view_no;
        self.broadcast(ElectionMsg::Reelection(Reelection {
            inst_id,
            round: next_round,
            tie_among,
            view_no,
        }));
    }

    fn on_primary(&mut self, pri: Primary, sender: NodeName) {
        let election = &mut self.elections[pri.inst_id.as_usize()];
        if !election.primary_senders.insert(sender.clone()) {
            self.suspect(sender, SuspicionCode::DuplicatePriSent);
            return;
        }
        election
            .primaries
            .entry(pri.name.clone())
            .or_default()
            .insert(sender);
        self.check_primary_quorum(pri.inst_id);
    }

    fn check_primary_quorum(&mut self, inst_id: InstId) {
        let quorum = self.quorum();
        let election = &mut self.elections[inst_id.as_usize()];
        if election.decided.is_some() {
            return;
        }
        let winner = election
            .primaries
            .iter()
            .find(|(_, votes)| votes.len() >= quorum)
            .map(|(name, _)| name.clone());
        let Some(name) = winner else {
            return;
        };
        election.decided = Some(name.clone());
        tracing::info!(
            node = %self.node_name,
            inst = %inst_id,
            view = %self.view_no,
            primary = %name,
            "primary elected"
        );
        self.outbox.push_back(ElectorOutMsg::PrimaryDecided {
            inst_id,
            view_no: self.view_no,
            name,
        });
    }

    fn on_reelection(&mut self, rel: Reelection, sender: NodeName) {
        let quorum = self.quorum();
        let election = &mut self.elections[rel.inst_id.as_usize()];
        if election.decided.is_some() || rel.round <= election.round {
            return;
        }
        let votes = election.reelection_votes.entry(rel.round).or_default();
        if !votes.insert(sender.clone()) {
            self.suspect(sender, SuspicionCode::DuplicateRelSent);
            return;
        }

        // Echo our own reelection vote for this round once
        if self.elections[rel.inst_id.as_usize()]
            .reelection_sent_for
            .insert(rel.round)
        {
            self.elections[rel.inst_id.as_usize()]
                .reelection_votes
                .entry(rel.round)
                .or_default()
                .insert(self.node_name.clone());
            self.broadcast(ElectionMsg::Reelection(rel.clone()));
        }

        let election = &mut self.elections[rel.inst_id.as_usize()];
        let votes = election
            .reelection_votes
            .get(&rel.round)
            .map_or(0, HashSet::len);
        if votes >= quorum {
            // Tie-break: lexicographically smallest tied candidate
            let candidate = rel
                .tie_among
                .iter()
                .min()
                .cloned()
                .unwrap_or_else(|| self.expected_primary(rel.inst_id).clone());
            tracing::info!(
                node = %self.node_name,
                inst = %rel.inst_id,
                round = rel.round,
                candidate = %candidate,
                "starting reelection round"
            );
            self.elections[rel.inst_id.as_usize()].start_round(rel.round, candidate);
            self.send_own_nomination(rel.inst_id);
        }
    }
}

#[cfg(test)]
mod tests;
