//! Registry of INSTANCE_CHANGE votes per proposed view.

use std::collections::{HashMap, HashSet};

use conclave_types::{NodeName, ViewNo};

/// Votes to advance past each proposed view, keyed by view number.
#[derive(Debug, Default)]
pub struct InstanceChanges {
    votes: HashMap<ViewNo, HashSet<NodeName>>,
}

impl InstanceChanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a vote; counted once per voter.
    pub fn add_vote(&mut self, view_no: ViewNo, voter: NodeName) {
        self.votes.entry(view_no).or_default().insert(voter);
    }

    /// Whether any votes exist for the proposed view.
    pub fn has_view(&self, view_no: ViewNo) -> bool {
        self.votes.contains_key(&view_no)
    }

    /// Whether `voter` already voted for the proposed view.
    pub fn has_vote_from(&self, view_no: ViewNo, voter: &NodeName) -> bool {
        self.votes
            .get(&view_no)
            .is_some_and(|set| set.contains(voter))
    }

    pub fn num_votes(&self, view_no: ViewNo) -> usize {
        self.votes.get(&view_no).map_or(0, HashSet::len)
    }

    /// Whether the proposed view reached the `2f + 1` quorum.
    pub fn has_quorum(&self, view_no: ViewNo, f: usize) -> bool {
        self.num_votes(view_no) >= 2 * f + 1
    }

    /// Drops votes for views at or below `view_no`; they can no longer
    /// advance anything.
    pub fn prune_through(&mut self, view_no: ViewNo) {
        self.votes.retain(|v, _| *v > view_no);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::from(s)
    }

    #[test]
    fn votes_are_counted_once_per_voter() {
        let mut changes = InstanceChanges::new();
        let view = ViewNo::new(0);
        changes.add_vote(view, name("Alpha"));
        changes.add_vote(view, name("Alpha"));
        assert_eq!(changes.num_votes(view), 1);
        assert!(changes.has_vote_from(view, &name("Alpha")));
        assert!(!changes.has_vote_from(view, &name("Beta")));
    }

    #[test]
    fn quorum_needs_two_f_plus_one() {
        let mut changes = InstanceChanges::new();
        let view = ViewNo::new(0);
        changes.add_vote(view, name("Alpha"));
        changes.add_vote(view, name("Beta"));
        assert!(!changes.has_quorum(view, 1));
        changes.add_vote(view, name("Gamma"));
        assert!(changes.has_quorum(view, 1));
    }

    #[test]
    fn prune_drops_settled_views() {
        let mut changes = InstanceChanges::new();
        changes.add_vote(ViewNo::new(0), name("Alpha"));
        changes.add_vote(ViewNo::new(2), name("Alpha"));
        changes.prune_through(ViewNo::new(0));
        assert!(!changes.has_view(ViewNo::new(0)));
        assert!(changes.has_view(ViewNo::new(2)));
    }
}
