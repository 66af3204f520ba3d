//! Scheduled node actions.
//!
//! All timers flow through this queue so that the `prod` tick remains
//! the only mutator of node state: performance checks, ordered retries,
//! the key-sharing window and election kickoff are entries with a due
//! time, drained by `service_due`.

use conclave_consensus::Ordered;
use conclave_types::Timestamp;

/// One deferred piece of node work.
#[derive(Debug, Clone)]
pub enum NodeAction {
    /// Periodic master-performance check; re-arms itself.
    CheckPerformance,
    /// Retry executing an Ordered whose request body has not arrived.
    RetryOrdered { ordered: Ordered, attempt: u32 },
    /// Close the key-sharing window.
    StopKeySharing,
    /// Ask the elector to start elections.
    DecidePrimaries,
}

/// A queue of actions keyed by due time.
#[derive(Debug, Default)]
pub struct ActionQueue {
    entries: Vec<(Timestamp, u64, NodeAction)>,
    next_seq: u64,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, action: NodeAction, due: Timestamp) {
        self.entries.push((due, self.next_seq, action));
        self.next_seq += 1;
    }

    /// Removes and returns every action due at `now`, in schedule order.
    pub fn service_due(&mut self, now: Timestamp) -> Vec<NodeAction> {
        let mut due: Vec<(Timestamp, u64, NodeAction)> = Vec::new();
        let mut remaining = Vec::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if entry.0 <= now {
                due.push(entry);
            } else {
                remaining.push(entry);
            }
        }
        self.entries = remaining;
        due.sort_by_key(|(at, seq, _)| (*at, *seq));
        due.into_iter().map(|(_, _, action)| action).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> Timestamp {
        Timestamp::from_nanos(secs * 1_000_000_000)
    }

    #[test]
    fn only_due_actions_fire() {
        let mut queue = ActionQueue::new();
        queue.schedule(NodeAction::CheckPerformance, at(10));
        queue.schedule(NodeAction::StopKeySharing, at(20));

        assert!(queue.service_due(at(5)).is_empty());
        let fired = queue.service_due(at(10));
        assert_eq!(fired.len(), 1);
        assert!(matches!(fired[0], NodeAction::CheckPerformance));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn due_actions_fire_in_schedule_order() {
        let mut queue = ActionQueue::new();
        queue.schedule(NodeAction::DecidePrimaries, at(3));
        queue.schedule(NodeAction::CheckPerformance, at(1));
        queue.schedule(NodeAction::StopKeySharing, at(1));

        let fired = queue.service_due(at(5));
        assert!(matches!(fired[0], NodeAction::CheckPerformance));
        assert!(matches!(fired[1], NodeAction::StopKeySharing));
        assert!(matches!(fired[2], NodeAction::DecidePrimaries));
    }

    #[test]
    fn timestamp_addition_matches_schedule_arithmetic() {
        let due = at(10).saturating_add(Duration::from_secs(4));
        assert_eq!(due, at(14));
    }
}
