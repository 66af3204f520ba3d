//! The Requests registry: per-request PROPAGATE state.
//!
//! A request enters the registry on first observation (directly from the
//! client or inside a PROPAGATE) and leaves after the master's Ordered
//! has been executed and the reply persisted. The forward decision is
//! deliberately strict: *exactly* `f + 1` distinct PROPAGATE senders
//! trigger it. That is safe only because `add_propagate` is idempotent
//! per sender and the `forwarded` flag gates re-entry — the two
//! properties must be preserved together.

use std::collections::{HashMap, HashSet};

use conclave_consensus::Request;
use conclave_types::{NodeName, RequestKey};

/// Per-request state: the body, its PROPAGATE witnesses, and whether it
/// was already handed to the replicas.
#[derive(Debug)]
pub struct ReqState {
    pub request: Request,
    pub forwarded: bool,
    pub propagates: HashSet<NodeName>,
}

impl ReqState {
    fn new(request: Request) -> Self {
        Self {
            request,
            forwarded: false,
            propagates: HashSet::new(),
        }
    }
}

/// Registry of every in-flight request, keyed by `(client_id, req_id)`.
#[derive(Debug, Default)]
pub struct Requests {
    map: HashMap<RequestKey, ReqState>,
}

impl Requests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a request if unseen; returns its state either way.
    pub fn add(&mut self, request: &Request) -> &mut ReqState {
        self.map
            .entry(request.key())
            .or_insert_with(|| ReqState::new(request.clone()))
    }

    /// Records `sender` as a PROPAGATE witness for the request.
    pub fn add_propagate(&mut self, request: &Request, sender: NodeName) {
        self.add(request).propagates.insert(sender);
    }

    /// Number of distinct PROPAGATE witnesses for the request.
    pub fn votes(&self, key: &RequestKey) -> usize {
        self.map.get(key).map_or(0, |s| s.propagates.len())
    }

    /// True iff exactly `required_votes` witnesses exist and the request
    /// has not been forwarded. An overshoot means it was already
    /// forwarded at the threshold.
    pub fn can_forward(&self, request: &Request, required_votes: usize) -> bool {
        let key = request.key();
        self.votes(&key) == required_votes
            && self.map.get(&key).is_some_and(|s| !s.forwarded)
    }

    pub fn flag_as_forwarded(&mut self, request: &Request) {
        if let Some(state) = self.map.get_mut(&request.key()) {
            state.forwarded = true;
        }
    }

    pub fn has_propagated(&self, request: &Request, sender: &NodeName) -> bool {
        self.map
            .get(&request.key())
            .is_some_and(|s| s.propagates.contains(sender))
    }

    pub fn get(&self, key: &RequestKey) -> Option<&ReqState> {
        self.map.get(key)
    }

    /// Drops the request once its reply is persisted.
    pub fn remove(&mut self, key: &RequestKey) -> Option<ReqState> {
        self.map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_consensus::Operation;
    use conclave_types::{ClientId, ReqId};

    fn request() -> Request {
        Request::new(ClientId::from("Alice"), ReqId::new(1), Operation::new("T"))
    }

    fn name(s: &str) -> NodeName {
        NodeName::from(s)
    }

    #[test]
    fn propagates_from_one_sender_count_once() {
        let mut requests = Requests::new();
        let req = request();
        requests.add_propagate(&req, name("Alpha"));
        requests.add_propagate(&req, name("Alpha"));
        assert_eq!(requests.votes(&req.key()), 1);
        assert!(requests.has_propagated(&req, &name("Alpha")));
        assert!(!requests.has_propagated(&req, &name("Beta")));
    }

    #[test]
    fn exactly_f_plus_one_votes_allow_forwarding() {
        let mut requests = Requests::new();
        let req = request();
        let required = 2; // f + 1 with f = 1

        requests.add_propagate(&req, name("Alpha"));
        assert!(!requests.can_forward(&req, required));

        requests.add_propagate(&req, name("Beta"));
        assert!(requests.can_forward(&req, required));
        requests.flag_as_forwarded(&req);

        // The f+2nd witness does not re-trigger: count overshoots and
        // the flag gates re-entry
        requests.add_propagate(&req, name("Gamma"));
        assert!(!requests.can_forward(&req, required));
    }

    #[test]
    fn forwarded_flag_gates_re_forwarding_at_threshold() {
        let mut requests = Requests::new();
        let req = request();
        requests.add_propagate(&req, name("Alpha"));
        requests.add_propagate(&req, name("Beta"));
        requests.flag_as_forwarded(&req);
        assert!(!requests.can_forward(&req, 2));
    }

    #[test]
    fn removal_forgets_the_request() {
        let mut requests = Requests::new();
        let req = request();
        requests.add(&req);
        assert_eq!(requests.len(), 1);
        requests.remove(&req.key());
        assert!(requests.is_empty());
        assert_eq!(requests.votes(&req.key()), 0);
    }
}
