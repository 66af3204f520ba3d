//! The transport seam and the deterministic in-memory network.
//!
//! Authenticated transport is an external collaborator: the node only
//! needs the narrow [`Transport`] capability to send, and drains inbound
//! frames as raw bytes so the full decode/validate path is exercised on
//! every delivery. [`SimNetwork`] is the deterministic loopback
//! implementation the integration tests (and embedders' simulations)
//! drive whole clusters with.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use bytes::Bytes;
use conclave_consensus::{ClientMsg, ClientReply, NodeMsg};
use conclave_types::{NodeName, Timestamp};

// ============================================================================
// Time Source
// ============================================================================

/// The node's clock, injected so protocol timing is testable.
pub trait TimeSource {
    fn now(&self) -> Timestamp;
}

/// Wall-clock time source for production use.
#[derive(Debug, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// Hand-advanced clock shared by every node of a simulated cluster.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: std::time::Duration) {
        self.nanos.set(self.nanos.get() + by.as_nanos() as u64);
    }

    pub fn set(&self, to: Timestamp) {
        self.nanos.set(to.as_nanos());
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_nanos(self.nanos.get())
    }
}

// ============================================================================
// Transport Seam
// ============================================================================

/// What the node needs from its network stacks. Outbound messages are
/// typed (framing is the transport's concern); inbound frames arrive as
/// bytes so the node's decode and validation path sees every message.
pub trait Transport {
    /// Sends to every other node in the cluster.
    fn broadcast(&mut self, msg: &NodeMsg);

    /// Sends to one specific node.
    fn send_to_node(&mut self, to: &NodeName, msg: &NodeMsg);

    /// Sends a reply to a client connection address.
    fn send_to_client(&mut self, addr: &str, reply: &ClientReply);

    /// Drains up to `limit` inbound node frames as `(bytes, sender)`.
    fn drain_node_inbox(&mut self, limit: usize) -> Vec<(Bytes, NodeName)>;

    /// Drains up to `limit` inbound client frames as `(bytes, address)`.
    fn drain_client_inbox(&mut self, limit: usize) -> Vec<(Bytes, String)>;

    /// Number of peer nodes currently connected.
    fn connected_count(&self) -> usize;

    /// Opens or closes the key-sharing (auto-join) window.
    fn set_auto_join(&mut self, open: bool);
}

// ============================================================================
// In-Memory Simulation Network
// ============================================================================

#[derive(Debug, Default)]
struct Mailbox {
    node_frames: VecDeque<(Bytes, NodeName)>,
    client_frames: VecDeque<(Bytes, String)>,
}

#[derive(Debug, Default)]
struct NetworkCore {
    mailboxes: HashMap<NodeName, Mailbox>,
    client_replies: HashMap<String, Vec<ClientReply>>,
    disconnected: HashSet<NodeName>,
    /// Nodes whose inbound PROPAGATE frames are silently dropped
    /// (partial-partition testing).
    propagate_blocked: HashSet<NodeName>,
}

impl NetworkCore {
    fn deliver_node_frame(&mut self, from: &NodeName, to: &NodeName, frame: Bytes) {
        if self.disconnected.contains(from) || self.disconnected.contains(to) {
            return;
        }
        if self.propagate_blocked.contains(to) && frame_op(&frame) == Some("PROPAGATE".into()) {
            return;
        }
        if let Some(mailbox) = self.mailboxes.get_mut(to) {
            mailbox.node_frames.push_back((frame, from.clone()));
        }
    }
}

fn frame_op(frame: &Bytes) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(frame).ok()?;
    value.get("op")?.as_str().map(str::to_string)
}

/// A deterministic loopback network connecting every registered node.
///
/// Disconnecting a node silently drops all traffic to and from it,
/// which is how the tests sever a Byzantine or crashed peer.
#[derive(Debug, Clone, Default)]
pub struct SimNetwork {
    core: Rc<RefCell<NetworkCore>>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a node and returns its transport endpoint.
    pub fn register(&self, name: NodeName) -> SimTransport {
        self.core
            .borrow_mut()
            .mailboxes
            .insert(name.clone(), Mailbox::default());
        SimTransport {
            core: Rc::clone(&self.core),
            me: name,
        }
    }

    pub fn disconnect(&self, name: &NodeName) {
        self.core.borrow_mut().disconnected.insert(name.clone());
    }

    pub fn reconnect(&self, name: &NodeName) {
        self.core.borrow_mut().disconnected.remove(name);
    }

    /// Drops every PROPAGATE addressed to `name` while leaving the rest
    /// of its traffic intact, starving it of request bodies.
    pub fn block_propagates_to(&self, name: &NodeName) {
        self.core
            .borrow_mut()
            .propagate_blocked
            .insert(name.clone());
    }

    pub fn unblock_propagates_to(&self, name: &NodeName) {
        self.core.borrow_mut().propagate_blocked.remove(name);
    }

    /// A client submits a message to one node.
    pub fn client_send(&self, addr: &str, to: &NodeName, msg: &ClientMsg) {
        let frame = Bytes::from(serde_json::to_vec(msg).expect("client message serializes"));
        let mut core = self.core.borrow_mut();
        if core.disconnected.contains(to) {
            return;
        }
        if let Some(mailbox) = core.mailboxes.get_mut(to) {
            mailbox.client_frames.push_back((frame, addr.to_string()));
        }
    }

    /// A client submits raw bytes (malformed input testing).
    pub fn client_send_raw(&self, addr: &str, to: &NodeName, frame: Bytes) {
        let mut core = self.core.borrow_mut();
        if let Some(mailbox) = core.mailboxes.get_mut(to) {
            mailbox.client_frames.push_back((frame, addr.to_string()));
        }
    }

    /// A peer injects raw bytes into a node's inbox (Byzantine testing).
    pub fn node_send_raw(&self, from: &NodeName, to: &NodeName, frame: Bytes) {
        self.core.borrow_mut().deliver_node_frame(from, to, frame);
    }

    /// Replies delivered to a client address so far.
    pub fn client_replies(&self, addr: &str) -> Vec<ClientReply> {
        self.core
            .borrow()
            .client_replies
            .get(addr)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_client_replies(&self, addr: &str) {
        self.core.borrow_mut().client_replies.remove(addr);
    }
}

/// One node's endpoint on a [`SimNetwork`].
#[derive(Debug)]
pub struct SimTransport {
    core: Rc<RefCell<NetworkCore>>,
    me: NodeName,
}

impl SimTransport {
    fn frame(msg: &NodeMsg) -> Bytes {
        Bytes::from(serde_json::to_vec(msg).expect("node message serializes"))
    }
}

impl Transport for SimTransport {
    fn broadcast(&mut self, msg: &NodeMsg) {
        let frame = Self::frame(msg);
        let peers: Vec<NodeName> = {
            let core = self.core.borrow();
            core.mailboxes
                .keys()
                .filter(|n| **n != self.me)
                .cloned()
                .collect()
        };
        let mut core = self.core.borrow_mut();
        for peer in peers {
            core.deliver_node_frame(&self.me, &peer, frame.clone());
        }
    }

    fn send_to_node(&mut self, to: &NodeName, msg: &NodeMsg) {
        let frame = Self::frame(msg);
        self.core
            .borrow_mut()
            .deliver_node_frame(&self.me, to, frame);
    }

    fn send_to_client(&mut self, addr: &str, reply: &ClientReply) {
        let mut core = self.core.borrow_mut();
        if core.disconnected.contains(&self.me) {
            return;
        }
        core.client_replies
            .entry(addr.to_string())
            .or_default()
            .push(reply.clone());
    }

    fn drain_node_inbox(&mut self, limit: usize) -> Vec<(Bytes, NodeName)> {
        let mut core = self.core.borrow_mut();
        let Some(mailbox) = core.mailboxes.get_mut(&self.me) else {
            return Vec::new();
        };
        let take = mailbox.node_frames.len().min(limit);
        mailbox.node_frames.drain(..take).collect()
    }

    fn drain_client_inbox(&mut self, limit: usize) -> Vec<(Bytes, String)> {
        let mut core = self.core.borrow_mut();
        let Some(mailbox) = core.mailboxes.get_mut(&self.me) else {
            return Vec::new();
        };
        let take = mailbox.client_frames.len().min(limit);
        mailbox.client_frames.drain(..take).collect()
    }

    fn connected_count(&self) -> usize {
        let core = self.core.borrow();
        if core.disconnected.contains(&self.me) {
            return 0;
        }
        core.mailboxes
            .keys()
            .filter(|n| **n != self.me && !core.disconnected.contains(*n))
            .count()
    }

    fn set_auto_join(&mut self, _open: bool) {
        // The loopback network has no join procedure
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_consensus::InstanceChange;
    use conclave_types::ViewNo;

    fn msg() -> NodeMsg {
        NodeMsg::InstanceChange(InstanceChange {
            view_no: ViewNo::ZERO,
        })
    }

    #[test]
    fn broadcast_reaches_every_other_node() {
        let net = SimNetwork::new();
        let mut alpha = net.register(NodeName::from("Alpha"));
        let mut beta = net.register(NodeName::from("Beta"));
        let mut gamma = net.register(NodeName::from("Gamma"));

        alpha.broadcast(&msg());

        assert!(alpha.drain_node_inbox(10).is_empty());
        let received = beta.drain_node_inbox(10);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, NodeName::from("Alpha"));
        assert_eq!(gamma.drain_node_inbox(10).len(), 1);
    }

    #[test]
    fn disconnection_drops_traffic_both_ways() {
        let net = SimNetwork::new();
        let mut alpha = net.register(NodeName::from("Alpha"));
        let mut beta = net.register(NodeName::from("Beta"));

        net.disconnect(&NodeName::from("Beta"));
        alpha.broadcast(&msg());
        assert!(beta.drain_node_inbox(10).is_empty());

        beta.broadcast(&msg());
        assert!(alpha.drain_node_inbox(10).is_empty());
        assert_eq!(alpha.connected_count(), 0);

        net.reconnect(&NodeName::from("Beta"));
        beta.broadcast(&msg());
        assert_eq!(alpha.drain_node_inbox(10).len(), 1);
    }

    #[test]
    fn drain_respects_the_limit() {
        let net = SimNetwork::new();
        let mut alpha = net.register(NodeName::from("Alpha"));
        let mut beta = net.register(NodeName::from("Beta"));

        for _ in 0..5 {
            alpha.broadcast(&msg());
        }
        assert_eq!(beta.drain_node_inbox(3).len(), 3);
        assert_eq!(beta.drain_node_inbox(10).len(), 2);
    }

    #[test]
    fn manual_clock_is_shared() {
        let clock = ManualClock::new();
        let view = clock.clone();
        clock.advance(std::time::Duration::from_secs(3));
        assert_eq!(view.now().as_secs(), 3);
    }
}
