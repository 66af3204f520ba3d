//! # conclave-consensus: the RBFT protocol core
//!
//! This crate holds the protocol machinery shared by every node:
//!
//! ## Normal operation
//! - [`message`]: the `op`-tagged wire messages and internal events
//! - [`replica`]: the three-phase commit state machine, one per protocol
//!   instance (instance 0 is the master whose ordering is executed)
//!
//! ## Control plane
//! - [`elector`]: round-based primary election per instance
//! - [`monitor`]: latency/throughput statistics and the
//!   master-degradation predicate driving instance changes
//! - [`instance_change`]: the per-view vote registry
//! - [`suspicion`]: the table of misbehavior codes
//!
//! Everything here is pure protocol state: no I/O, no clocks of its own,
//! no back-references to the owning node. Components receive messages
//! through inboxes and surface work through outboxes, which the node's
//! cooperative `prod` tick drains.

pub mod elector;
pub mod instance_change;
pub mod message;
pub mod monitor;
pub mod replica;
pub mod suspicion;

pub use elector::{ElectorOutMsg, PrimaryElector};
pub use instance_change::InstanceChanges;
pub use message::{
    Batch, ClientMsg, ClientReply, ElectionMsg, InstanceChange, NodeMsg, Nomination, Operation,
    Ordered, PrePrepare, Prepare, Primary, Propagate, Reelection, Reply, ReplyResult, ReqDigest,
    Request, RequestAck, RequestNack, ThreePcMsg,
};
pub use monitor::{Monitor, MonitorConfig};
pub use replica::{Replica, ReplicaInMsg, ReplicaOutMsg};
pub use suspicion::{Suspicion, SuspicionCode};
