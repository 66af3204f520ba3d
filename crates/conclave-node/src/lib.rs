//! # conclave-node: the RBFT node
//!
//! Ties the protocol core to storage and transport: message dispatch
//! and the request lifecycle (REQUEST → PROPAGATE → forward → Ordered →
//! execute → Reply), primary election and view changes driven by the
//! performance monitor, and the Merkle-committed ledger behind every
//! reply.
//!
//! The node runs single-threaded and cooperative: an external event
//! loop calls [`Node::prod`] repeatedly, and every timer or retry flows
//! through the scheduled-action queue serviced by that same tick.
//! Transport and clock are injected, which is what makes whole-cluster
//! simulation (see [`transport::SimNetwork`]) deterministic.

pub mod actions;
pub mod authenticator;
pub mod blacklister;
pub mod config;
pub mod error;
pub mod node;
pub mod propagator;
pub mod transport;

pub use authenticator::{sign_request, ClientAuthenticator, OpValidator};
pub use blacklister::SimpleBlacklister;
pub use config::{ConfigError, HashStoreConfig, HashStoreKind, NodeConfig};
pub use error::{NodeError, ValidationError};
pub use node::{Node, Status};
pub use propagator::{ReqState, Requests};
pub use transport::{ManualClock, SimNetwork, SimTransport, SystemClock, TimeSource, Transport};
