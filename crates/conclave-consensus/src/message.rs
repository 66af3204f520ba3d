//! Protocol messages.
//!
//! Wire messages are sum types tagged by an `op` field naming the
//! variant; unknown tags fail decoding at the node boundary. Envelope
//! framing and transport signatures live below this layer — the types
//! here carry only what the protocol needs.
//!
//! ## Node-to-node
//! - [`Propagate`] — rebroadcast of a client request establishing the
//!   f+1-witness before forwarding to replicas
//! - [`PrePrepare`] / [`Prepare`] / [`Commit`] — the three phases
//! - [`InstanceChange`] — vote to advance the view
//! - [`Nomination`] / [`Primary`] / [`Reelection`] — primary election
//! - [`Batch`] — wrapper whose members are revalidated individually
//!
//! ## Client-directed
//! - [`RequestAck`] / [`RequestNack`] / [`Reply`]
//!
//! [`Ordered`] is a replica→node signal and never crosses the wire.

use conclave_types::{
    ClientId, Digest, Hash, InstId, NodeName, PpSeqNo, ReqId, RequestKey, SeqNo, Timestamp, TxnId,
    ViewNo,
};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client Requests
// ============================================================================

/// The opaque typed operation a request carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub txn_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Operation {
    pub fn new(txn_type: impl Into<String>) -> Self {
        Self {
            txn_type: txn_type.into(),
            data: serde_json::Value::Null,
        }
    }
}

/// A signed client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientId,
    pub req_id: ReqId,
    pub operation: Operation,
    /// Detached Ed25519 signature over [`Request::signable_bytes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Vec<u8>>,
}

impl Request {
    pub fn new(client_id: ClientId, req_id: ReqId, operation: Operation) -> Self {
        Self {
            client_id,
            req_id,
            operation,
            signature: None,
        }
    }

    /// The request's identity: `(client_id, req_id)`.
    pub fn key(&self) -> RequestKey {
        (self.client_id.clone(), self.req_id)
    }

    /// Canonical bytes covered by the client signature and the digest.
    pub fn signable_bytes(&self) -> Vec<u8> {
        conclave_crypto::hash::canonical_bytes(&(&self.client_id, self.req_id, &self.operation))
    }

    /// SHA-256 over the canonical serialization.
    pub fn digest(&self) -> Digest {
        conclave_crypto::sha256(&self.signable_bytes())
    }

    /// The digest triple forwarded to replicas once f+1 PROPAGATEs agree.
    pub fn req_digest(&self) -> ReqDigest {
        ReqDigest {
            client_id: self.client_id.clone(),
            req_id: self.req_id,
            digest: self.digest(),
        }
    }
}

/// What the node hands its replicas: the request identity plus digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqDigest {
    pub client_id: ClientId,
    pub req_id: ReqId,
    pub digest: Digest,
}

impl ReqDigest {
    pub fn key(&self) -> RequestKey {
        (self.client_id.clone(), self.req_id)
    }
}

// ============================================================================
// Node-to-Node Messages
// ============================================================================

/// Rebroadcast of a client request, carrying the full request so a node
/// that never saw the original can still execute it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Propagate {
    pub request: Request,
    pub sender_client: String,
}

/// Primary → instance peers: bind `pp_seq_no` to a request digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrePrepare {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    pub client_id: ClientId,
    pub req_id: ReqId,
    pub digest: Digest,
    pub pp_time: Timestamp,
}

/// Non-primary → instance peers: I accept this binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prepare {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    pub digest: Digest,
}

/// Replica → instance peers: I hold a prepared certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub pp_seq_no: PpSeqNo,
    pub digest: Digest,
}

/// Vote to advance past `view_no` because the master is degraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceChange {
    pub view_no: ViewNo,
}

/// Election: I nominate `name` as primary of `inst_id` in `view_no`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nomination {
    pub name: NodeName,
    pub inst_id: InstId,
    pub view_no: ViewNo,
}

/// Election: a quorum nominated `name`; I declare it primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Primary {
    pub name: NodeName,
    pub inst_id: InstId,
    pub view_no: ViewNo,
}

/// Election: the round split; rerun it among the tied candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reelection {
    pub inst_id: InstId,
    pub round: u32,
    pub tie_among: Vec<NodeName>,
    pub view_no: ViewNo,
}

/// Wrapper unpacked at the node boundary; every member is revalidated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub messages: Vec<serde_json::Value>,
}

/// All node-to-node wire messages, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum NodeMsg {
    #[serde(rename = "PROPAGATE")]
    Propagate(Propagate),
    #[serde(rename = "PREPREPARE")]
    PrePrepare(PrePrepare),
    #[serde(rename = "PREPARE")]
    Prepare(Prepare),
    #[serde(rename = "COMMIT")]
    Commit(Commit),
    #[serde(rename = "INSTANCE_CHANGE")]
    InstanceChange(InstanceChange),
    #[serde(rename = "NOMINATE")]
    Nomination(Nomination),
    #[serde(rename = "PRIMARY")]
    Primary(Primary),
    #[serde(rename = "REELECTION")]
    Reelection(Reelection),
    #[serde(rename = "BATCH")]
    Batch(Batch),
}

impl NodeMsg {
    /// Human-readable message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            NodeMsg::Propagate(_) => "PROPAGATE",
            NodeMsg::PrePrepare(_) => "PREPREPARE",
            NodeMsg::Prepare(_) => "PREPARE",
            NodeMsg::Commit(_) => "COMMIT",
            NodeMsg::InstanceChange(_) => "INSTANCE_CHANGE",
            NodeMsg::Nomination(_) => "NOMINATE",
            NodeMsg::Primary(_) => "PRIMARY",
            NodeMsg::Reelection(_) => "REELECTION",
            NodeMsg::Batch(_) => "BATCH",
        }
    }

    /// Whether this message type relies on transport authentication
    /// alone. `Propagate` is expressly excluded: it carries a client
    /// request whose client signature must be checked.
    pub fn is_transport_authenticated(&self) -> bool {
        !matches!(self, NodeMsg::Propagate(_))
    }
}

// ============================================================================
// Client-Facing Messages
// ============================================================================

/// All client-to-node wire messages, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ClientMsg {
    #[serde(rename = "REQUEST")]
    Request(Request),
    #[serde(rename = "BATCH")]
    Batch(Batch),
}

/// The request was accepted for ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAck {
    pub req_id: ReqId,
}

/// The request was rejected; it will not be ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestNack {
    pub req_id: ReqId,
    pub reason: String,
}

/// Result of an executed request, sufficient for the client to verify
/// inclusion against a trusted root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyResult {
    pub client_id: ClientId,
    pub req_id: ReqId,
    pub txn_id: TxnId,
    pub txn_time: Timestamp,
    pub txn_type: String,
    pub seq_no: SeqNo,
    pub audit_path: Vec<Hash>,
    pub root_hash: Hash,
}

/// The authenticated answer to a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub result: ReplyResult,
}

/// Node-to-client messages, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum ClientReply {
    #[serde(rename = "REQACK")]
    RequestAck(RequestAck),
    #[serde(rename = "REQNACK")]
    RequestNack(RequestNack),
    #[serde(rename = "REPLY")]
    Reply(Reply),
}

// ============================================================================
// Internal Events
// ============================================================================

/// Replica → node: the binding `(pp_seq_no → request)` is committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ordered {
    pub inst_id: InstId,
    pub view_no: ViewNo,
    pub client_id: ClientId,
    pub req_id: ReqId,
    pub digest: Digest,
    pub pp_time: Timestamp,
}

impl Ordered {
    pub fn key(&self) -> RequestKey {
        (self.client_id.clone(), self.req_id)
    }
}

// ============================================================================
// Routing Subsets
// ============================================================================

/// The three-phase messages routed to a replica inbox by `inst_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreePcMsg {
    PrePrepare(PrePrepare),
    Prepare(Prepare),
    Commit(Commit),
}

impl ThreePcMsg {
    pub fn inst_id(&self) -> InstId {
        match self {
            ThreePcMsg::PrePrepare(m) => m.inst_id,
            ThreePcMsg::Prepare(m) => m.inst_id,
            ThreePcMsg::Commit(m) => m.inst_id,
        }
    }

    pub fn view_no(&self) -> ViewNo {
        match self {
            ThreePcMsg::PrePrepare(m) => m.view_no,
            ThreePcMsg::Prepare(m) => m.view_no,
            ThreePcMsg::Commit(m) => m.view_no,
        }
    }

    pub fn pp_seq_no(&self) -> PpSeqNo {
        match self {
            ThreePcMsg::PrePrepare(m) => m.pp_seq_no,
            ThreePcMsg::Prepare(m) => m.pp_seq_no,
            ThreePcMsg::Commit(m) => m.pp_seq_no,
        }
    }
}

impl From<ThreePcMsg> for NodeMsg {
    fn from(msg: ThreePcMsg) -> Self {
        match msg {
            ThreePcMsg::PrePrepare(m) => NodeMsg::PrePrepare(m),
            ThreePcMsg::Prepare(m) => NodeMsg::Prepare(m),
            ThreePcMsg::Commit(m) => NodeMsg::Commit(m),
        }
    }
}

/// The election messages routed to the elector inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionMsg {
    Nomination(Nomination),
    Primary(Primary),
    Reelection(Reelection),
}

impl ElectionMsg {
    pub fn inst_id(&self) -> InstId {
        match self {
            ElectionMsg::Nomination(m) => m.inst_id,
            ElectionMsg::Primary(m) => m.inst_id,
            ElectionMsg::Reelection(m) => m.inst_id,
        }
    }

    pub fn view_no(&self) -> ViewNo {
        match self {
            ElectionMsg::Nomination(m) => m.view_no,
            ElectionMsg::Primary(m) => m.view_no,
            ElectionMsg::Reelection(m) => m.view_no,
        }
    }
}

impl From<ElectionMsg> for NodeMsg {
    fn from(msg: ElectionMsg) -> Self {
        match msg {
            ElectionMsg::Nomination(m) => NodeMsg::Nomination(m),
            ElectionMsg::Primary(m) => NodeMsg::Primary(m),
            ElectionMsg::Reelection(m) => NodeMsg::Reelection(m),
        }
    }
}
