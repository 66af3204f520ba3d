//! The node: orchestrator and I/O multiplexer.
//!
//! A node owns everything: its f+1 replicas, the elector, the monitor,
//! the request registry, the ledger and reply store, the blacklisters
//! and the scheduled-action queue. Child components never hold a
//! reference back; they communicate through inboxes and outboxes that
//! the cooperative [`Node::prod`] tick drains in a fixed order:
//! lifecycle, inbound node messages, replica queues, inbound client
//! messages, deferred actions, elector queues.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::Rng;

use conclave_consensus::{
    ClientMsg, ClientReply, ElectionMsg, InstanceChange, InstanceChanges, Monitor, NodeMsg,
    Ordered, PrimaryElector, Propagate, Reply, ReplyResult, Request, RequestAck, RequestNack,
    Suspicion, SuspicionCode, ThreePcMsg,
};
use conclave_consensus::{ElectorOutMsg, Replica, ReplicaInMsg, ReplicaOutMsg};
use conclave_ledger::{FileHashStore, HashStore, Ledger, MemoryHashStore, TransactionStore, TxnRecord};
use conclave_types::{
    max_failures, num_instances, InstId, NodeName, ReqId, Timestamp, ViewNo,
};

use crate::actions::{ActionQueue, NodeAction};
use crate::authenticator::{ClientAuthenticator, OpValidator};
use crate::blacklister::SimpleBlacklister;
use crate::config::{HashStoreKind, NodeConfig};
use crate::error::{NodeError, ValidationError};
use crate::transport::{TimeSource, Transport};

/// Ordered retries are bounded; after this many the Ordered is dropped.
const MAX_ORDERED_RETRIES: u32 = 3;

/// Node op tags accepted on the node stack.
const KNOWN_NODE_OPS: [&str; 9] = [
    "PROPAGATE",
    "PREPREPARE",
    "PREPARE",
    "COMMIT",
    "INSTANCE_CHANGE",
    "NOMINATE",
    "PRIMARY",
    "REELECTION",
    "BATCH",
];

/// Client op tags accepted on the client stack.
const KNOWN_CLIENT_OPS: [&str; 2] = ["REQUEST", "BATCH"];

/// Node lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Fewer than 2f+1 peers connected; cannot make progress.
    Starting,
    /// A functional minority is missing but quorum is reachable.
    StartedHungry,
    /// All peers connected.
    Started,
    Stopping,
    Stopped,
}

type NodeLedger = Ledger<Box<dyn HashStore>>;

/// One RBFT node.
pub struct Node {
    name: NodeName,
    config: NodeConfig,
    registry: Vec<NodeName>,
    f: usize,
    rank: usize,
    status: Status,
    view_no: ViewNo,

    replicas: Vec<Replica>,
    msgs_to_replicas: Vec<VecDeque<ReplicaInMsg>>,
    elector: PrimaryElector,
    msgs_to_elector: VecDeque<(ElectionMsg, NodeName)>,
    monitor: Monitor,
    instance_changes: InstanceChanges,
    requests: crate::propagator::Requests,

    ledger: NodeLedger,
    txn_store: TransactionStore<Reply>,

    client_auth: ClientAuthenticator,
    op_validators: Vec<Box<dyn OpValidator>>,
    client_blacklister: SimpleBlacklister,
    node_blacklister: SimpleBlacklister,
    /// Client identifier → transport address of its connection.
    client_addrs: HashMap<conclave_types::ClientId, String>,

    transport: Box<dyn Transport>,
    actions: ActionQueue,
    clock: Box<dyn TimeSource>,
    rng: StdRng,
    is_key_sharing: bool,

    node_inbox: VecDeque<(NodeMsg, NodeName)>,
    client_inbox: VecDeque<(Request, String)>,
}

impl Node {
    /// Creates a node for a fixed registry of cluster members.
    pub fn new(
        name: NodeName,
        all_nodes: &[NodeName],
        config: NodeConfig,
        transport: Box<dyn Transport>,
        clock: Box<dyn TimeSource>,
        rng: StdRng,
    ) -> Result<Self, NodeError> {
        let registry = conclave_types::ranked(all_nodes);
        let rank = name.rank(&registry).ok_or_else(|| {
            NodeError::Config(crate::config::ConfigError::Validation(format!(
                "node {name} is not part of the registry"
            )))
        })?;
        let n = registry.len();
        let f = max_failures(n);
        let instances = num_instances(n);
        let now = clock.now();

        let ledger = Self::open_primary_storage(&config, &name)?;
        let mut monitor = Monitor::new(config.monitor, now);
        let mut replicas = Vec::with_capacity(instances);
        let mut msgs_to_replicas = Vec::with_capacity(instances);
        for idx in 0..instances {
            let inst_id = InstId::new(idx as u8);
            let replica = Replica::new(name.clone(), inst_id, n);
            tracing::info!(
                node = %name,
                inst = %inst_id,
                kind = if replica.is_master() { "master" } else { "backup" },
                "added replica"
            );
            replicas.push(replica);
            msgs_to_replicas.push(VecDeque::new());
            monitor.add_instance();
        }
        let elector = PrimaryElector::new(name.clone(), &registry, instances);

        let client_blacklister = SimpleBlacklister::new(format!("{name}:clients"));
        let node_blacklister = SimpleBlacklister::new(format!("{name}:nodes"));

        Ok(Self {
            name,
            config,
            registry,
            f,
            rank,
            status: Status::Starting,
            view_no: ViewNo::ZERO,
            replicas,
            msgs_to_replicas,
            elector,
            msgs_to_elector: VecDeque::new(),
            monitor,
            instance_changes: InstanceChanges::new(),
            requests: crate::propagator::Requests::new(),
            ledger,
            txn_store: TransactionStore::new(),
            client_auth: ClientAuthenticator::new(),
            op_validators: Vec::new(),
            client_blacklister,
            node_blacklister,
            client_addrs: HashMap::new(),
            transport,
            actions: ActionQueue::new(),
            clock,
            rng,
            is_key_sharing: false,
            node_inbox: VecDeque::new(),
            client_inbox: VecDeque::new(),
        })
    }

    fn open_primary_storage(config: &NodeConfig, name: &NodeName) -> Result<NodeLedger, NodeError> {
        match config.hash_store.kind {
            HashStoreKind::Memory => {
                let store: Box<dyn HashStore> = Box::new(MemoryHashStore::new());
                Ok(Ledger::ephemeral(store)?)
            }
            HashStoreKind::File => {
                let dir = config.data_dir(name.as_str());
                let store: Box<dyn HashStore> = Box::new(FileHashStore::open(&dir)?);
                Ok(Ledger::open(&dir, store)?)
            }
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn view_no(&self) -> ViewNo {
        self.view_no
    }

    pub fn f(&self) -> usize {
        self.f
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Quorum of this cluster: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f + 1
    }

    pub fn ledger(&self) -> &NodeLedger {
        &self.ledger
    }

    pub fn txn_store(&self) -> &TransactionStore<Reply> {
        &self.txn_store
    }

    pub fn num_replicas(&self) -> usize {
        self.replicas.len()
    }

    /// Primary of the master instance, once elected.
    pub fn master_primary(&self) -> Option<&NodeName> {
        self.replicas.first().and_then(Replica::primary_name)
    }

    pub fn is_node_blacklisted(&self, name: &NodeName) -> bool {
        self.node_blacklister.is_blacklisted(name.as_str())
    }

    pub fn is_client_blacklisted(&self, addr: &str) -> bool {
        self.client_blacklister.is_blacklisted(addr)
    }

    pub fn is_key_sharing(&self) -> bool {
        self.is_key_sharing
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Registers a client's verifying key with the authenticator.
    pub fn register_client(&mut self, client_id: conclave_types::ClientId, key: conclave_crypto::VerifyingKey) {
        self.client_auth.register(client_id, key);
    }

    /// Installs an operation validator run on every client request.
    pub fn add_op_validator(&mut self, validator: Box<dyn OpValidator>) {
        self.op_validators.push(validator);
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Opens for business: elections are scheduled immediately and the
    /// periodic performance check re-arms itself from here on.
    pub fn start(&mut self) {
        let now = self.clock.now();
        tracing::info!(node = %self.name, rank = self.rank, f = self.f, "starting");
        self.service_lifecycle();
        self.actions.schedule(NodeAction::DecidePrimaries, now);
        self.actions.schedule(
            NodeAction::CheckPerformance,
            now.saturating_add(Duration::from_secs(self.config.perf_check_freq_secs)),
        );
    }

    /// Flushes and closes storage; outstanding reads get a bounded
    /// drain window.
    pub fn stop(&mut self) -> Result<(), NodeError> {
        tracing::info!(node = %self.name, "stopping");
        self.status = Status::Stopping;
        let timeout = Duration::from_secs(self.config.stop_timeout_secs);
        self.txn_store.stop(timeout)?;
        self.ledger.stop()?;
        self.actions.clear();
        self.status = Status::Stopped;
        Ok(())
    }

    fn service_lifecycle(&mut self) {
        if matches!(self.status, Status::Stopping | Status::Stopped) {
            return;
        }
        let connected = self.transport.connected_count() + 1;
        let new_status = if connected >= self.registry.len() {
            Status::Started
        } else if connected >= self.quorum() {
            Status::StartedHungry
        } else {
            Status::Starting
        };
        if new_status != self.status {
            tracing::info!(node = %self.name, ?new_status, connected, "status changed");
            self.status = new_status;
            if new_status == Status::Started {
                self.stop_key_sharing(false);
            }
        }
    }

    /// One cooperative tick. Services, in order: lifecycle, inbound node
    /// messages, replica queues, inbound client messages, deferred
    /// actions, elector queues. Returns the number of items processed.
    pub fn prod(&mut self, limit: usize) -> Result<usize, NodeError> {
        self.service_lifecycle();
        if matches!(self.status, Status::Stopping | Status::Stopped) {
            return Ok(0);
        }
        let mut count = 0;
        count += self.service_node_msgs(limit);
        count += self.service_replicas(limit)?;
        count += self.service_client_msgs(limit)?;
        count += self.service_actions()?;
        count += self.service_elector(limit);
        Ok(count)
    }

    // ========================================================================
    // Key Sharing
    // ========================================================================

    /// Opens the auto-join window so new nodes can join, reverting to
    /// closed mode after the configured timeout.
    pub fn start_key_sharing(&mut self) {
        if self.is_key_sharing {
            tracing::info!(node = %self.name, "already key sharing");
            return;
        }
        tracing::info!(node = %self.name, "starting key sharing");
        self.is_key_sharing = true;
        self.transport.set_auto_join(true);
        let due = self
            .clock
            .now()
            .saturating_add(Duration::from_secs(self.config.key_sharing_timeout_secs));
        self.actions.schedule(NodeAction::StopKeySharing, due);
    }

    fn stop_key_sharing(&mut self, timed_out: bool) {
        if !self.is_key_sharing {
            return;
        }
        if timed_out {
            tracing::info!(node = %self.name, "key sharing timed out");
        } else {
            tracing::info!(node = %self.name, "completed key sharing");
        }
        self.is_key_sharing = false;
        self.transport.set_auto_join(false);
    }

    // ========================================================================
    // Node Message Intake
    // ========================================================================

    fn service_node_msgs(&mut self, limit: usize) -> usize {
        let frames = self.transport.drain_node_inbox(limit);
        let count = frames.len();
        for (frame, frm) in frames {
            self.handle_one_node_msg(&frame, &frm);
        }
        self.process_node_inbox();
        count
    }

    fn handle_one_node_msg(&mut self, frame: &[u8], frm: &NodeName) {
        if self.node_blacklister.is_blacklisted(frm.as_str()) {
            tracing::debug!(node = %self.name, from = %frm, "discarding message from blacklisted node");
            return;
        }
        match Self::decode_node_msg(frame) {
            Ok(msg) => self.unpack_node_msg(msg, frm),
            Err(err) => {
                tracing::debug!(node = %self.name, from = %frm, %err, "discarding node message");
            }
        }
    }

    fn decode_node_msg(frame: &[u8]) -> Result<NodeMsg, ValidationError> {
        let value: serde_json::Value = serde_json::from_slice(frame)
            .map_err(|e| ValidationError::InvalidNodeMsg(e.to_string()))?;
        let op = value
            .get("op")
            .and_then(serde_json::Value::as_str)
            .ok_or(ValidationError::MissingNodeOp)?;
        if !KNOWN_NODE_OPS.contains(&op) {
            return Err(ValidationError::InvalidNodeOp(op.to_string()));
        }
        serde_json::from_value(value).map_err(|e| ValidationError::InvalidNodeMsg(e.to_string()))
    }

    fn unpack_node_msg(&mut self, msg: NodeMsg, frm: &NodeName) {
        if let NodeMsg::Batch(batch) = msg {
            // Every member is revalidated from its own bytes
            for member in batch.messages {
                match serde_json::to_vec(&member) {
                    Ok(bytes) => self.handle_one_node_msg(&bytes, frm),
                    Err(err) => {
                        tracing::debug!(node = %self.name, from = %frm, %err, "dropping batch member");
                    }
                }
            }
            return;
        }
        if self.verify_node_msg_signature(&msg).is_err() {
            self.report_suspicious_node(frm, SuspicionCode::InvalidSignature);
            return;
        }
        self.node_inbox.push_back((msg, frm.clone()));
    }

    /// Client signatures are checked only where a client signed: the
    /// whitelist of peer-authenticated types relies on the transport.
    fn verify_node_msg_signature(&self, msg: &NodeMsg) -> Result<(), ValidationError> {
        if msg.is_transport_authenticated() {
            return Ok(());
        }
        match msg {
            NodeMsg::Propagate(p) => self.client_auth.authenticate(&p.request),
            _ => Ok(()),
        }
    }

    fn process_node_inbox(&mut self) {
        while let Some((msg, frm)) = self.node_inbox.pop_front() {
            match msg {
                NodeMsg::Propagate(p) => self.process_propagate(p, frm),
                NodeMsg::InstanceChange(ic) => self.process_instance_change(ic, frm),
                NodeMsg::Nomination(m) => self.send_to_elector(ElectionMsg::Nomination(m), frm),
                NodeMsg::Primary(m) => self.send_to_elector(ElectionMsg::Primary(m), frm),
                NodeMsg::Reelection(m) => self.send_to_elector(ElectionMsg::Reelection(m), frm),
                NodeMsg::PrePrepare(m) => self.send_to_replica(ThreePcMsg::PrePrepare(m), frm),
                NodeMsg::Prepare(m) => self.send_to_replica(ThreePcMsg::Prepare(m), frm),
                NodeMsg::Commit(m) => self.send_to_replica(ThreePcMsg::Commit(m), frm),
                NodeMsg::Batch(_) => {
                    tracing::debug!(node = %self.name, "discarding nested batch");
                }
            }
        }
    }

    fn send_to_replica(&mut self, msg: ThreePcMsg, frm: NodeName) {
        let inst = msg.inst_id().as_usize();
        if inst >= self.replicas.len() {
            tracing::debug!(
                node = %self.name,
                inst,
                "discarding message for non-existent protocol instance"
            );
            return;
        }
        self.msgs_to_replicas[inst].push_back(ReplicaInMsg::ThreePc(msg, frm));
    }

    fn send_to_elector(&mut self, msg: ElectionMsg, frm: NodeName) {
        if msg.inst_id().as_usize() >= self.replicas.len() {
            tracing::debug!(
                node = %self.name,
                inst = %msg.inst_id(),
                "discarding election message for non-existent protocol instance"
            );
            return;
        }
        self.msgs_to_elector.push_back((msg, frm));
    }

    // ========================================================================
    // Propagation
    // ========================================================================

    fn process_propagate(&mut self, msg: Propagate, frm: NodeName) {
        tracing::debug!(
            node = %self.name,
            from = %frm,
            client = %msg.request.client_id,
            req_id = %msg.request.req_id,
            "received PROPAGATE"
        );
        let request = msg.request;
        self.client_addrs
            .entry(request.client_id.clone())
            .or_insert_with(|| msg.sender_client.clone());
        self.requests.add_propagate(&request, frm);
        self.propagate(&request, &msg.sender_client);
        self.try_forwarding(&request);
    }

    /// Broadcasts our own PROPAGATE for the request, exactly once.
    fn propagate(&mut self, request: &Request, client_name: &str) {
        if self.requests.has_propagated(request, &self.name) {
            tracing::trace!(node = %self.name, req_id = %request.req_id, "already propagated");
            return;
        }
        self.requests.add_propagate(request, self.name.clone());
        tracing::debug!(
            node = %self.name,
            client = %request.client_id,
            req_id = %request.req_id,
            "propagating request"
        );
        let msg = NodeMsg::Propagate(Propagate {
            request: request.clone(),
            sender_client: client_name.to_string(),
        });
        self.transport.broadcast(&msg);
    }

    /// Hands the request to every replica iff exactly f+1 distinct
    /// PROPAGATE witnesses exist and it was not forwarded before.
    fn try_forwarding(&mut self, request: &Request) {
        if !self.requests.can_forward(request, self.f + 1) {
            tracing::trace!(
                node = %self.name,
                req_id = %request.req_id,
                votes = self.requests.votes(&request.key()),
                "cannot forward yet"
            );
            return;
        }
        tracing::debug!(
            node = %self.name,
            client = %request.client_id,
            req_id = %request.req_id,
            "forwarding request to replicas"
        );
        let rd = request.req_digest();
        for queue in &mut self.msgs_to_replicas {
            queue.push_back(ReplicaInMsg::ReqDigest(rd.clone()));
        }
        let now = self.clock.now();
        self.monitor.request_un_ordered(request.key(), now);
        self.requests.flag_as_forwarded(request);
    }

    // ========================================================================
    // Replica Servicing
    // ========================================================================

    fn service_replicas(&mut self, limit: usize) -> Result<usize, NodeError> {
        let mut count = 0;
        for idx in 0..self.replicas.len() {
            while let Some(msg) = self.msgs_to_replicas[idx].pop_front() {
                self.replicas[idx].inbox.push_back(msg);
                count += 1;
            }
        }

        let now = self.clock.now();
        for replica in &mut self.replicas {
            count += replica.service_queues(limit, now);
        }

        let mut outputs = Vec::new();
        for replica in &mut self.replicas {
            outputs.extend(replica.outbox.drain(..));
        }
        for out in outputs {
            match out {
                ReplicaOutMsg::Send(msg) => {
                    self.transport.broadcast(&NodeMsg::from(msg));
                }
                ReplicaOutMsg::Ordered(ordered) => self.process_ordered(ordered, 0)?,
                ReplicaOutMsg::Suspicion(Suspicion { node, code }) => {
                    self.report_suspicious_node(&node, code);
                }
            }
        }
        Ok(count)
    }

    /// Executes a master-instance Ordered, or retries while the request
    /// body has not arrived. Backup Ordereds only feed the monitor.
    fn process_ordered(&mut self, ordered: Ordered, attempt: u32) -> Result<(), NodeError> {
        let now = self.clock.now();
        let key = ordered.key();
        self.monitor.request_ordered(&key, ordered.inst_id, now);

        if !ordered.inst_id.is_master() {
            tracing::trace!(node = %self.name, inst = %ordered.inst_id, "ordered by backup replica");
            return Ok(());
        }

        if let Some(state) = self.requests.get(&key) {
            let request = state.request.clone();
            tracing::debug!(
                node = %self.name,
                client = %request.client_id,
                req_id = %request.req_id,
                "executing client request"
            );
            self.execute_request(ordered.pp_time, &request)?;
            self.requests.remove(&key);
        } else if attempt < MAX_ORDERED_RETRIES {
            // The PROPAGATE quorum outran the request body; give it a
            // short, bounded window to arrive
            let delay = Duration::from_secs(self.rng.gen_range(2..=4));
            tracing::debug!(
                node = %self.name,
                client = %ordered.client_id,
                req_id = %ordered.req_id,
                attempt = attempt + 1,
                delay_secs = delay.as_secs(),
                "request body missing, retrying ordered"
            );
            self.actions.schedule(
                NodeAction::RetryOrdered {
                    ordered,
                    attempt: attempt + 1,
                },
                now.saturating_add(delay),
            );
        } else {
            tracing::trace!(
                node = %self.name,
                client = %ordered.client_id,
                req_id = %ordered.req_id,
                "dropping ordered, request body never arrived"
            );
        }
        Ok(())
    }

    fn execute_request(&mut self, pp_time: Timestamp, request: &Request) -> Result<(), NodeError> {
        // Idempotence guard: a reply already stored means the ledger
        // already holds this transaction
        if self
            .txn_store
            .get(&request.client_id, request.req_id)?
            .is_some()
        {
            tracing::debug!(
                node = %self.name,
                client = %request.client_id,
                req_id = %request.req_id,
                "request already executed"
            );
            return Ok(());
        }
        let reply = self.generate_reply(pp_time, request)?;
        if let Some(addr) = self.client_addrs.get(&request.client_id).cloned() {
            self.transport
                .send_to_client(&addr, &ClientReply::Reply(reply));
        } else {
            tracing::debug!(
                node = %self.name,
                client = %request.client_id,
                "no known connection for client, reply stored only"
            );
        }
        Ok(())
    }

    /// Builds the reply: derives the transaction id, appends to the
    /// ledger, merges the returned Merkle proof, persists the reply.
    fn generate_reply(&mut self, pp_time: Timestamp, request: &Request) -> Result<Reply, NodeError> {
        let txn_id = conclave_crypto::txn_id(&request.client_id, request.req_id);
        let record = TxnRecord::new(
            request.client_id.clone(),
            request.req_id,
            txn_id,
            pp_time,
            request.operation.txn_type.clone(),
        );
        let (stored, proof) = self.ledger.append(record)?;
        let reply = Reply {
            result: ReplyResult {
                client_id: stored.client_id,
                req_id: stored.req_id,
                txn_id,
                txn_time: pp_time,
                txn_type: stored.txn_type,
                seq_no: proof.seq_no,
                audit_path: proof.audit_path,
                root_hash: proof.root_hash,
            },
        };
        self.txn_store
            .add(request.client_id.clone(), request.req_id, txn_id, reply.clone());
        Ok(reply)
    }

    // ========================================================================
    // Client Message Intake
    // ========================================================================

    fn service_client_msgs(&mut self, limit: usize) -> Result<usize, NodeError> {
        let frames = self.transport.drain_client_inbox(limit);
        let count = frames.len();
        for (frame, addr) in frames {
            self.handle_one_client_msg(&frame, &addr);
        }
        while let Some((request, addr)) = self.client_inbox.pop_front() {
            self.process_request(request, &addr)?;
        }
        Ok(count)
    }

    fn handle_one_client_msg(&mut self, frame: &[u8], addr: &str) {
        if self.client_blacklister.is_blacklisted(addr) {
            tracing::debug!(node = %self.name, addr, "discarding message from blacklisted client");
            return;
        }
        let value: serde_json::Value = match serde_json::from_slice(frame) {
            Ok(v) => v,
            Err(err) => {
                self.nack(addr, ReqId::new(0), &format!("malformed message: {err}"));
                return;
            }
        };
        let req_id = ReqId::new(
            value
                .get("req_id")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0),
        );
        let Some(op) = value.get("op").and_then(serde_json::Value::as_str) else {
            self.nack(addr, req_id, "client request invalid: missing op");
            return;
        };
        if !KNOWN_CLIENT_OPS.contains(&op) {
            let reason = if KNOWN_NODE_OPS.contains(&op) {
                format!("client request invalid: {op} not allowed from clients")
            } else {
                format!("client request invalid: unknown op {op}")
            };
            self.nack(addr, req_id, &reason);
            return;
        }
        let msg: ClientMsg = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(err) => {
                self.nack(addr, req_id, &format!("client request invalid: {err}"));
                return;
            }
        };
        match msg {
            ClientMsg::Batch(batch) => {
                for member in batch.messages {
                    match serde_json::to_vec(&member) {
                        Ok(bytes) => self.handle_one_client_msg(&bytes, addr),
                        Err(err) => {
                            tracing::debug!(node = %self.name, addr, %err, "dropping batch member");
                        }
                    }
                }
            }
            ClientMsg::Request(request) => self.validate_client_request(request, addr),
        }
    }

    fn validate_client_request(&mut self, request: Request, addr: &str) {
        // Operation validators reject without blacklisting
        let rejection = self
            .op_validators
            .iter()
            .find_map(|v| v.validate(&request.operation).err());
        if let Some(reason) = rejection {
            self.nack(
                addr,
                request.req_id,
                &format!("client request invalid: {reason}"),
            );
            return;
        }
        // A bad signature is suspicious, not merely invalid
        if self.client_auth.authenticate(&request).is_err() {
            self.report_suspicious_client(addr);
            self.nack(addr, request.req_id, "client request invalid: signature");
            return;
        }
        self.client_inbox.push_back((request, addr.to_string()));
    }

    /// REQUEST lifecycle entry: cached replies are retransmitted, fresh
    /// requests are acknowledged, recorded and propagated.
    fn process_request(&mut self, request: Request, addr: &str) -> Result<(), NodeError> {
        self.client_addrs
            .insert(request.client_id.clone(), addr.to_string());

        if let Some(reply) = self.txn_store.get(&request.client_id, request.req_id)? {
            tracing::debug!(
                node = %self.name,
                client = %request.client_id,
                req_id = %request.req_id,
                "returning reply for already processed request"
            );
            self.transport.send_to_client(
                addr,
                &ClientReply::RequestAck(RequestAck {
                    req_id: request.req_id,
                }),
            );
            self.transport
                .send_to_client(addr, &ClientReply::Reply(reply));
            return Ok(());
        }

        self.transport.send_to_client(
            addr,
            &ClientReply::RequestAck(RequestAck {
                req_id: request.req_id,
            }),
        );
        self.requests.add(&request);
        self.propagate(&request, addr);
        self.try_forwarding(&request);
        Ok(())
    }

    fn nack(&mut self, addr: &str, req_id: ReqId, reason: &str) {
        tracing::debug!(node = %self.name, addr, %req_id, reason, "sending REQNACK");
        self.transport.send_to_client(
            addr,
            &ClientReply::RequestNack(RequestNack {
                req_id,
                reason: reason.to_string(),
            }),
        );
    }

    // ========================================================================
    // Instance Changes and View Changes
    // ========================================================================

    fn process_instance_change(&mut self, msg: InstanceChange, frm: NodeName) {
        let proposed = msg.view_no;
        tracing::debug!(
            node = %self.name,
            from = %frm,
            view = %proposed,
            "received INSTANCE_CHANGE"
        );
        if proposed < self.view_no {
            tracing::debug!(
                node = %self.name,
                proposed = %proposed,
                current = %self.view_no,
                "discarding instance change below current view"
            );
            return;
        }
        if !self.instance_changes.has_view(proposed) {
            // First vote for this view: join only if we also see the
            // master as degraded
            if self.monitor.is_master_degraded(self.clock.now()) {
                self.instance_changes.add_vote(proposed, frm);
                self.send_instance_change(proposed);
            } else {
                tracing::debug!(
                    node = %self.name,
                    from = %frm,
                    "instance change received but master not found slow"
                );
                return;
            }
        } else if self.instance_changes.has_vote_from(proposed, &frm) {
            self.report_suspicious_node(&frm, SuspicionCode::DuplicateInstChng);
            return;
        } else {
            self.instance_changes.add_vote(proposed, frm);
        }

        if self.can_view_change(proposed) {
            tracing::debug!(node = %self.name, view = %self.view_no, "initiating view change");
            self.start_view_change(proposed);
        } else {
            tracing::trace!(node = %self.name, "cannot initiate view change yet");
        }
    }

    /// Broadcasts our own instance-change vote for the proposed view,
    /// at most once per view so honest nodes never look like double
    /// voters.
    fn send_instance_change(&mut self, proposed: ViewNo) {
        if self.instance_changes.has_vote_from(proposed, &self.name) {
            tracing::trace!(node = %self.name, view = %proposed, "instance change already sent");
            return;
        }
        self.transport
            .broadcast(&NodeMsg::InstanceChange(InstanceChange { view_no: proposed }));
        self.instance_changes.add_vote(proposed, self.name.clone());
    }

    /// Quorum reached and our view does not exceed the proposal.
    fn can_view_change(&self, proposed: ViewNo) -> bool {
        self.instance_changes.has_quorum(proposed, self.f) && self.view_no <= proposed
    }

    fn start_view_change(&mut self, proposed: ViewNo) {
        let new_view = proposed.next();
        tracing::info!(
            node = %self.name,
            old_view = %self.view_no,
            new_view = %new_view,
            "view change"
        );
        self.view_no = new_view;
        let now = self.clock.now();
        self.monitor.reset(now);
        self.instance_changes.prune_through(proposed);
        for replica in &mut self.replicas {
            replica.on_view_change(new_view);
        }
        self.elector.on_view_change(new_view);
    }

    /// Periodic master check; re-arms itself.
    fn check_performance(&mut self) {
        let now = self.clock.now();
        self.actions.schedule(
            NodeAction::CheckPerformance,
            now.saturating_add(Duration::from_secs(self.config.perf_check_freq_secs)),
        );
        if self.replicas.is_empty() {
            return;
        }
        if self.monitor.is_master_degraded(now) {
            tracing::info!(
                node = %self.name,
                view = %self.view_no,
                metrics = %self.monitor.pretty_metrics(now),
                "master has lower performance than backups, sending instance change"
            );
            self.send_instance_change(self.view_no);
            if self.can_view_change(self.view_no) {
                self.start_view_change(self.view_no);
            }
        } else {
            tracing::debug!(node = %self.name, "master performing adequately");
        }
    }

    // ========================================================================
    // Deferred Actions and Elector
    // ========================================================================

    fn service_actions(&mut self) -> Result<usize, NodeError> {
        let now = self.clock.now();
        let due = self.actions.service_due(now);
        let count = due.len();
        for action in due {
            match action {
                NodeAction::CheckPerformance => self.check_performance(),
                NodeAction::RetryOrdered { ordered, attempt } => {
                    self.process_ordered(ordered, attempt)?;
                }
                NodeAction::StopKeySharing => self.stop_key_sharing(true),
                NodeAction::DecidePrimaries => self.elector.decide_primaries(),
            }
        }
        Ok(count)
    }

    fn service_elector(&mut self, limit: usize) -> usize {
        let mut count = 0;
        while let Some(entry) = self.msgs_to_elector.pop_front() {
            self.elector.inbox.push_back(entry);
            count += 1;
        }
        count += self.elector.service_queues(limit);

        let outputs: Vec<ElectorOutMsg> = self.elector.outbox.drain(..).collect();
        for out in outputs {
            match out {
                ElectorOutMsg::Send(msg) => {
                    self.transport.broadcast(&NodeMsg::from(msg));
                }
                ElectorOutMsg::PrimaryDecided {
                    inst_id,
                    view_no,
                    name,
                } => {
                    if view_no == self.view_no {
                        if let Some(replica) = self.replicas.get_mut(inst_id.as_usize()) {
                            replica.set_primary(name);
                        }
                    }
                }
                ElectorOutMsg::Suspicion(Suspicion { node, code }) => {
                    self.report_suspicious_node(&node, code);
                }
            }
        }
        count
    }

    /// Retransmits this view's election messages to a peer that
    /// connected after they first went out, so it can catch up.
    pub fn catch_up_lagged_node(&mut self, peer: &NodeName) {
        let msgs = self.elector.election_messages_for_lagged();
        tracing::debug!(
            node = %self.name,
            peer = %peer,
            count = msgs.len(),
            "replaying election messages to lagged node"
        );
        for msg in msgs {
            self.transport.send_to_node(peer, &NodeMsg::from(msg));
        }
    }

    // ========================================================================
    // Suspicion Reporting
    // ========================================================================

    fn report_suspicious_node(&mut self, node: &NodeName, code: SuspicionCode) {
        tracing::warn!(
            node = %self.name,
            suspect = %node,
            code = %code,
            "suspicion raised on node"
        );
        self.node_blacklister.report_suspicion(node.as_str(), code);
    }

    fn report_suspicious_client(&mut self, addr: &str) {
        tracing::warn!(node = %self.name, addr, "suspicion raised on client");
        self.client_blacklister.blacklist(addr);
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Dumps current statistics to the log.
    pub fn log_stats(&self) {
        let now = self.clock.now();
        tracing::info!(
            node = %self.name,
            status = ?self.status,
            view = %self.view_no,
            rank = self.rank,
            f = self.f,
            replicas = self.replicas.len(),
            node_inbox = self.node_inbox.len(),
            client_inbox = self.client_inbox.len(),
            pending_requests = self.requests.len(),
            scheduled_actions = self.actions.len(),
            ledger_size = self.ledger.len(),
            metrics = %self.monitor.pretty_metrics(now),
            "node stats"
        );
    }
}
