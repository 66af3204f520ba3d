//! # conclave-types: Core types for Conclave
//!
//! This crate contains shared types used across the Conclave system:
//! - Cluster identity ([`NodeName`] and rank ordering)
//! - Client identity ([`ClientId`], [`ReqId`], [`RequestKey`])
//! - Protocol counters ([`ViewNo`], [`InstId`], [`PpSeqNo`], [`SeqNo`])
//! - Cryptographic digests ([`struct@Hash`], [`Digest`], [`TxnId`])
//! - Temporal types ([`Timestamp`])
//! - Cluster arithmetic ([`max_failures`], [`quorum`], [`num_instances`])

use std::{
    fmt::{Debug, Display},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// Cluster Identity
// ============================================================================

/// Cluster-unique name of a node.
///
/// Node names define a total order: the position of a name in the
/// lexicographically sorted list of all names is the node's *rank*,
/// used for deterministic primary nomination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeName(String);

impl NodeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rank of this node within the full registry: the index of its name
    /// in the sorted list of all names.
    ///
    /// Returns `None` if the name is not part of the registry.
    pub fn rank(&self, all: &[NodeName]) -> Option<usize> {
        let mut sorted: Vec<&NodeName> = all.iter().collect();
        sorted.sort();
        sorted.iter().position(|n| *n == self)
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for NodeName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Returns the registry sorted by rank (lexicographically).
pub fn ranked(all: &[NodeName]) -> Vec<NodeName> {
    let mut sorted = all.to_vec();
    sorted.sort();
    sorted
}

// ============================================================================
// Client Identity
// ============================================================================

/// Identifier of a client as it appears in signed requests.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Per-client monotonically increasing request number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ReqId(u64);

impl ReqId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for ReqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ReqId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The identity of a request across the cluster: `(client, req_id)`.
pub type RequestKey = (ClientId, ReqId);

// ============================================================================
// Protocol Counters
// ============================================================================

/// View number: configuration epoch naming the current set of primaries.
/// Non-decreasing on every correct node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ViewNo(u64);

impl ViewNo {
    pub const ZERO: ViewNo = ViewNo(0);

    pub fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The view entered after a successful instance change on this view.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for ViewNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Protocol instance identifier, `0..f+1`. Instance 0 is the master.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct InstId(u8);

impl InstId {
    pub const MASTER: InstId = InstId(0);

    pub fn new(id: u8) -> Self {
        Self(id)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }

    pub fn is_master(self) -> bool {
        self.0 == 0
    }
}

impl Display for InstId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sequence number assigned by a primary in PRE-PREPARE, contiguous from 1
/// per `(view, instance)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PpSeqNo(u64);

impl PpSeqNo {
    pub const ZERO: PpSeqNo = PpSeqNo(0);

    pub fn new(s: u64) -> Self {
        Self(s)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Display for PpSeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record in the ledger, 1-based: the record stored at
/// index `i` carries `seq_no = i + 1`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SeqNo(u64);

impl SeqNo {
    pub fn new(s: u64) -> Self {
        Self(s)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for SeqNo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Cryptographic Hash
// ============================================================================

/// Length of cryptographic hashes in bytes (SHA-256).
pub const HASH_LENGTH: usize = 32;

fn write_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

fn parse_hex(s: &str) -> Option<[u8; HASH_LENGTH]> {
    if s.len() != HASH_LENGTH * 2 {
        return None;
    }
    let mut out = [0u8; HASH_LENGTH];
    for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
        let hi = char::from(chunk[0]).to_digit(16)?;
        let lo = char::from(chunk[1]).to_digit(16)?;
        out[i] = ((hi << 4) | lo) as u8;
    }
    Some(out)
}

/// A 32-byte SHA-256 hash.
///
/// Serialized on the wire and on disk as a lowercase hex string so that
/// replies and ledger lines are byte-stable across nodes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_LENGTH]);

impl Hash {
    /// The all-zero hash, used as the root of an empty Merkle tree.
    pub const EMPTY: Hash = Hash([0u8; HASH_LENGTH]);

    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        parse_hex(s).map(Self)
    }
}

impl Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // First 8 bytes are enough to tell hashes apart in logs
        write!(
            f,
            "Hash({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_hex(f, &self.0)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; HASH_LENGTH]> for Hash {
    fn from(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex hash"))
    }
}

/// SHA-256 digest of a request's canonical serialization.
pub type Digest = Hash;

/// Transaction identifier: SHA-256 of `client_id || req_id`, rendered hex.
///
/// Deterministic across nodes, which is what makes replies for the same
/// request byte-identical cluster-wide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnId([u8; HASH_LENGTH]);

impl TxnId {
    pub fn from_bytes(bytes: [u8; HASH_LENGTH]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LENGTH] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        parse_hex(s).map(Self)
    }
}

impl Debug for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TxnId(")?;
        write_hex(f, &self.0)?;
        write!(f, ")")
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write_hex(f, &self.0)
    }
}

impl Serialize for TxnId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TxnId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TxnId::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid hex txn id"))
    }
}

// ============================================================================
// Timestamp
// ============================================================================

/// Wall-clock timestamp in nanoseconds since the Unix epoch.
///
/// Carried as `pp_time` in PRE-PREPARE and as `txn_time` in replies; the
/// primary's value flows through unmodified so that every node produces
/// the same reply bytes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    pub fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs(self) -> u64 {
        self.0 / 1_000_000_000
    }

    /// Current wall-clock time.
    ///
    /// # Panics
    ///
    /// Panics if the system clock is before the Unix epoch.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before Unix epoch");
        Self(duration.as_nanos() as u64)
    }

    /// Strictly-increasing timestamp: `max(now, last + 1ns)`.
    pub fn now_monotonic(last: Option<Timestamp>) -> Self {
        let now = Self::now();
        match last {
            Some(prev) if now.0 <= prev.0 => Timestamp(prev.0.saturating_add(1)),
            _ => now,
        }
    }

    pub fn saturating_add(self, d: std::time::Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos() as u64))
    }

    pub fn saturating_sub(self, earlier: Timestamp) -> std::time::Duration {
        std::time::Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let secs = self.0 / 1_000_000_000;
        let nanos = self.0 % 1_000_000_000;
        write!(f, "{secs}.{nanos:09}")
    }
}

impl From<u64> for Timestamp {
    fn from(nanos: u64) -> Self {
        Self(nanos)
    }
}

// ============================================================================
// Cluster Arithmetic
// ============================================================================

/// Maximum number of Byzantine faults a cluster of `n` nodes tolerates:
/// `f = (n - 1) / 3`.
pub fn max_failures(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// Quorum of a cluster of `n` nodes: `2f + 1` distinct votes.
pub fn quorum(n: usize) -> usize {
    2 * max_failures(n) + 1
}

/// Weak quorum: `f + 1` distinct votes guarantee at least one honest voter.
pub fn weak_quorum(n: usize) -> usize {
    max_failures(n) + 1
}

/// Number of parallel protocol instances run by each node: `f + 1`.
pub fn num_instances(n: usize) -> usize {
    max_failures(n) + 1
}

#[cfg(test)]
mod tests;
