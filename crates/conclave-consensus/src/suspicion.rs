//! Misbehavior codes raised against peers.
//!
//! A suspicion is a value, not an exception: protocol handlers emit it
//! through their outbox and the node converts it into a blacklist action
//! when the code is in the known table.

use conclave_types::NodeName;
use serde::{Deserialize, Serialize};

/// Known misbehavior codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SuspicionCode {
    /// A message signature did not verify.
    InvalidSignature,
    /// PRE-PREPARE received from a replica that is not the primary.
    PprFromNonPrimary,
    /// PRE-PREPARE addressed to the primary itself.
    PprToPrimary,
    /// Second PRE-PREPARE for the same sequence number with a different
    /// digest.
    DuplicatePprSent,
    /// Second PREPARE from one replica for the same sequence number.
    DuplicatePrSent,
    /// PREPARE for a sequence number with no known PRE-PREPARE.
    UnknownPrSent,
    /// PREPARE sent by the primary, whose PRE-PREPARE already counts.
    PrFromPrimary,
    /// Second COMMIT from one replica for the same sequence number.
    DuplicateCmSent,
    /// COMMIT for a sequence number with no known PRE-PREPARE.
    UnknownCmSent,
    /// Second INSTANCE_CHANGE vote from one node for the same view.
    DuplicateInstChng,
    /// Second NOMINATE from one node in the same election round.
    DuplicateNomSent,
    /// Second PRIMARY declaration from one node in the same round.
    DuplicatePriSent,
    /// Second REELECTION from one node for the same round.
    DuplicateRelSent,
}

impl SuspicionCode {
    /// Stable numeric code, reported alongside blacklist actions.
    pub fn code(self) -> u16 {
        match self {
            SuspicionCode::InvalidSignature => 1,
            SuspicionCode::PprFromNonPrimary => 2,
            SuspicionCode::PprToPrimary => 3,
            SuspicionCode::DuplicatePprSent => 4,
            SuspicionCode::DuplicatePrSent => 5,
            SuspicionCode::UnknownPrSent => 6,
            SuspicionCode::PrFromPrimary => 7,
            SuspicionCode::DuplicateCmSent => 8,
            SuspicionCode::UnknownCmSent => 9,
            SuspicionCode::DuplicateInstChng => 10,
            SuspicionCode::DuplicateNomSent => 11,
            SuspicionCode::DuplicatePriSent => 12,
            SuspicionCode::DuplicateRelSent => 13,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            SuspicionCode::InvalidSignature => "invalid signature",
            SuspicionCode::PprFromNonPrimary => "PRE-PREPARE from non-primary",
            SuspicionCode::PprToPrimary => "PRE-PREPARE sent to primary",
            SuspicionCode::DuplicatePprSent => {
                "PRE-PREPARE being sent twice with different digest"
            }
            SuspicionCode::DuplicatePrSent => "PREPARE being sent twice",
            SuspicionCode::UnknownPrSent => "PREPARE for unknown PRE-PREPARE",
            SuspicionCode::PrFromPrimary => "PREPARE sent by primary",
            SuspicionCode::DuplicateCmSent => "COMMIT being sent twice",
            SuspicionCode::UnknownCmSent => "COMMIT for unknown PRE-PREPARE",
            SuspicionCode::DuplicateInstChng => "INSTANCE_CHANGE being sent twice",
            SuspicionCode::DuplicateNomSent => "NOMINATE being sent twice",
            SuspicionCode::DuplicatePriSent => "PRIMARY being sent twice",
            SuspicionCode::DuplicateRelSent => "REELECTION being sent twice",
        }
    }

    /// Whether a peer raising this code is blacklisted automatically.
    pub fn is_blacklistable(self) -> bool {
        // Every code in the known table earns a blacklist; unknown codes
        // only increment the suspicion count
        true
    }
}

impl std::fmt::Display for SuspicionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.reason(), self.code())
    }
}

/// A suspicion raised against a specific peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspicion {
    pub node: NodeName,
    pub code: SuspicionCode,
}

impl Suspicion {
    pub fn new(node: NodeName, code: SuspicionCode) -> Self {
        Self { node, code }
    }
}

impl std::fmt::Display for Suspicion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "suspicion on {}: {}", self.node, self.code)
    }
}
