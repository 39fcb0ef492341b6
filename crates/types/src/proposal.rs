//! Round proposals.

use crate::{BlockId, PartSetHeader, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A signed proposal naming the part set of the proposed block.
///
/// `pol_round` is `-1` when the proposal carries no proof-of-lock
/// reference; otherwise it names an earlier round of this height whose
/// prevotes justify re-proposing a locked block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: i32,
    pub block_parts: PartSetHeader,
    pub pol_round: i32,
    pub pol_block_id: BlockId,
    pub signature: Signature,
}

impl Proposal {
    /// Build an unsigned proposal; the signer fills in `signature`.
    pub fn new(
        height: u64,
        round: i32,
        block_parts: PartSetHeader,
        pol_round: i32,
        pol_block_id: BlockId,
    ) -> Self {
        Self {
            height,
            round,
            block_parts,
            pol_round,
            pol_block_id,
            signature: Signature::zero(),
        }
    }
}

impl fmt::Display for Proposal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal{{{}/{} {} pol:{}}}",
            self.height, self.round, self.block_parts, self.pol_round
        )
    }
}
