//! The mutable record of the current round.

use crate::height_vote_set::HeightVoteSet;
use crate::vote_set::VoteSet;
use std::fmt;
use std::time::Duration;
use tenderbft_core::Step;
use tenderbft_types::{Block, PartSet, Proposal, ValidatorSet};

/// Everything the state machine knows about the height and round in
/// progress. Owned exclusively by the driver; observers get deep clones.
///
/// Times are measured on the driver's monotonic clock (duration since
/// driver start), which the deterministic tests drive by hand.
#[derive(Debug, Clone)]
pub struct RoundState {
    pub height: u64,
    pub round: i32,
    pub step: Step,
    /// Earliest time round 0 of this height may start.
    pub start_time: Duration,
    /// When +2/3 precommits for a block were first seen at this height.
    pub commit_time: Duration,
    /// Per-round working copy of the validator set; round changes advance
    /// its proposer accumulators.
    pub validators: ValidatorSet,
    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,
    /// Round we locked in, `-1` when unlocked.
    pub locked_round: i32,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,
    pub votes: HeightVoteSet,
    /// Round whose precommits are being committed, `-1` before commit.
    pub commit_round: i32,
    /// Precommits from the previous height, carried into this height's
    /// proposal block.
    pub last_commit: Option<VoteSet>,
}

impl RoundState {
    /// Nil-safe check whether the locked block hashes to `hash`.
    pub fn locked_block_hashes_to(&self, hash: tenderbft_types::Hash) -> bool {
        self.locked_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(hash))
    }

    /// Nil-safe check whether the proposal block hashes to `hash`.
    pub fn proposal_block_hashes_to(&self, hash: tenderbft_types::Hash) -> bool {
        self.proposal_block
            .as_ref()
            .is_some_and(|b| b.hashes_to(hash))
    }
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RoundState{{{}/{}/{} locked:{} proposal:{}}}",
            self.height,
            self.round,
            self.step,
            self.locked_round,
            self.proposal.is_some(),
        )
    }
}
