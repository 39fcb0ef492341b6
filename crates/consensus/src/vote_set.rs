//! Per-(height, round, type) vote tallying.

use crate::error::{ConflictingVotes, VoteSetError};
use crate::InvariantError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tenderbft_types::{signing, BlockId, Commit, ValidatorSet, Vote, VoteType};
use tracing::trace;

/// Collects signed votes for one `(height, round, type)`, indexed by
/// validator, and tracks the voting-power thresholds.
///
/// A validator contributes at most one vote. Tallies only grow, and the
/// first block id to pass two-thirds of the total power is recorded as
/// the majority and never changes afterwards.
#[derive(Clone)]
pub struct VoteSet {
    chain_id: String,
    height: u64,
    round: i32,
    vote_type: VoteType,
    validators: Arc<ValidatorSet>,
    votes: Vec<Option<Vote>>,
    power_by_block: HashMap<BlockId, u64>,
    /// Total power that has voted, for any block id.
    sum: u64,
    maj23: Option<BlockId>,
}

impl VoteSet {
    pub fn new(
        chain_id: String,
        height: u64,
        round: i32,
        vote_type: VoteType,
        validators: Arc<ValidatorSet>,
    ) -> Self {
        let len = validators.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validators,
            votes: vec![None; len],
            power_by_block: HashMap::new(),
            sum: 0,
            maj23: None,
        }
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> i32 {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Add a signed vote. `Ok(true)` when newly counted, `Ok(false)` for
    /// a byte-identical duplicate.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        if vote.height != self.height || vote.round != self.round {
            return Err(VoteSetError::PositionMismatch {
                height: self.height,
                round: self.round,
                got_height: vote.height,
                got_round: vote.round,
            });
        }
        if vote.vote_type != self.vote_type {
            return Err(VoteSetError::TypeMismatch);
        }

        let index = vote.validator_index;
        let validator = self
            .validators
            .by_index(index)
            .ok_or(VoteSetError::InvalidIndex { index })?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::AddressMismatch { index });
        }

        let sign_bytes = signing::vote_sign_bytes(&self.chain_id, &vote);
        if !validator.public_key.verify(&sign_bytes, &vote.signature) {
            return Err(VoteSetError::InvalidSignature { index });
        }

        if let Some(existing) = &self.votes[index as usize] {
            if existing.block_id == vote.block_id {
                // Re-delivery of the same vote; gossip does this freely.
                return Ok(false);
            }
            return Err(VoteSetError::Conflicting(Box::new(ConflictingVotes {
                existing: existing.clone(),
                new: vote,
            })));
        }

        let power = validator.voting_power;
        let block_power = self.power_by_block.entry(vote.block_id).or_insert(0);
        *block_power += power;
        let block_power = *block_power;
        self.sum += power;

        trace!(
            height = self.height,
            round = self.round,
            vote_type = %self.vote_type,
            index,
            block_power,
            sum = self.sum,
            "counted vote"
        );

        if self.maj23.is_none() && self.validators.has_two_thirds(block_power) {
            self.maj23 = Some(vote.block_id);
        }
        self.votes[index as usize] = Some(vote);
        Ok(true)
    }

    pub fn vote_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize).and_then(|v| v.as_ref())
    }

    /// +2/3 of the total power has voted, counting all block ids.
    pub fn has_two_thirds_any(&self) -> bool {
        self.validators.has_two_thirds(self.sum)
    }

    /// +2/3 of the total power agrees on one block id (possibly nil).
    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Every validator's vote is present.
    pub fn has_all(&self) -> bool {
        self.sum == self.validators.total_power()
    }

    /// The majority block id, once one exists.
    pub fn two_thirds_majority(&self) -> Option<BlockId> {
        self.maj23
    }

    /// Build the commit justified by this set. Only valid for a precommit
    /// set with a non-nil majority.
    pub fn make_commit(&self) -> Result<Commit, InvariantError> {
        if self.vote_type != VoteType::Precommit {
            return Err(InvariantError(format!(
                "make_commit on a {} set",
                self.vote_type
            )));
        }
        let block_id = match self.maj23 {
            Some(id) if !id.is_nil() => id,
            other => {
                return Err(InvariantError(format!(
                    "make_commit without a +2/3 block majority (have {other:?})"
                )))
            }
        };
        let precommits = self
            .votes
            .iter()
            .map(|v| v.clone().filter(|vote| vote.block_id == block_id))
            .collect();
        Ok(Commit {
            block_id,
            round: self.round,
            precommits,
        })
    }
}

impl fmt::Debug for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoteSet")
            .field("height", &self.height)
            .field("round", &self.round)
            .field("type", &self.vote_type)
            .field("sum", &self.sum)
            .field("total", &self.validators.total_power())
            .field("maj23", &self.maj23)
            .finish()
    }
}

impl fmt::Display for VoteSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VoteSet{{{}/{} {} {}/{}}}",
            self.height,
            self.round,
            self.vote_type,
            self.sum,
            self.validators.total_power()
        )
    }
}
