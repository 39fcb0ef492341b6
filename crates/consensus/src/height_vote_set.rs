//! All vote sets for one height.

use crate::error::VoteSetError;
use crate::vote_set::VoteSet;
use std::collections::BTreeMap;
use std::sync::Arc;
use tenderbft_types::{BlockId, ValidatorSet, Vote, VoteType};

#[derive(Clone)]
struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
}

/// Prevote and precommit sets for every tracked round of a height.
///
/// `set_round(r)` keeps sets allocated through `r + 1`, so votes for the
/// next round arriving ahead of us are counted instead of dropped; votes
/// for rounds beyond that are rejected until we catch up.
#[derive(Clone)]
pub struct HeightVoteSet {
    chain_id: String,
    height: u64,
    validators: Arc<ValidatorSet>,
    round: i32,
    round_vote_sets: BTreeMap<i32, RoundVoteSet>,
}

impl HeightVoteSet {
    pub fn new(chain_id: String, height: u64, validators: Arc<ValidatorSet>) -> Self {
        let mut hvs = Self {
            chain_id,
            height,
            validators,
            round: 0,
            round_vote_sets: BTreeMap::new(),
        };
        hvs.add_round(0);
        hvs.add_round(1);
        hvs
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn round(&self) -> i32 {
        self.round
    }

    /// Track `round` as current, allocating empty sets through
    /// `round + 1`.
    pub fn set_round(&mut self, round: i32) {
        for r in 0..=round + 1 {
            self.add_round(r);
        }
        self.round = round;
    }

    fn add_round(&mut self, round: i32) {
        self.round_vote_sets.entry(round).or_insert_with(|| {
            let prevotes = VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Prevote,
                Arc::clone(&self.validators),
            );
            let precommits = VoteSet::new(
                self.chain_id.clone(),
                self.height,
                round,
                VoteType::Precommit,
                Arc::clone(&self.validators),
            );
            RoundVoteSet {
                prevotes,
                precommits,
            }
        });
    }

    /// Add a vote to the set for its round and type.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        let round = vote.round;
        let Some(rvs) = self.round_vote_sets.get_mut(&round) else {
            return Err(VoteSetError::UnallocatedRound { round });
        };
        match vote.vote_type {
            VoteType::Prevote => rvs.prevotes.add_vote(vote),
            VoteType::Precommit => rvs.precommits.add_vote(vote),
        }
    }

    pub fn prevotes(&self, round: i32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.prevotes)
    }

    pub fn precommits(&self, round: i32) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|r| &r.precommits)
    }

    /// The proof-of-lock: the highest round at or below the current one
    /// whose prevotes reached a non-nil majority. `(-1, nil)` when there
    /// is none.
    pub fn pol_info(&self) -> (i32, BlockId) {
        for round in (0..=self.round).rev() {
            if let Some(prevotes) = self.prevotes(round) {
                if let Some(block_id) = prevotes.two_thirds_majority() {
                    if !block_id.is_nil() {
                        return (round, block_id);
                    }
                }
            }
        }
        (-1, BlockId::nil())
    }
}

impl std::fmt::Debug for HeightVoteSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightVoteSet")
            .field("height", &self.height)
            .field("round", &self.round)
            .field("tracked_rounds", &self.round_vote_sets.len())
            .finish()
    }
}
