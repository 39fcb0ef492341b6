//! Consensus error kinds.
//!
//! Transient faults (bad peers, late votes) are absorbed and logged by
//! the driver. [`InvariantError`] is different: it means a consensus
//! safety assumption no longer holds, and the driver aborts the process
//! rather than continue on corrupted state.

use tenderbft_types::Vote;
use thiserror::Error;

/// Equivocation evidence: two differing signed votes from the same
/// validator at the same height, round, and type.
#[derive(Debug, Clone)]
pub struct ConflictingVotes {
    pub existing: Vote,
    pub new: Vote,
}

/// Errors from adding a vote to a vote set.
#[derive(Debug, Error)]
pub enum VoteSetError {
    #[error("vote for {got_height}/{got_round} added to set for {height}/{round}")]
    PositionMismatch {
        height: u64,
        round: i32,
        got_height: u64,
        got_round: i32,
    },

    #[error("vote type mismatch")]
    TypeMismatch,

    #[error("validator index {index} out of range")]
    InvalidIndex { index: u32 },

    #[error("vote address does not match validator {index}")]
    AddressMismatch { index: u32 },

    #[error("invalid vote signature from validator {index}")]
    InvalidSignature { index: u32 },

    #[error("conflicting votes from validator {}", .0.existing.validator_index)]
    Conflicting(Box<ConflictingVotes>),

    #[error("no vote set allocated for round {round}")]
    UnallocatedRound { round: i32 },
}

/// Errors surfaced by the state machine's message handlers.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("no miner block available to propose")]
    MinerBlockAbsent,

    #[error("invalid proposal signature")]
    InvalidProposalSignature,

    #[error("invalid proposal POL round")]
    InvalidProposalPOLRound,

    #[error("failed to add vote: {0}")]
    AddingVoteFailed(#[source] VoteSetError),

    #[error("vote height does not match current height")]
    VoteHeightMismatch,

    #[error("conflicting votes from validator {}", .0.existing.validator_index)]
    ConflictingVotes(Box<ConflictingVotes>),

    #[error(transparent)]
    Invariant(#[from] InvariantError),
}

/// A consensus safety assumption was violated. Never absorbed: the driver
/// logs it and aborts the process.
#[derive(Debug, Error)]
#[error("consensus invariant violated: {0}")]
pub struct InvariantError(pub String);

#[macro_export]
macro_rules! invariant_violation {
    ($($arg:tt)*) => {
        return Err($crate::InvariantError(format!($($arg)*)))
    };
}
