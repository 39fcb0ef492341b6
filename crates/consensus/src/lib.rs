//! Tendermint-family BFT consensus.
//!
//! Drives a replicated log of blocks among a known validator set. Each
//! height runs numbered rounds of Propose → Prevote → Precommit; a block
//! is committed once more than two-thirds of the voting power precommits
//! it. Under a timely network the happy path commits in one round; under
//! arbitrary delay or up to one-third Byzantine power the protocol stays
//! safe and never commits conflicting blocks.
//!
//! # Architecture
//!
//! The state machine ([`ConsensusState`]) is synchronous and does no I/O:
//! events in, actions out. The driver ([`ConsensusDriver`]) runs it on a
//! single tokio task, serializing three input streams — peer messages,
//! our own internal messages, and [`TimeoutTicker`] timeouts — and
//! executing the returned actions.
//!
//! Collaborators (execution backend, cross-chain helper, signer) are
//! trait objects defined in `tenderbft-core`; the block, vote, and
//! validator types live in `tenderbft-types`.

mod config;
mod driver;
mod error;
mod height_vote_set;
mod round_state;
mod state;
mod ticker;
mod vote_set;

pub use config::ConsensusConfig;
pub use driver::{ConsensusDriver, ConsensusHandle, ShutdownHandle};
pub use error::{ConflictingVotes, ConsensusError, InvariantError, VoteSetError};
pub use height_vote_set::HeightVoteSet;
pub use round_state::RoundState;
pub use state::{ConsensusState, DefaultBehavior, RecoveredState, RoundBehavior};
pub use ticker::TimeoutTicker;
pub use vote_set::VoteSet;
