//! Foundation types for tenderbft consensus.
//!
//! This crate provides the types shared across the consensus
//! implementation:
//!
//! - **Primitives**: [`Hash`], keys, signatures, addresses
//! - **Wire types**: [`Vote`], [`Proposal`], [`Part`], [`Commit`]
//! - **Chain types**: [`Block`], [`ExecPayload`], [`Epoch`]
//! - **Validators**: [`Validator`], [`ValidatorSet`] with the
//!   accumulator-based proposer rotation
//! - **Signing**: canonical, chain-id-keyed sign-bytes encodings
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not
//! depend on any other workspace crates, making it the foundation layer.

mod crypto;
mod hash;
pub mod merkle;
pub mod signing;

mod block;
mod commit;
mod epoch;
mod part_set;
mod payload;
mod proposal;
mod validator;
mod vote;

pub use block::{Block, BlockError};
pub use commit::Commit;
pub use crypto::{Address, KeyPair, PublicKey, Signature};
pub use epoch::{Epoch, EpochError};
pub use hash::Hash;
pub use merkle::MerkleProof;
pub use part_set::{Part, PartSet, PartSetError, PartSetHeader};
pub use payload::{ExecPayload, Transaction, Tx3ProofData, TxKind};
pub use proposal::Proposal;
pub use validator::{Validator, ValidatorSet};
pub use vote::{BlockId, Vote, VoteType};
