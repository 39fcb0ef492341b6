//! External collaborator interfaces.
//!
//! Consensus orders blocks; everything else — execution, storage, gossip,
//! cross-chain transport, key custody — lives behind these traits.

use crate::Message;
use tenderbft_types::{Block, Proposal, Signature, Tx3ProofData, Vote};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("block rejected: {0}")]
    InvalidBlock(String),

    #[error("commit failed: {0}")]
    CommitFailed(String),
}

#[derive(Debug, Error)]
pub enum CrossChainError {
    #[error("proof data invalid: {0}")]
    InvalidProof(String),

    #[error("main chain unreachable: {0}")]
    Unreachable(String),
}

#[derive(Debug, Error)]
pub enum SignerError {
    /// The signer refused to sign at an equal-or-lesser position than one
    /// it already signed. Overriding this check risks equivocation.
    #[error("double sign attempt at height {height} round {round} step {step}")]
    DoubleSign { height: u64, round: i32, step: u8 },

    #[error("signing failed: {0}")]
    Failed(String),
}

/// Read access to the committed chain.
pub trait ChainReader: Send + Sync {
    /// Height of the latest committed block.
    fn latest_height(&self) -> u64;

    /// Timestamp (ms) of the latest committed block.
    fn latest_time(&self) -> u64;
}

/// Announces consensus messages to peers. Gossip topology and transport
/// are the reactor's concern.
pub trait Broadcaster: Send + Sync {
    fn broadcast(&self, message: &Message);
}

/// The execution and persistence side of the node.
pub trait Backend: Send + Sync {
    /// Execute and persist a finalized block. Called serially from the
    /// driver, in height order.
    fn commit(&self, block: &Block, seals: &[Vec<u8>]) -> Result<(), BackendError>;

    /// Full application-level validation of a proposed block. Consensus
    /// prevotes nil when this fails.
    fn validate_block(&self, block: &Block) -> Result<(), BackendError>;

    fn chain_reader(&self) -> &dyn ChainReader;

    fn broadcaster(&self) -> &dyn Broadcaster;
}

/// Cross-chain proof plumbing for main↔child withdrawals.
pub trait CrossChainHelper: Send + Sync {
    /// Fetch locally known proof data for a main-chain withdrawal origin.
    fn tx3_proof_data(&self, chain_id: &str, tx_hash: &tenderbft_types::Hash)
        -> Option<Tx3ProofData>;

    /// Verify proof data against the main chain's light state.
    fn validate_tx3_proof_data(&self, proof: &Tx3ProofData) -> Result<(), CrossChainError>;

    /// Verify a TX4 withdrawal completion against in-memory TX3 proof data.
    fn validate_tx4_with_proof(
        &self,
        tx: &tenderbft_types::Transaction,
        proof: &Tx3ProofData,
    ) -> Result<(), CrossChainError>;

    /// Ship a committed block's proof data to the main chain. May block
    /// for a long time; always invoked from a detached task.
    fn save_block_proof(&self, block: &Block) -> Result<(), CrossChainError>;

    /// Broadcast TX3 proof data for a committed block to the main chain.
    /// May block for a long time; always invoked from a detached task.
    fn broadcast_tx3_proof(&self, block: &Block) -> Result<(), CrossChainError>;
}

/// Custodian of the validator's signing key.
///
/// Implementations must track the last signed `(height, round, step)` and
/// refuse to sign at an equal-or-lesser position with different content.
pub trait PrivValidator: Send + Sync {
    fn address(&self) -> tenderbft_types::Address;

    fn sign_vote(&self, chain_id: &str, vote: &Vote) -> Result<Signature, SignerError>;

    fn sign_proposal(&self, chain_id: &str, proposal: &Proposal) -> Result<Signature, SignerError>;
}
