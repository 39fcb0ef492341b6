//! Consensus blocks.

use crate::{Commit, ExecPayload, Hash, PartSet, Tx3ProofData, TxKind};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block chain id {got:?} does not match {expected:?}")]
    ChainIdMismatch { expected: String, got: String },

    #[error("block height {got} does not match expected {expected}")]
    HeightMismatch { expected: u64, got: u64 },

    #[error("block validators hash does not match the active validator set")]
    ValidatorsHashMismatch,

    #[error("block above height 1 carries an empty last commit")]
    MissingLastCommit,

    #[error("withdrawal at position {index} has no matching proof data")]
    MissingTx3Proof { index: usize },

    #[error("malformed block bytes: {0}")]
    Decode(String),
}

/// A block as agreed by consensus: the execution payload plus the
/// consensus metadata that binds it into the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub chain_id: String,
    /// Proposal time in milliseconds.
    pub time: u64,
    /// +2/3 precommits for the previous height.
    pub last_commit: Commit,
    /// Hash of the validator set this block was proposed under.
    pub validators_hash: Hash,
    pub epoch_number: u64,
    /// Serialized next-epoch descriptor, or empty.
    pub epoch_bytes: Vec<u8>,
    pub payload: ExecPayload,
    /// Cross-chain proofs for the payload's main-chain withdrawals, in
    /// payload order.
    pub tx3_proofs: Vec<Tx3ProofData>,
    /// The locally observed commit, attached at finalization. Not part of
    /// the block identity: replicas may see different (equally valid)
    /// commits for the same block.
    pub seen_commit: Option<Commit>,
}

impl Block {
    /// Build a block and split it into gossipable parts.
    #[allow(clippy::too_many_arguments)]
    pub fn make(
        height: u64,
        chain_id: String,
        time: u64,
        last_commit: Commit,
        payload: ExecPayload,
        validators_hash: Hash,
        epoch_number: u64,
        epoch_bytes: Vec<u8>,
        tx3_proofs: Vec<Tx3ProofData>,
        part_size: usize,
    ) -> (Block, PartSet) {
        let block = Block {
            height,
            chain_id,
            time,
            last_commit,
            validators_hash,
            epoch_number,
            epoch_bytes,
            payload,
            tx3_proofs,
            seen_commit: None,
        };
        let parts = PartSet::from_bytes(&block.to_bytes(), part_size);
        (block, parts)
    }

    /// The block identity hash. Excludes `seen_commit`.
    pub fn hash(&self) -> Hash {
        let identity = (
            self.height,
            &self.chain_id,
            self.time,
            &self.last_commit,
            &self.validators_hash,
            self.epoch_number,
            &self.epoch_bytes,
            &self.payload,
            &self.tx3_proofs,
        );
        Hash::of(&bincode::serialize(&identity).expect("block serialization is infallible"))
    }

    /// Nil-safe hash comparison.
    pub fn hashes_to(&self, hash: Hash) -> bool {
        !hash.is_zero() && self.hash() == hash
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        bincode::deserialize(bytes).map_err(|e| BlockError::Decode(e.to_string()))
    }

    /// Structural validity against the chain position the block claims.
    pub fn validate_basic(
        &self,
        chain_id: &str,
        expected_height: u64,
        validators_hash: Hash,
    ) -> Result<(), BlockError> {
        if self.chain_id != chain_id {
            return Err(BlockError::ChainIdMismatch {
                expected: chain_id.to_string(),
                got: self.chain_id.clone(),
            });
        }
        if self.height != expected_height {
            return Err(BlockError::HeightMismatch {
                expected: expected_height,
                got: self.height,
            });
        }
        if self.validators_hash != validators_hash {
            return Err(BlockError::ValidatorsHashMismatch);
        }
        if self.height > 1 && self.last_commit.is_empty() {
            return Err(BlockError::MissingLastCommit);
        }
        // Withdrawals and proofs must pair off one-to-one, in order.
        let withdrawals = self
            .payload
            .transactions
            .iter()
            .filter(|tx| matches!(tx.kind, TxKind::WithdrawFromMainChain { .. }))
            .count();
        if withdrawals > self.tx3_proofs.len() {
            return Err(BlockError::MissingTx3Proof {
                index: self.tx3_proofs.len(),
            });
        }
        Ok(())
    }

    /// Whether committing this block obligates broadcasting TX3 proof
    /// data to the main chain.
    pub fn has_child_chain_withdrawal(&self) -> bool {
        self.payload
            .transactions
            .iter()
            .any(|tx| matches!(tx.kind, TxKind::WithdrawFromChildChain))
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block{{h:{} txs:{} {:?}}}",
            self.height,
            self.payload.transactions.len(),
            self.hash()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlockId, PartSet, Transaction};

    fn payload() -> ExecPayload {
        ExecPayload {
            parent_hash: Hash::of(b"parent"),
            number: 41,
            timestamp: 1_000,
            transactions: vec![Transaction::transfer(vec![1, 2, 3])],
        }
    }

    /// A commit with one (absent) precommit slot, as a stand-in for the
    /// previous height's real commit.
    fn last_commit() -> Commit {
        Commit {
            block_id: BlockId::new(Hash::of(b"prev"), crate::PartSetHeader::empty()),
            round: 0,
            precommits: vec![None],
        }
    }

    fn block() -> (Block, PartSet) {
        Block::make(
            42,
            "child-0".to_string(),
            1_000,
            last_commit(),
            payload(),
            Hash::of(b"validators"),
            1,
            Vec::new(),
            Vec::new(),
            64,
        )
    }

    #[test]
    fn test_parts_round_trip() {
        let (block, parts) = block();
        let decoded = Block::from_bytes(&parts.assemble().unwrap()).unwrap();
        assert_eq!(block, decoded);
        assert_eq!(block.hash(), decoded.hash());
    }

    #[test]
    fn test_seen_commit_outside_identity() {
        let (mut block, _) = block();
        let before = block.hash();
        block.seen_commit = Some(last_commit());
        assert_eq!(before, block.hash());
    }

    #[test]
    fn test_validate_basic() {
        let (block, _) = block();
        block
            .validate_basic("child-0", 42, Hash::of(b"validators"))
            .unwrap();
        assert!(matches!(
            block.validate_basic("other", 42, Hash::of(b"validators")),
            Err(BlockError::ChainIdMismatch { .. })
        ));
        assert!(matches!(
            block.validate_basic("child-0", 7, Hash::of(b"validators")),
            Err(BlockError::HeightMismatch { .. })
        ));
        assert!(matches!(
            block.validate_basic("child-0", 42, Hash::of(b"other")),
            Err(BlockError::ValidatorsHashMismatch)
        ));
    }

    #[test]
    fn test_missing_last_commit_rejected() {
        let (mut block, _) = block();
        block.last_commit = Commit::empty();
        assert!(matches!(
            block.validate_basic("child-0", 42, Hash::of(b"validators")),
            Err(BlockError::MissingLastCommit)
        ));
    }

    #[test]
    fn test_unproven_withdrawal_rejected() {
        let (mut block, _) = block();
        block.payload.transactions.push(Transaction {
            kind: TxKind::WithdrawFromMainChain {
                chain_id: "main".to_string(),
                tx_hash: Hash::of(b"tx3"),
            },
            data: Vec::new(),
        });
        assert!(matches!(
            block.validate_basic("child-0", 42, Hash::of(b"validators")),
            Err(BlockError::MissingTx3Proof { .. })
        ));
    }

    #[test]
    fn test_hashes_to_is_nil_safe() {
        let (block, _) = block();
        assert!(!block.hashes_to(Hash::ZERO));
        assert!(block.hashes_to(block.hash()));
    }
}
