//! Execution payloads and cross-chain proof data.
//!
//! The execution engine ("miner") produces candidate payloads; consensus
//! orders them without interpreting their contents, except to recognize
//! the two cross-chain withdrawal transaction kinds.

use crate::Hash;
use serde::{Deserialize, Serialize};

/// Transaction kinds consensus needs to distinguish. Everything else is
/// opaque `Transfer` data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Ordinary application transaction.
    Transfer,
    /// Withdrawal completion on the child chain (TX4). Must be accompanied
    /// by proof data for the originating main-chain transaction.
    WithdrawFromMainChain { chain_id: String, tx_hash: Hash },
    /// Withdrawal origin on the child chain (TX3). Its inclusion obligates
    /// the proposer to broadcast proof data to the main chain.
    WithdrawFromChildChain,
}

/// A transaction inside an execution payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn transfer(data: Vec<u8>) -> Self {
        Self {
            kind: TxKind::Transfer,
            data,
        }
    }

    pub fn hash(&self) -> Hash {
        Hash::of(&bincode::serialize(self).expect("transaction serialization is infallible"))
    }
}

/// Candidate block payload supplied by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecPayload {
    /// Hash of the parent execution block.
    pub parent_hash: Hash,
    /// Execution block number.
    pub number: u64,
    /// Proposal timestamp in milliseconds.
    pub timestamp: u64,
    pub transactions: Vec<Transaction>,
}

impl ExecPayload {
    pub fn hash(&self) -> Hash {
        Hash::of(&bincode::serialize(self).expect("payload serialization is infallible"))
    }
}

/// Opaque proof that a TX3 withdrawal was included on its source chain.
/// Produced and validated by the cross-chain helper; consensus only
/// carries it alongside the matching TX4.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx3ProofData {
    pub chain_id: String,
    pub tx_hash: Hash,
    pub proof_bytes: Vec<u8>,
}
