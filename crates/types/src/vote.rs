//! Votes and block identifiers.

use crate::{Address, Hash, PartSetHeader, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The two voting phases of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum VoteType {
    Prevote = 0x01,
    Precommit = 0x02,
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

/// Identifies a block: its hash plus the header of the part set it was
/// gossiped as. The nil block id (zero hash, empty parts) is a vote for
/// "nothing" at that height and round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: Hash,
    pub parts: PartSetHeader,
}

impl BlockId {
    pub fn new(hash: Hash, parts: PartSetHeader) -> Self {
        Self { hash, parts }
    }

    pub fn nil() -> Self {
        Self {
            hash: Hash::ZERO,
            parts: PartSetHeader::empty(),
        }
    }

    pub fn is_nil(&self) -> bool {
        self.hash.is_zero()
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else {
            write!(f, "{:?}@{}", self.hash, self.parts)
        }
    }
}

/// A signed prevote or precommit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub validator_address: Address,
    pub validator_index: u32,
    pub height: u64,
    pub round: i32,
    pub vote_type: VoteType,
    pub block_id: BlockId,
    pub signature: Signature,
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote{{{} {}/{} {} {}}}",
            self.validator_index, self.height, self.round, self.vote_type, self.block_id
        )
    }
}
