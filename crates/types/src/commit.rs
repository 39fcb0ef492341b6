//! Commits: +2/3 precommits for one block at a single round.

use crate::{BlockId, Hash, Vote};
use serde::{Deserialize, Serialize};

/// The precommits that justified committing a block.
///
/// `precommits[i]` is validator `i`'s precommit for `block_id`, or `None`
/// if that validator's precommit was absent or for a different block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub block_id: BlockId,
    pub round: i32,
    pub precommits: Vec<Option<Vote>>,
}

impl Commit {
    /// The commit preceding height 1, which has no votes.
    pub fn empty() -> Self {
        Self {
            block_id: BlockId::nil(),
            round: 0,
            precommits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.precommits.is_empty()
    }

    /// Number of present precommits.
    pub fn count(&self) -> usize {
        self.precommits.iter().filter(|v| v.is_some()).count()
    }

    pub fn hash(&self) -> Hash {
        Hash::of(&bincode::serialize(self).expect("commit serialization is infallible"))
    }
}
