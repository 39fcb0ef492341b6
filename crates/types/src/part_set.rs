//! Chunked block transfer.
//!
//! A proposer serializes the block, splits it into fixed-size parts, and
//! gossips the parts under a Merkle-rooted header. Receivers verify each
//! part's proof against the header and reassemble the block once every
//! index is present.

use crate::merkle::{self, MerkleProof};
use crate::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Errors from part verification and assembly.
#[derive(Debug, Error)]
pub enum PartSetError {
    #[error("part index {index} out of bounds (total {total})")]
    IndexOutOfBounds { index: u32, total: u32 },

    #[error("part {index} failed Merkle verification")]
    InvalidProof { index: u32 },

    #[error("part set incomplete ({count}/{total})")]
    Incomplete { count: u32, total: u32 },
}

/// Identifies a complete part set: how many parts, and the Merkle root
/// over their hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub root: Hash,
}

impl PartSetHeader {
    /// Header of the empty part set, used in nil block identifiers.
    pub fn empty() -> Self {
        Self {
            total: 0,
            root: Hash::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

impl fmt::Display for PartSetHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.total, self.root)
    }
}

/// One chunk of a serialized block, with its membership proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub index: u32,
    pub bytes: Vec<u8>,
    pub proof: MerkleProof,
}

impl Part {
    pub fn hash(&self) -> Hash {
        Hash::of(&self.bytes)
    }
}

/// An in-progress (or complete) set of block parts.
#[derive(Debug, Clone)]
pub struct PartSet {
    header: PartSetHeader,
    parts: Vec<Option<Part>>,
    count: u32,
}

impl PartSet {
    /// Split serialized bytes into parts of at most `part_size` bytes.
    /// The resulting set is complete.
    pub fn from_bytes(data: &[u8], part_size: usize) -> Self {
        assert!(part_size > 0, "part size must be positive");
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(part_size).collect()
        };
        let leaf_hashes: Vec<Hash> = chunks.iter().map(|c| Hash::of(c)).collect();
        let root = merkle::root(&leaf_hashes);
        let proofs = merkle::proofs(&leaf_hashes);
        let parts: Vec<Option<Part>> = chunks
            .into_iter()
            .zip(proofs)
            .enumerate()
            .map(|(i, (bytes, proof))| {
                Some(Part {
                    index: i as u32,
                    bytes: bytes.to_vec(),
                    proof,
                })
            })
            .collect();
        let total = parts.len() as u32;
        Self {
            header: PartSetHeader { total, root },
            parts,
            count: total,
        }
    }

    /// Start an empty set that will be filled from gossip.
    pub fn from_header(header: PartSetHeader) -> Self {
        Self {
            parts: vec![None; header.total as usize],
            count: 0,
            header,
        }
    }

    pub fn header(&self) -> PartSetHeader {
        self.header
    }

    /// Whether this set was built for the given header.
    pub fn has_header(&self, header: PartSetHeader) -> bool {
        self.header == header
    }

    pub fn total(&self) -> u32 {
        self.header.total
    }

    /// Number of parts present.
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_complete(&self) -> bool {
        self.count == self.header.total
    }

    pub fn part(&self, index: u32) -> Option<&Part> {
        self.parts.get(index as usize).and_then(|p| p.as_ref())
    }

    /// Add a part. Returns `Ok(true)` when newly added, `Ok(false)` for a
    /// duplicate index (no-op).
    pub fn add_part(&mut self, part: Part, verify: bool) -> Result<bool, PartSetError> {
        let index = part.index;
        if index >= self.header.total {
            return Err(PartSetError::IndexOutOfBounds {
                index,
                total: self.header.total,
            });
        }
        if self.parts[index as usize].is_some() {
            return Ok(false);
        }
        if verify && !part.proof.verify(part.hash(), self.header.root) {
            return Err(PartSetError::InvalidProof { index });
        }
        self.parts[index as usize] = Some(part);
        self.count += 1;
        Ok(true)
    }

    /// Concatenate all parts back into the serialized block bytes.
    pub fn assemble(&self) -> Result<Vec<u8>, PartSetError> {
        if !self.is_complete() {
            return Err(PartSetError::Incomplete {
                count: self.count,
                total: self.header.total,
            });
        }
        let mut out = Vec::new();
        for part in self.parts.iter().flatten() {
            out.extend_from_slice(&part.bytes);
        }
        Ok(out)
    }
}
