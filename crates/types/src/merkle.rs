//! Binary Merkle tree over blake3 leaf hashes.
//!
//! The tree splits at the largest power of two strictly below the leaf
//! count, so proofs are positional: verification recomputes the root from
//! `(index, total)` and the sibling path alone.

use crate::Hash;
use serde::{Deserialize, Serialize};

/// Domain prefix for inner nodes, so an inner hash can never collide with
/// a leaf hash.
const INNER_PREFIX: u8 = 0x01;

fn inner_hash(left: &Hash, right: &Hash) -> Hash {
    let mut buf = [0u8; 65];
    buf[0] = INNER_PREFIX;
    buf[1..33].copy_from_slice(left.as_bytes());
    buf[33..65].copy_from_slice(right.as_bytes());
    Hash::of(&buf)
}

/// Largest power of two strictly less than `n`. Requires `n >= 2`.
fn split_point(n: usize) -> usize {
    debug_assert!(n >= 2);
    let mut split = 1usize;
    while split * 2 < n {
        split *= 2;
    }
    split
}

/// Compute the Merkle root of a list of leaf hashes.
///
/// The empty list hashes to [`Hash::ZERO`].
pub fn root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        0 => Hash::ZERO,
        1 => leaves[0],
        n => {
            let split = split_point(n);
            inner_hash(&root(&leaves[..split]), &root(&leaves[split..]))
        }
    }
}

/// Positional Merkle membership proof.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Total number of leaves in the tree.
    pub total: u32,
    /// Index of the proven leaf.
    pub index: u32,
    /// Sibling hashes, leaf-adjacent first.
    pub siblings: Vec<Hash>,
}

impl MerkleProof {
    /// Recompute the root from `leaf` and compare against `expected_root`.
    pub fn verify(&self, leaf: Hash, expected_root: Hash) -> bool {
        if self.index >= self.total || self.total == 0 {
            return false;
        }
        match compute_root(self.index as usize, self.total as usize, leaf, &self.siblings) {
            Some(computed) => computed == expected_root,
            None => false,
        }
    }
}

/// Walk the sibling path back to the root. Returns `None` when the path
/// length does not match the tree shape.
fn compute_root(index: usize, total: usize, leaf: Hash, siblings: &[Hash]) -> Option<Hash> {
    match total {
        0 => None,
        1 => {
            if siblings.is_empty() {
                Some(leaf)
            } else {
                None
            }
        }
        _ => {
            let (last, rest) = siblings.split_last()?;
            let split = split_point(total);
            if index < split {
                let left = compute_root(index, split, leaf, rest)?;
                Some(inner_hash(&left, last))
            } else {
                let right = compute_root(index - split, total - split, leaf, rest)?;
                Some(inner_hash(last, &right))
            }
        }
    }
}

/// Build proofs for every leaf. `proofs(leaves)[i]` proves `leaves[i]`
/// against `root(leaves)`.
pub fn proofs(leaves: &[Hash]) -> Vec<MerkleProof> {
    let total = leaves.len();
    let mut out: Vec<MerkleProof> = (0..total)
        .map(|i| MerkleProof {
            total: total as u32,
            index: i as u32,
            siblings: Vec::new(),
        })
        .collect();
    if total > 0 {
        fill_proofs(leaves, 0, &mut out);
    }
    out
}

fn fill_proofs(leaves: &[Hash], offset: usize, out: &mut [MerkleProof]) {
    let n = leaves.len();
    if n <= 1 {
        return;
    }
    let split = split_point(n);
    // Recurse first so each path is ordered leaf-adjacent to root-adjacent.
    fill_proofs(&leaves[..split], offset, out);
    fill_proofs(&leaves[split..], offset + split, out);
    let left_root = root(&leaves[..split]);
    let right_root = root(&leaves[split..]);
    for proof in &mut out[offset..offset + split] {
        proof.siblings.push(right_root);
    }
    for proof in &mut out[offset + split..offset + n] {
        proof.siblings.push(left_root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<Hash> {
        (0..n).map(|i| Hash::of(&[i as u8])).collect()
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(root(&[]), Hash::ZERO);
        let l = leaves(1);
        assert_eq!(root(&l), l[0]);
    }

    #[test]
    fn test_all_proofs_verify() {
        for n in 1..=17 {
            let l = leaves(n);
            let r = root(&l);
            for (i, proof) in proofs(&l).iter().enumerate() {
                assert!(proof.verify(l[i], r), "n={n} i={i}");
            }
        }
    }

    #[test]
    fn test_wrong_leaf_rejected() {
        let l = leaves(7);
        let r = root(&l);
        let proof = &proofs(&l)[3];
        assert!(!proof.verify(Hash::of(b"not a leaf"), r));
    }

    #[test]
    fn test_wrong_position_rejected() {
        let l = leaves(8);
        let r = root(&l);
        let mut proof = proofs(&l)[2].clone();
        proof.index = 3;
        assert!(!proof.verify(l[2], r));
    }

    #[test]
    fn test_truncated_path_rejected() {
        let l = leaves(8);
        let r = root(&l);
        let mut proof = proofs(&l)[2].clone();
        proof.siblings.pop();
        assert!(!proof.verify(l[2], r));
    }
}
