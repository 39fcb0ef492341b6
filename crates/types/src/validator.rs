//! Validators and the accumulator-based proposer rotation.

use crate::{Address, Hash, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A consensus validator.
///
/// `accum` is the proposer-priority counter: each rotation step adds every
/// validator's voting power to its accumulator, selects the highest as
/// proposer, and subtracts the set's total power from the winner. Over
/// time each validator proposes proportionally to its power.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    pub address: Address,
    pub public_key: PublicKey,
    pub voting_power: u64,
    pub accum: i64,
}

impl Validator {
    pub fn new(public_key: PublicKey, voting_power: u64) -> Self {
        Self {
            address: public_key.address(),
            public_key,
            voting_power,
            accum: 0,
        }
    }
}

/// Ordered set of validators with precomputed total power.
///
/// Validators are kept sorted by address; indices into the set are the
/// `validator_index` carried in votes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    total_power: u64,
    /// Index of the proposer selected by the last rotation step, if any.
    proposer: Option<usize>,
}

impl ValidatorSet {
    /// Build a set from validators. Sorts by address; addresses must be
    /// unique and powers positive.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.address.cmp(&b.address));
        debug_assert!(
            validators.windows(2).all(|w| w[0].address != w[1].address),
            "duplicate validator address"
        );
        debug_assert!(validators.iter().all(|v| v.voting_power > 0));
        let total_power = validators.iter().map(|v| v.voting_power).sum();
        Self {
            validators,
            total_power,
            proposer: None,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn total_power(&self) -> u64 {
        self.total_power
    }

    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    pub fn by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    pub fn by_address(&self, address: &Address) -> Option<(u32, &Validator)> {
        self.validators
            .iter()
            .position(|v| v.address == *address)
            .map(|i| (i as u32, &self.validators[i]))
    }

    pub fn has_address(&self, address: &Address) -> bool {
        self.by_address(address).is_some()
    }

    /// Whether `power` is more than two-thirds of the total.
    pub fn has_two_thirds(&self, power: u64) -> bool {
        // power > total * 2/3, in overflow-safe u128 arithmetic.
        (power as u128) * 3 > (self.total_power as u128) * 2
    }

    /// The current proposer: the validator selected by the last rotation
    /// step, or the highest-accumulator validator for a fresh set.
    pub fn proposer(&self) -> &Validator {
        assert!(!self.validators.is_empty(), "empty validator set");
        match self.proposer {
            Some(i) => &self.validators[i],
            None => &self.validators[self.highest_accum()],
        }
    }

    /// Apply `times` rotation steps to the accumulators.
    pub fn increment_accum(&mut self, times: i32) {
        for _ in 0..times {
            for v in &mut self.validators {
                v.accum = v.accum.saturating_add(v.voting_power as i64);
            }
            let winner = self.highest_accum();
            self.validators[winner].accum -= self.total_power as i64;
            self.proposer = Some(winner);
        }
    }

    /// Index of the highest accumulator; ties break toward the lower
    /// address (the set is address-sorted, so the first maximum wins).
    fn highest_accum(&self) -> usize {
        let mut best = 0;
        for (i, v) in self.validators.iter().enumerate().skip(1) {
            if v.accum > self.validators[best].accum {
                best = i;
            }
        }
        best
    }

    /// Hash of the validator identities and powers (accumulators excluded:
    /// they are round-local state, not set identity).
    pub fn validators_hash(&self) -> Hash {
        let identity: Vec<(&Address, &PublicKey, u64)> = self
            .validators
            .iter()
            .map(|v| (&v.address, &v.public_key, v.voting_power))
            .collect();
        Hash::of(&bincode::serialize(&identity).expect("validator serialization is infallible"))
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ValidatorSet{{n:{} power:{}}}",
            self.len(),
            self.total_power
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn set(powers: &[u64]) -> ValidatorSet {
        let validators = powers
            .iter()
            .enumerate()
            .map(|(i, p)| Validator::new(KeyPair::from_seed(&[i as u8 + 1; 32]).public_key(), *p))
            .collect();
        ValidatorSet::new(validators)
    }

    #[test]
    fn test_two_thirds_threshold() {
        let vs = set(&[1, 1, 1, 1]);
        assert!(!vs.has_two_thirds(2));
        assert!(!vs.has_two_thirds(2 * 4 / 3));
        assert!(vs.has_two_thirds(3));
        assert!(vs.has_two_thirds(4));
    }

    #[test]
    fn test_equal_power_rotation_is_fair() {
        let mut vs = set(&[1, 1, 1, 1]);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..4 {
            vs.increment_accum(1);
            seen.insert(vs.proposer().address);
        }
        assert_eq!(seen.len(), 4, "each validator proposes once per cycle");
    }

    #[test]
    fn test_weighted_rotation_tracks_power() {
        let mut vs = set(&[3, 1]);
        let heavy = vs
            .validators()
            .iter()
            .max_by_key(|v| v.voting_power)
            .unwrap()
            .address;
        let mut heavy_turns = 0;
        for _ in 0..8 {
            vs.increment_accum(1);
            if vs.proposer().address == heavy {
                heavy_turns += 1;
            }
        }
        assert_eq!(heavy_turns, 6, "3/4 of turns go to 3/4 of the power");
    }

    #[test]
    fn test_multi_step_equals_repeated_single() {
        let mut a = set(&[5, 2, 2]);
        let mut b = a.clone();
        a.increment_accum(3);
        for _ in 0..3 {
            b.increment_accum(1);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_validators_hash_ignores_accum() {
        let mut a = set(&[1, 2, 3]);
        let before = a.validators_hash();
        a.increment_accum(5);
        assert_eq!(before, a.validators_hash());
    }

    #[test]
    fn test_lookup_round_trips() {
        let vs = set(&[1, 2, 3]);
        for (i, v) in vs.validators().iter().enumerate() {
            let (index, found) = vs.by_address(&v.address).unwrap();
            assert_eq!(index as usize, i);
            assert_eq!(found.address, v.address);
            assert_eq!(vs.by_index(index).unwrap().address, v.address);
        }
        assert!(vs.by_index(3).is_none());
    }
}
