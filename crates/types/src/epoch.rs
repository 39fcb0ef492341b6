//! Epochs: height spans with a fixed validator set.
//!
//! Epoch transitions travel in-band: near the end of an epoch the
//! proposer embeds the next epoch's descriptor in a block's `epoch_bytes`,
//! and every replica adopts it when the chain reaches its start height.

use crate::ValidatorSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fraction of an epoch after which proposing the next one begins
/// (numerator over [`PROPOSE_DENOMINATOR`]).
const PROPOSE_NUMERATOR: u64 = 3;
const PROPOSE_DENOMINATOR: u64 = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EpochError {
    #[error("epoch number {got} does not follow {current}")]
    NumberNotSequential { current: u64, got: u64 },

    #[error("epoch start {got} does not follow previous end {expected}")]
    StartNotContiguous { expected: u64, got: u64 },

    #[error("epoch end {end} not after start {start}")]
    EmptySpan { start: u64, end: u64 },

    #[error("epoch has no validators")]
    NoValidators,

    #[error("malformed epoch bytes: {0}")]
    Decode(String),
}

/// One epoch of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Epoch {
    pub number: u64,
    /// First height governed by this epoch.
    pub start_block: u64,
    /// Last height governed by this epoch (inclusive).
    pub end_block: u64,
    pub validators: ValidatorSet,
}

impl Epoch {
    pub fn new(number: u64, start_block: u64, end_block: u64, validators: ValidatorSet) -> Self {
        Self {
            number,
            start_block,
            end_block,
            validators,
        }
    }

    pub fn span(&self) -> u64 {
        self.end_block - self.start_block + 1
    }

    pub fn contains(&self, height: u64) -> bool {
        (self.start_block..=self.end_block).contains(&height)
    }

    /// Whether a proposer at `height` should embed the next epoch's
    /// descriptor: true in the final quarter of the span.
    pub fn should_propose_next_epoch(&self, height: u64) -> bool {
        if !self.contains(height) {
            return false;
        }
        let elapsed = height - self.start_block + 1;
        elapsed * PROPOSE_DENOMINATOR >= self.span() * PROPOSE_NUMERATOR
    }

    /// Draft the next epoch. The validator set carries over; set changes
    /// are applied by governance outside consensus before proposing.
    pub fn propose_next_epoch(&self) -> Epoch {
        Epoch {
            number: self.number + 1,
            start_block: self.end_block + 1,
            end_block: self.end_block + self.span(),
            validators: self.validators.clone(),
        }
    }

    /// Validate a proposed successor epoch against this one.
    pub fn validate_next_epoch(&self, next: &Epoch) -> Result<(), EpochError> {
        if next.number != self.number + 1 {
            return Err(EpochError::NumberNotSequential {
                current: self.number,
                got: next.number,
            });
        }
        if next.start_block != self.end_block + 1 {
            return Err(EpochError::StartNotContiguous {
                expected: self.end_block + 1,
                got: next.start_block,
            });
        }
        if next.end_block <= next.start_block {
            return Err(EpochError::EmptySpan {
                start: next.start_block,
                end: next.end_block,
            });
        }
        if next.validators.is_empty() {
            return Err(EpochError::NoValidators);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("epoch serialization is infallible")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EpochError> {
        bincode::deserialize(bytes).map_err(|e| EpochError::Decode(e.to_string()))
    }
}
