//! In-process signer with double-sign protection.

use crate::{PrivValidator, SignerError};
use parking_lot::Mutex;
use tenderbft_types::signing;
use tenderbft_types::{Address, KeyPair, Proposal, Signature, Vote, VoteType};

// Signing steps, ordered within a round: proposal before prevote before
// precommit. Stored so a restarted or re-entered signer can refuse to
// sign backwards.
const STEP_PROPOSE: u8 = 1;
const STEP_PREVOTE: u8 = 2;
const STEP_PRECOMMIT: u8 = 3;

fn vote_step(vote_type: VoteType) -> u8 {
    match vote_type {
        VoteType::Prevote => STEP_PREVOTE,
        VoteType::Precommit => STEP_PRECOMMIT,
    }
}

#[derive(Default)]
struct LastSign {
    height: u64,
    round: i32,
    step: u8,
    sign_bytes: Vec<u8>,
    signature: Option<Signature>,
}

/// Signer holding the key in memory.
///
/// Tracks the last signed `(height, round, step)`. Signing strictly below
/// that position fails with [`SignerError::DoubleSign`]; re-signing the
/// identical bytes at the same position returns the cached signature, so
/// retransmits are safe.
pub struct LocalSigner {
    keypair: KeyPair,
    last: Mutex<LastSign>,
}

impl LocalSigner {
    pub fn new(keypair: KeyPair) -> Self {
        Self {
            keypair,
            last: Mutex::new(LastSign::default()),
        }
    }

    fn sign_at(
        &self,
        height: u64,
        round: i32,
        step: u8,
        sign_bytes: Vec<u8>,
    ) -> Result<Signature, SignerError> {
        let mut last = self.last.lock();
        let pos = (height, round, step);
        let last_pos = (last.height, last.round, last.step);
        if pos < last_pos {
            return Err(SignerError::DoubleSign {
                height,
                round,
                step,
            });
        }
        if pos == last_pos {
            if last.sign_bytes == sign_bytes {
                if let Some(sig) = last.signature {
                    return Ok(sig);
                }
            }
            return Err(SignerError::DoubleSign {
                height,
                round,
                step,
            });
        }
        let signature = self.keypair.sign(&sign_bytes);
        *last = LastSign {
            height,
            round,
            step,
            sign_bytes,
            signature: Some(signature),
        };
        Ok(signature)
    }
}

impl PrivValidator for LocalSigner {
    fn address(&self) -> Address {
        self.keypair.address()
    }

    fn sign_vote(&self, chain_id: &str, vote: &Vote) -> Result<Signature, SignerError> {
        self.sign_at(
            vote.height,
            vote.round,
            vote_step(vote.vote_type),
            signing::vote_sign_bytes(chain_id, vote),
        )
    }

    fn sign_proposal(&self, chain_id: &str, proposal: &Proposal) -> Result<Signature, SignerError> {
        self.sign_at(
            proposal.height,
            proposal.round,
            STEP_PROPOSE,
            signing::proposal_sign_bytes(chain_id, proposal),
        )
    }
}
