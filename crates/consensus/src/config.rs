//! Consensus configuration.

use serde::Deserialize;
use std::time::Duration;

/// Consensus parameters. All timeouts are in milliseconds; the per-round
/// deltas stretch the waits linearly as rounds fail, giving slow
/// validators progressively more time.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Chain identifier, keyed into every signature.
    pub chain_id: String,

    /// Identifier of the main chain. Cross-chain duties (proof saves and
    /// TX3 broadcasts) only apply when this chain is not the main chain.
    pub main_chain_id: String,

    /// How long a proposer waits for the execution engine's payload.
    pub timeout_wait_for_miner_block: u64,

    /// Base wait for a complete proposal before prevoting nil.
    pub timeout_propose: u64,
    pub timeout_propose_delta: u64,

    /// Wait for straggler prevotes after seeing +2/3 of any.
    pub timeout_prevote: u64,
    pub timeout_prevote_delta: u64,

    /// Wait for straggler precommits after seeing +2/3 of any.
    pub timeout_precommit: u64,
    pub timeout_precommit_delta: u64,

    /// Pause between committing a block and starting the next height.
    pub timeout_commit: u64,

    /// Skip the commit pause once every precommit has been collected.
    pub skip_timeout_commit: bool,

    /// Size in bytes of gossiped block parts.
    pub block_part_size: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            chain_id: "tenderbft".to_string(),
            main_chain_id: "main".to_string(),
            timeout_wait_for_miner_block: 800,
            timeout_propose: 3_000,
            timeout_propose_delta: 500,
            timeout_prevote: 1_000,
            timeout_prevote_delta: 500,
            timeout_precommit: 1_000,
            timeout_precommit_delta: 500,
            timeout_commit: 1_000,
            skip_timeout_commit: false,
            block_part_size: 65_536,
        }
    }
}

impl ConsensusConfig {
    pub fn wait_for_miner_block(&self) -> Duration {
        Duration::from_millis(self.timeout_wait_for_miner_block)
    }

    pub fn propose(&self, round: i32) -> Duration {
        Duration::from_millis(self.timeout_propose + self.timeout_propose_delta * round as u64)
    }

    pub fn prevote(&self, round: i32) -> Duration {
        Duration::from_millis(self.timeout_prevote + self.timeout_prevote_delta * round as u64)
    }

    pub fn precommit(&self, round: i32) -> Duration {
        Duration::from_millis(self.timeout_precommit + self.timeout_precommit_delta * round as u64)
    }

    pub fn commit(&self) -> Duration {
        Duration::from_millis(self.timeout_commit)
    }
}
