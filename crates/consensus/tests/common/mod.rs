//! Deterministic multi-validator harness.
//!
//! Runs several state machines against a simulated clock and an explicit
//! message queue. No tokio, no real time: timeouts fire when the test
//! advances the clock, and message delivery order is the queue order, so
//! every run of a scenario is identical.

// Shared between test binaries; not every binary uses every helper.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tenderbft_consensus::{
    ConsensusConfig, ConsensusState, DefaultBehavior, RecoveredState, RoundBehavior,
};
use tenderbft_core::{
    Action, Backend, BackendError, Broadcaster, ChainReader, ConsensusEvent, CrossChainError,
    CrossChainHelper, Event, LocalSigner, Message, PeerId, TimeoutInfo,
};
use tenderbft_types::{
    signing, Block, BlockId, Commit, Epoch, ExecPayload, Hash, KeyPair, PartSet, PartSetHeader,
    Proposal, Signature, Transaction, Tx3ProofData, Validator, ValidatorSet, Vote, VoteType,
};

// ═══════════════════════════════════════════════════════════════════════════
// Collaborator stubs
// ═══════════════════════════════════════════════════════════════════════════

pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn broadcast(&self, _message: &Message) {}
}

pub struct NullChainReader;

impl ChainReader for NullChainReader {
    fn latest_height(&self) -> u64 {
        0
    }
    fn latest_time(&self) -> u64 {
        0
    }
}

pub struct TestBackend {
    broadcaster: NullBroadcaster,
    reader: NullChainReader,
}

impl TestBackend {
    pub fn new() -> Self {
        Self {
            broadcaster: NullBroadcaster,
            reader: NullChainReader,
        }
    }
}

impl Backend for TestBackend {
    fn commit(&self, _block: &Block, _seals: &[Vec<u8>]) -> Result<(), BackendError> {
        Ok(())
    }
    fn validate_block(&self, _block: &Block) -> Result<(), BackendError> {
        Ok(())
    }
    fn chain_reader(&self) -> &dyn ChainReader {
        &self.reader
    }
    fn broadcaster(&self) -> &dyn Broadcaster {
        &self.broadcaster
    }
}

pub struct NullCrossChain;

impl CrossChainHelper for NullCrossChain {
    fn tx3_proof_data(&self, _chain_id: &str, _tx_hash: &Hash) -> Option<Tx3ProofData> {
        None
    }
    fn validate_tx3_proof_data(&self, _proof: &Tx3ProofData) -> Result<(), CrossChainError> {
        Ok(())
    }
    fn validate_tx4_with_proof(
        &self,
        _tx: &Transaction,
        _proof: &Tx3ProofData,
    ) -> Result<(), CrossChainError> {
        Ok(())
    }
    fn save_block_proof(&self, _block: &Block) -> Result<(), CrossChainError> {
        Ok(())
    }
    fn broadcast_tx3_proof(&self, _block: &Block) -> Result<(), CrossChainError> {
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Fixtures
// ═══════════════════════════════════════════════════════════════════════════

pub const CHAIN_ID: &str = "test-chain";

pub fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        chain_id: CHAIN_ID.to_string(),
        ..ConsensusConfig::default()
    }
}

/// Keypairs in validator-index order (the set sorts by address).
pub fn sorted_keys(n: usize) -> Vec<KeyPair> {
    let mut keys: Vec<KeyPair> = (0..n)
        .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]))
        .collect();
    keys.sort_by_key(|k| k.address());
    keys
}

pub fn validator_set(keys: &[KeyPair]) -> ValidatorSet {
    ValidatorSet::new(
        keys.iter()
            .map(|k| Validator::new(k.public_key(), 1))
            .collect(),
    )
}

pub fn test_epoch(keys: &[KeyPair]) -> Epoch {
    Epoch::new(1, 1, 1_000, validator_set(keys))
}

pub fn payload(seed: u64) -> ExecPayload {
    ExecPayload {
        parent_hash: Hash::of(&seed.to_le_bytes()),
        number: 1,
        timestamp: 1_000 + seed,
        transactions: vec![Transaction::transfer(vec![seed as u8])],
    }
}

pub fn new_state(
    keys: &[KeyPair],
    own: usize,
    config: ConsensusConfig,
    behavior: Arc<dyn RoundBehavior>,
) -> ConsensusState {
    ConsensusState::new(
        config,
        Arc::new(TestBackend::new()),
        Arc::new(NullCrossChain),
        Some(Arc::new(LocalSigner::new(keys[own].clone()))),
        behavior,
        test_epoch(keys),
        RecoveredState::default(),
    )
    .expect("fresh state")
}

/// A height-1 block as the given proposer key would build it.
pub fn make_block(keys: &[KeyPair], seed: u64) -> (Block, PartSet) {
    let validators = validator_set(keys);
    Block::make(
        1,
        CHAIN_ID.to_string(),
        1_000,
        Commit::empty(),
        payload(seed),
        validators.validators_hash(),
        1,
        Vec::new(),
        Vec::new(),
        4_096,
    )
}

pub fn signed_vote(
    keys: &[KeyPair],
    index: u32,
    height: u64,
    round: i32,
    vote_type: VoteType,
    block_id: BlockId,
) -> Vote {
    let key = &keys[index as usize];
    let mut vote = Vote {
        validator_address: key.address(),
        validator_index: index,
        height,
        round,
        vote_type,
        block_id,
        signature: Signature::zero(),
    };
    vote.signature = key.sign(&signing::vote_sign_bytes(CHAIN_ID, &vote));
    vote
}

pub fn signed_proposal(
    keys: &[KeyPair],
    proposer: usize,
    height: u64,
    round: i32,
    parts: PartSetHeader,
    pol_round: i32,
    pol_block_id: BlockId,
) -> Proposal {
    let mut proposal = Proposal::new(height, round, parts, pol_round, pol_block_id);
    proposal.signature =
        keys[proposer].sign(&signing::proposal_sign_bytes(CHAIN_ID, &proposal));
    proposal
}

pub fn block_id_of(block: &Block, parts: &PartSet) -> BlockId {
    BlockId::new(block.hash(), parts.header())
}

// ═══════════════════════════════════════════════════════════════════════════
// Single-node pump
// ═══════════════════════════════════════════════════════════════════════════

/// Records what one machine did while an event (and its internal
/// consequences) were pumped through it.
#[derive(Default)]
pub struct Outbox {
    pub sent: Vec<Message>,
    pub events: Vec<ConsensusEvent>,
    pub committed: Vec<Block>,
    pub timeouts: Vec<TimeoutInfo>,
}

impl Outbox {
    pub fn sent_votes(&self) -> Vec<&Vote> {
        self.sent
            .iter()
            .filter_map(|m| match m {
                Message::Vote(v) => Some(v),
                _ => None,
            })
            .collect()
    }

    pub fn last_vote(&self) -> &Vote {
        self.sent_votes().last().expect("no vote sent")
    }
}

pub fn message_event(message: Message, from: Option<PeerId>) -> Event {
    match message {
        Message::Proposal(proposal) => Event::Proposal { proposal, from },
        Message::BlockPart {
            height,
            round,
            part,
        } => Event::BlockPart {
            height,
            round,
            part,
            from,
        },
        Message::Vote(vote) => Event::Vote { vote, from },
    }
}

/// Feed one event into a lone machine, looping its own messages straight
/// back in, and record everything it emitted.
pub fn pump(state: &mut ConsensusState, event: Event, out: &mut Outbox) {
    let mut queue = VecDeque::from([event]);
    while let Some(event) = queue.pop_front() {
        let actions = state.handle(event).expect("consensus invariant violated");
        for action in actions {
            match action {
                Action::SendInternal(message) => {
                    out.sent.push(message.clone());
                    queue.push_back(message_event(message, None));
                }
                Action::ScheduleTimeout(info) => out.timeouts.push(info),
                Action::CommitBlock { block } => out.committed.push(*block),
                Action::Publish(event) => out.events.push(event),
                Action::SaveToMainChain { .. } | Action::BroadcastProofData { .. } => {}
            }
        }
    }
}

/// Deliver a block's parts to a lone machine.
pub fn pump_parts(state: &mut ConsensusState, parts: &PartSet, round: i32, out: &mut Outbox) {
    for index in 0..parts.total() {
        let part = parts.part(index).expect("complete set").clone();
        pump(
            state,
            Event::BlockPart {
                height: 1,
                round,
                part,
                from: Some("peer".to_string()),
            },
            out,
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Multi-node network
// ═══════════════════════════════════════════════════════════════════════════

pub struct TestNode {
    pub state: ConsensusState,
    /// Single pending timeout: (absolute deadline, tag). Newer schedules
    /// supersede, mirroring the ticker.
    pub pending_timeout: Option<(Duration, TimeoutInfo)>,
    pub committed: Vec<Block>,
    pub events: Vec<ConsensusEvent>,
    pub sent_votes: Vec<Vote>,
}

struct Delivery {
    to: usize,
    event: Event,
}

/// Message filter: `(from, to, message) -> deliver?`.
pub type Filter = Box<dyn FnMut(usize, usize, &Message) -> bool>;

pub struct Harness {
    pub keys: Vec<KeyPair>,
    pub nodes: Vec<TestNode>,
    pub now: Duration,
    queue: VecDeque<Delivery>,
    pub filter: Filter,
}

impl Harness {
    pub fn new(n: usize, config: ConsensusConfig) -> Self {
        let behaviors: Vec<Arc<dyn RoundBehavior>> =
            (0..n).map(|_| Arc::new(DefaultBehavior) as _).collect();
        Self::with_behaviors(n, config, behaviors)
    }

    pub fn with_behaviors(
        n: usize,
        config: ConsensusConfig,
        behaviors: Vec<Arc<dyn RoundBehavior>>,
    ) -> Self {
        let keys = sorted_keys(n);
        let nodes = behaviors
            .into_iter()
            .enumerate()
            .map(|(i, behavior)| TestNode {
                state: new_state(&keys, i, config.clone(), behavior),
                pending_timeout: None,
                committed: Vec::new(),
                events: Vec::new(),
                sent_votes: Vec::new(),
            })
            .collect();
        Self {
            keys,
            nodes,
            now: Duration::ZERO,
            queue: VecDeque::new(),
            filter: Box::new(|_, _, _| true),
        }
    }

    pub fn start_all(&mut self) {
        for i in 0..self.nodes.len() {
            self.nodes[i].state.set_now(self.now);
            let actions = self.nodes[i].state.start();
            self.apply_actions(i, actions);
        }
    }

    pub fn give_miner_block(&mut self, node: usize, payload: ExecPayload) {
        self.queue.push_back(Delivery {
            to: node,
            event: Event::MinerBlock { payload },
        });
    }

    /// Process queued deliveries until none remain.
    pub fn run_queue(&mut self) {
        let mut steps = 0usize;
        while let Some(delivery) = self.queue.pop_front() {
            steps += 1;
            assert!(steps < 100_000, "message storm: runaway scenario");
            let actions = {
                let node = &mut self.nodes[delivery.to];
                node.state.set_now(self.now);
                node.state
                    .handle(delivery.event)
                    .expect("consensus invariant violated")
            };
            self.apply_actions(delivery.to, actions);
        }
    }

    /// Jump the clock to the earliest pending timeout and fire it.
    pub fn fire_next_timeout(&mut self) -> bool {
        let next = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.pending_timeout.as_ref().map(|(d, _)| (*d, i)))
            .min();
        let Some((deadline, index)) = next else {
            return false;
        };
        self.now = self.now.max(deadline);
        let (_, info) = self.nodes[index]
            .pending_timeout
            .take()
            .expect("selected above");
        self.queue.push_back(Delivery {
            to: index,
            event: Event::Timeout(info),
        });
        self.run_queue();
        true
    }

    /// Drain the queue and fire timeouts until `pred` holds.
    pub fn run_until(&mut self, mut pred: impl FnMut(&Harness) -> bool, max_timeouts: usize) {
        self.run_queue();
        for _ in 0..max_timeouts {
            if pred(self) {
                return;
            }
            if !self.fire_next_timeout() {
                break;
            }
        }
        assert!(pred(self), "scenario did not reach its goal state");
    }

    fn apply_actions(&mut self, from: usize, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::ScheduleTimeout(info) => {
                    self.nodes[from].pending_timeout = Some((self.now + info.duration, info));
                }
                Action::SendInternal(message) => {
                    if let Message::Vote(vote) = &message {
                        self.nodes[from].sent_votes.push(vote.clone());
                    }
                    // Self-delivery first, then gossip, both FIFO.
                    self.queue.push_back(Delivery {
                        to: from,
                        event: message_event(message.clone(), None),
                    });
                    for to in 0..self.nodes.len() {
                        if to != from && (self.filter)(from, to, &message) {
                            self.queue.push_back(Delivery {
                                to,
                                event: message_event(
                                    message.clone(),
                                    Some(format!("node-{from}")),
                                ),
                            });
                        }
                    }
                }
                Action::CommitBlock { block } => self.nodes[from].committed.push(*block),
                Action::Publish(event) => self.nodes[from].events.push(event),
                Action::SaveToMainChain { .. } | Action::BroadcastProofData { .. } => {}
            }
        }
    }

    pub fn all_committed(&self) -> bool {
        self.nodes.iter().all(|n| !n.committed.is_empty())
    }

    /// Every correct validator votes at most one way per
    /// (height, round, type).
    pub fn assert_no_double_votes(&self) {
        for (i, node) in self.nodes.iter().enumerate() {
            for a in &node.sent_votes {
                for b in &node.sent_votes {
                    if a.height == b.height && a.round == b.round && a.vote_type == b.vote_type {
                        assert_eq!(
                            a.block_id, b.block_id,
                            "node {i} voted two ways at {}/{} {}",
                            a.height, a.round, a.vote_type
                        );
                    }
                }
            }
        }
    }

    pub fn assert_no_conflicting_commits(&self) {
        let mut by_height: std::collections::HashMap<u64, Hash> = std::collections::HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            for block in &node.committed {
                let entry = by_height.entry(block.height).or_insert_with(|| block.hash());
                assert_eq!(
                    *entry,
                    block.hash(),
                    "node {i} committed a conflicting block at height {}",
                    block.height
                );
            }
        }
    }
}
