//! The consensus state machine.
//!
//! Processes proposals, block parts, votes, miner payloads, and timeouts,
//! and drives the round-step transitions:
//!
//! ```text
//! NewHeight → NewRound → [WaitForMinerBlock] → Propose → Prevote →
//! PrevoteWait → Precommit → PrecommitWait → Commit → (next height)
//! ```
//!
//! Every transition is guarded on the target `(height, round, step)` being
//! strictly ahead of the current position, so duplicate signals are
//! harmless no-ops. All I/O is returned as [`Action`]s for the driver to
//! execute; the machine itself only mutates [`RoundState`].
//!
//! # Safety discipline
//!
//! A validator locks on a block when it precommits it, prevotes its locked
//! block in later rounds, and only unlocks when a polka forms in a round
//! strictly after its locked round. Votes are tallied per round by
//! [`HeightVoteSet`]; a commit requires +2/3 of the voting power
//! precommitting one block at one round.

use crate::config::ConsensusConfig;
use crate::error::{ConsensusError, InvariantError};
use crate::height_vote_set::HeightVoteSet;
use crate::invariant_violation;
use crate::round_state::RoundState;
use crate::vote_set::VoteSet;
use std::sync::Arc;
use std::time::Duration;
use tenderbft_core::{
    Action, Backend, ConsensusEvent, CrossChainError, CrossChainHelper, Event, Message, PeerId,
    PrivValidator, Step, TimeoutInfo,
};
use tenderbft_types::{
    signing, Block, BlockId, Commit, Epoch, ExecPayload, Part, PartSet, Proposal, Signature,
    TxKind, Vote, VoteType,
};
use tracing::{debug, error, info, warn};

/// Overridable round behavior.
///
/// Production uses [`DefaultBehavior`]; tests inject implementations that
/// withhold proposals or cast rigged prevotes.
pub trait RoundBehavior: Send + Sync {
    fn decide_proposal(&self, state: &mut ConsensusState, height: u64, round: i32) -> Vec<Action> {
        state.default_decide_proposal(height, round)
    }

    fn do_prevote(&self, state: &mut ConsensusState, height: u64, round: i32) -> Vec<Action> {
        state.default_do_prevote(height, round)
    }

    fn set_proposal(
        &self,
        state: &mut ConsensusState,
        proposal: Proposal,
    ) -> Result<Vec<Action>, ConsensusError> {
        state.default_set_proposal(proposal)
    }
}

/// The production round behavior.
pub struct DefaultBehavior;

impl RoundBehavior for DefaultBehavior {}

/// Consensus state restored from the backend on startup.
#[derive(Debug, Clone)]
pub struct RecoveredState {
    /// Height to resume at (last committed height + 1).
    pub height: u64,
    /// The commit observed for the previous height. Required above
    /// height 1: the next proposal block must carry it.
    pub seen_commit: Option<Commit>,
}

impl Default for RecoveredState {
    fn default() -> Self {
        Self {
            height: 1,
            seen_commit: None,
        }
    }
}

/// The consensus state machine. One per chain, owned by the driver.
pub struct ConsensusState {
    config: ConsensusConfig,
    backend: Arc<dyn Backend>,
    cross_chain: Arc<dyn CrossChainHelper>,
    priv_validator: Option<Arc<dyn PrivValidator>>,
    behavior: Arc<dyn RoundBehavior>,

    rs: RoundState,
    epoch: Epoch,
    /// Next-epoch descriptor seen in a committed block, adopted when the
    /// chain reaches its start height.
    next_epoch: Option<Epoch>,

    /// Candidate payload from the execution engine, consumed by the next
    /// proposal we make.
    block_from_miner: Option<ExecPayload>,

    /// The block most recently handed to the backend, kept for deferred
    /// main-chain duties.
    last_committed_block: Option<Box<Block>>,
    /// The committed block's proof data still has to reach the main chain.
    need_to_save: bool,
    /// The committed block's TX3 proofs still have to be broadcast.
    need_to_broadcast: bool,

    /// Current time on the driver's monotonic clock; set before every
    /// `handle` call.
    now: Duration,
}

impl ConsensusState {
    pub fn new(
        config: ConsensusConfig,
        backend: Arc<dyn Backend>,
        cross_chain: Arc<dyn CrossChainHelper>,
        priv_validator: Option<Arc<dyn PrivValidator>>,
        behavior: Arc<dyn RoundBehavior>,
        epoch: Epoch,
        recovered: RecoveredState,
    ) -> Result<Self, InvariantError> {
        let height = recovered.height;
        let validators_shared = Arc::new(epoch.validators.clone());

        let last_commit = match (height > 1, recovered.seen_commit) {
            (false, _) => None,
            (true, None) => {
                return Err(InvariantError(format!(
                    "resuming at height {height} without the previous commit"
                )))
            }
            (true, Some(commit)) => Some(Self::reconstruct_last_commit(
                &config.chain_id,
                height - 1,
                commit,
                Arc::clone(&validators_shared),
            )?),
        };

        // Rebuild proposer accumulators as one rotation step per height
        // since the epoch began. Round-level increments of past heights
        // are not reconstructible; full crash recovery is the backend's
        // concern.
        let mut validators = epoch.validators.clone();
        let heights_elapsed = height.saturating_sub(epoch.start_block) + 1;
        validators.increment_accum(heights_elapsed.min(i32::MAX as u64) as i32);

        let rs = RoundState {
            height,
            round: 0,
            step: Step::NewHeight,
            start_time: Duration::ZERO,
            commit_time: Duration::ZERO,
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            votes: HeightVoteSet::new(config.chain_id.clone(), height, validators_shared),
            commit_round: -1,
            last_commit,
        };

        Ok(Self {
            config,
            backend,
            cross_chain,
            priv_validator,
            behavior,
            rs,
            epoch,
            next_epoch: None,
            block_from_miner: None,
            last_committed_block: None,
            need_to_save: false,
            need_to_broadcast: false,
            now: Duration::ZERO,
        })
    }

    fn reconstruct_last_commit(
        chain_id: &str,
        height: u64,
        commit: Commit,
        validators: Arc<tenderbft_types::ValidatorSet>,
    ) -> Result<VoteSet, InvariantError> {
        let mut set = VoteSet::new(
            chain_id.to_string(),
            height,
            commit.round,
            VoteType::Precommit,
            validators,
        );
        for vote in commit.precommits.iter().flatten() {
            set.add_vote(vote.clone())
                .map_err(|e| InvariantError(format!("failed to reconstruct last commit: {e}")))?;
        }
        if !set.has_two_thirds_majority() {
            return Err(InvariantError(
                "reconstructed last commit lacks a +2/3 majority".to_string(),
            ));
        }
        Ok(set)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Accessors
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn round_state(&self) -> &RoundState {
        &self.rs
    }

    pub(crate) fn backend_arc(&self) -> Arc<dyn Backend> {
        Arc::clone(&self.backend)
    }

    pub(crate) fn cross_chain_arc(&self) -> Arc<dyn CrossChainHelper> {
        Arc::clone(&self.cross_chain)
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn epoch(&self) -> &Epoch {
        &self.epoch
    }

    /// Advance the machine's clock. The driver calls this before every
    /// `handle`.
    pub fn set_now(&mut self, now: Duration) {
        self.now = now;
    }

    fn is_proposer(&self) -> bool {
        match &self.priv_validator {
            Some(signer) => signer.address() == self.rs.validators.proposer().address,
            None => false,
        }
    }

    /// The proposal is complete when we hold it, its block, and (if it
    /// references a proof-of-lock round) that round's prevote majority.
    fn is_proposal_complete(&self) -> bool {
        let Some(proposal) = &self.rs.proposal else {
            return false;
        };
        if self.rs.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round < 0 {
            return true;
        }
        self.rs
            .votes
            .prevotes(proposal.pol_round)
            .is_some_and(|set| set.has_two_thirds_majority())
    }

    fn schedule_timeout(&self, duration: Duration, round: i32, step: Step) -> Action {
        Action::ScheduleTimeout(TimeoutInfo {
            duration,
            height: self.rs.height,
            round,
            step,
        })
    }

    fn new_step(&self) -> Action {
        Action::Publish(ConsensusEvent::NewRoundStep {
            height: self.rs.height,
            round: self.rs.round,
            step: self.rs.step,
        })
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Event dispatch
    // ═══════════════════════════════════════════════════════════════════════════

    /// Process one input event. Transient faults are logged and absorbed;
    /// only invariant violations surface, and the driver aborts on them.
    pub fn handle(&mut self, event: Event) -> Result<Vec<Action>, InvariantError> {
        match event {
            Event::Proposal { proposal, from } => self.on_proposal(proposal, from),
            Event::BlockPart {
                height,
                round,
                part,
                from,
            } => self.on_block_part(height, round, part, from),
            Event::Vote { vote, from } => self.on_vote(vote, from),
            Event::MinerBlock { payload } => self.on_miner_block(payload),
            Event::Timeout(info) => self.on_timeout(info),
        }
    }

    /// Initial actions: arm the round-0 timer for the current height.
    pub fn start(&mut self) -> Vec<Action> {
        info!(height = self.rs.height, "starting consensus");
        self.rs.start_time = self.now;
        vec![self.schedule_timeout(Duration::ZERO, 0, Step::NewHeight)]
    }

    fn on_timeout(&mut self, info: TimeoutInfo) -> Result<Vec<Action>, InvariantError> {
        // Timeouts must match the current position; anything older is a
        // leftover from a superseded schedule.
        if info.height != self.rs.height
            || info.round < self.rs.round
            || (info.round == self.rs.round && info.step < self.rs.step)
        {
            debug!(%info, current = %self.rs, "ignoring stale timeout");
            return Ok(vec![]);
        }
        info!(%info, "timeout");

        let mut actions = Vec::new();
        match info.step {
            Step::NewHeight => {
                actions.extend(self.enter_new_round(info.height, 0)?);
            }
            Step::WaitForMinerBlock => {
                actions.push(Action::Publish(ConsensusEvent::TimeoutPropose {
                    height: self.rs.height,
                    round: self.rs.round,
                }));
                if self.block_from_miner.is_some() {
                    warn!("miner block arrived but the wait timeout still fired");
                }
                actions.extend(self.enter_propose(info.height, info.round)?);
            }
            Step::Propose => {
                actions.push(Action::Publish(ConsensusEvent::TimeoutPropose {
                    height: self.rs.height,
                    round: self.rs.round,
                }));
                actions.extend(self.enter_prevote(info.height, info.round)?);
            }
            Step::PrevoteWait => {
                actions.push(Action::Publish(ConsensusEvent::TimeoutWait {
                    height: self.rs.height,
                    round: self.rs.round,
                }));
                actions.extend(self.enter_precommit(info.height, info.round)?);
            }
            Step::PrecommitWait => {
                actions.push(Action::Publish(ConsensusEvent::TimeoutWait {
                    height: self.rs.height,
                    round: self.rs.round,
                }));
                actions.extend(self.enter_new_round(info.height, info.round + 1)?);
            }
            step => invariant_violation!("timeout fired for invalid step {step}"),
        }
        Ok(actions)
    }

    fn on_miner_block(&mut self, payload: ExecPayload) -> Result<Vec<Action>, InvariantError> {
        info!(number = payload.number, "miner block received");
        self.block_from_miner = Some(payload);
        // A proposer parked in NewRound is waiting on exactly this.
        if self.rs.step == Step::NewRound && self.is_proposer() {
            return self.enter_propose(self.rs.height, self.rs.round);
        }
        Ok(vec![])
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Round transitions
    // ═══════════════════════════════════════════════════════════════════════════

    /// Enter a new round: rotate the proposer, reset per-round proposal
    /// state, and move toward Propose.
    fn enter_new_round(&mut self, height: u64, round: i32) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            debug!(
                height,
                round,
                current = %self.rs,
                "enter_new_round: out of turn, ignoring"
            );
            return Ok(vec![]);
        }

        if self.rs.start_time > self.now {
            warn!(
                start_time = ?self.rs.start_time,
                now = ?self.now,
                "entering round 0 before the scheduled start time"
            );
        }

        info!(height, round, current = %self.rs, "entering new round");

        // Rotate proposer priority on a per-round copy of the set.
        if round > self.rs.round {
            let mut validators = self.rs.validators.clone();
            validators.increment_accum(round - self.rs.round);
            self.rs.validators = validators;
        }

        self.rs.round = round;
        self.rs.step = Step::NewRound;
        if round != 0 {
            // Round 0 keeps proposal state: it may have arrived during
            // NewHeight, ahead of us.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        // Track the next round too, so one-ahead votes are counted.
        self.rs.votes.set_round(round + 1);

        let mut actions = vec![Action::Publish(ConsensusEvent::NewRound { height, round })];

        if self.is_proposer() && self.block_from_miner.is_none() {
            info!("proposer without a miner block, waiting for the execution engine");
            actions.push(self.schedule_timeout(
                self.config.wait_for_miner_block(),
                round,
                Step::WaitForMinerBlock,
            ));
            return Ok(actions);
        }

        actions.extend(self.enter_propose(height, round)?);
        Ok(actions)
    }

    /// Enter Propose: send our proposal if it is our turn, otherwise arm
    /// the propose timeout and wait for one.
    fn enter_propose(&mut self, height: u64, round: i32) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Propose)
        {
            debug!(height, round, current = %self.rs, "enter_propose: out of turn, ignoring");
            return Ok(vec![]);
        }
        info!(height, round, "entering propose");

        let mut actions = Vec::new();

        // Deferred main-chain duties from the last committed block. These
        // run on detached tasks so a slow main chain cannot stall rounds.
        if self.priv_validator.is_some() && self.is_proposer() {
            if self.need_to_save {
                if let Some(block) = &self.last_committed_block {
                    info!(height = block.height, "shipping committed block proof to main chain");
                    actions.push(Action::SaveToMainChain {
                        block: block.clone(),
                    });
                    self.need_to_save = false;
                }
            }
            if self.need_to_broadcast {
                if let Some(block) = &self.last_committed_block {
                    info!(height = block.height, "broadcasting TX3 proof data to main chain");
                    actions.push(Action::BroadcastProofData {
                        block: block.clone(),
                    });
                    self.need_to_broadcast = false;
                }
            }
        }

        // However this round goes, give the proposal a deadline.
        actions.push(self.schedule_timeout(self.config.propose(round), round, Step::Propose));

        if self.priv_validator.is_none() {
            debug!("not a validator, waiting for a proposal");
        } else if self.is_proposer() {
            info!(height, round, "our turn to propose");
            let behavior = Arc::clone(&self.behavior);
            actions.extend(behavior.decide_proposal(self, height, round));
        } else {
            debug!(
                proposer = %self.rs.validators.proposer().address,
                "not our turn to propose"
            );
        }

        self.rs.round = round;
        self.rs.step = Step::Propose;
        actions.push(self.new_step());

        // Rare: a complete round-0 proposal may already be sitting here
        // from the previous step.
        if self.is_proposal_complete() {
            actions.extend(self.enter_prevote(height, self.rs.round)?);
        }
        Ok(actions)
    }

    /// Build and send the proposal for this round: the locked block if we
    /// hold one, otherwise a fresh block from the miner payload.
    pub(crate) fn default_decide_proposal(&mut self, height: u64, round: i32) -> Vec<Action> {
        let (block, parts) = if self.rs.locked_block.is_some() {
            // Locked: re-propose the locked block.
            let block = self.rs.locked_block.clone().expect("checked above");
            let parts = self
                .rs
                .locked_block_parts
                .clone()
                .expect("locked block always has parts");
            (block, parts)
        } else {
            match self.create_proposal_block() {
                Some(built) => built,
                None => return vec![],
            }
        };

        let (pol_round, pol_block_id) = self.rs.votes.pol_info();
        let mut proposal = Proposal::new(height, round, parts.header(), pol_round, pol_block_id);
        let Some(signer) = self.priv_validator.as_ref() else {
            return vec![];
        };
        match signer.sign_proposal(&self.config.chain_id, &proposal) {
            Ok(signature) => proposal.signature = signature,
            Err(e) => {
                warn!(error = %e, height, round, "failed to sign proposal");
                return vec![];
            }
        }

        info!(height, round, block = %block, total_parts = parts.total(), "signed proposal");

        let mut actions = vec![Action::SendInternal(Message::Proposal(proposal))];
        for index in 0..parts.total() {
            let part = parts.part(index).expect("complete part set").clone();
            actions.push(Action::SendInternal(Message::BlockPart {
                height,
                round,
                part,
            }));
        }
        actions
    }

    /// Assemble a new proposal block from the miner payload, the epoch
    /// schedule, and cross-chain proof data.
    fn create_proposal_block(&mut self) -> Option<(Block, PartSet)> {
        let Some(payload) = self.block_from_miner.take() else {
            warn!("no miner block to propose, sitting this round out");
            return None;
        };

        let height = self.rs.height;
        let epoch_bytes = if height == self.epoch.start_block || height == 1 {
            // First block of an epoch re-announces the epoch itself.
            self.epoch.to_bytes()
        } else if self.epoch.should_propose_next_epoch(height) {
            self.epoch.propose_next_epoch().to_bytes()
        } else {
            Vec::new()
        };

        let last_commit = if height == 1 {
            Commit::empty()
        } else {
            let set = self.rs.last_commit.as_ref()?;
            match set.make_commit() {
                Ok(commit) => commit,
                Err(e) => {
                    warn!(error = %e, "cannot build last commit for proposal");
                    return None;
                }
            }
        };

        // Pair each main-chain withdrawal with its TX3 proof.
        let mut tx3_proofs = Vec::new();
        for tx in &payload.transactions {
            if let TxKind::WithdrawFromMainChain { chain_id, tx_hash } = &tx.kind {
                match self.cross_chain.tx3_proof_data(chain_id, tx_hash) {
                    Some(proof) => tx3_proofs.push(proof),
                    None => warn!(%tx_hash, "no TX3 proof data for withdrawal"),
                }
            }
        }

        let time = payload.timestamp;
        let (block, parts) = Block::make(
            height,
            self.config.chain_id.clone(),
            time,
            last_commit,
            payload,
            self.rs.validators.validators_hash(),
            self.epoch.number,
            epoch_bytes,
            tx3_proofs,
            self.config.block_part_size,
        );
        Some((block, parts))
    }

    /// Enter Prevote and cast our prevote for this round.
    fn enter_prevote(&mut self, height: u64, round: i32) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Prevote)
        {
            debug!(height, round, current = %self.rs, "enter_prevote: out of turn, ignoring");
            return Ok(vec![]);
        }

        let mut actions = Vec::new();
        if self.is_proposal_complete() {
            actions.push(Action::Publish(ConsensusEvent::CompleteProposal {
                height,
                round,
            }));
        }
        info!(height, round, "entering prevote");

        let behavior = Arc::clone(&self.behavior);
        actions.extend(behavior.do_prevote(self, height, round));

        self.rs.round = round;
        self.rs.step = Step::Prevote;
        actions.push(self.new_step());
        Ok(actions)
    }

    /// The prevote rule: locked block first, then a validated proposal
    /// block, otherwise nil.
    pub(crate) fn default_do_prevote(&mut self, _height: u64, _round: i32) -> Vec<Action> {
        if let Some(locked) = &self.rs.locked_block {
            debug!("prevoting our locked block");
            let block_id = BlockId::new(
                locked.hash(),
                self.rs
                    .locked_block_parts
                    .as_ref()
                    .expect("locked block always has parts")
                    .header(),
            );
            return self.sign_add_vote(VoteType::Prevote, block_id);
        }

        let Some(block) = self.rs.proposal_block.clone() else {
            warn!("no proposal block, prevoting nil");
            return self.sign_add_vote(VoteType::Prevote, BlockId::nil());
        };

        if let Err(e) = block.validate_basic(
            &self.config.chain_id,
            self.rs.height,
            self.rs.validators.validators_hash(),
        ) {
            warn!(error = %e, "proposal block invalid, prevoting nil");
            return self.sign_add_vote(VoteType::Prevote, BlockId::nil());
        }

        // Non-proposers re-check what the proposer claims: cross-chain
        // proofs and full application validation. The proposer already did
        // both while building the block.
        if !self.is_proposer() {
            if let Err(e) = self.validate_tx4(&block) {
                warn!(error = %e, "cross-chain proof validation failed, prevoting nil");
                return self.sign_add_vote(VoteType::Prevote, BlockId::nil());
            }
            if let Err(e) = self.backend.validate_block(&block) {
                warn!(error = %e, "application rejected proposal block, prevoting nil");
                return self.sign_add_vote(VoteType::Prevote, BlockId::nil());
            }
        }

        if !block.epoch_bytes.is_empty() {
            match Epoch::from_bytes(&block.epoch_bytes) {
                Ok(proposed) if proposed.number == self.epoch.number + 1 => {
                    if let Err(e) = self.epoch.validate_next_epoch(&proposed) {
                        warn!(error = %e, "proposed next epoch invalid, prevoting nil");
                        return self.sign_add_vote(VoteType::Prevote, BlockId::nil());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "malformed epoch bytes, prevoting nil");
                    return self.sign_add_vote(VoteType::Prevote, BlockId::nil());
                }
            }
        }

        let block_id = BlockId::new(
            block.hash(),
            self.rs
                .proposal_block_parts
                .as_ref()
                .expect("proposal block implies parts")
                .header(),
        );
        self.sign_add_vote(VoteType::Prevote, block_id)
    }

    /// Verify each main-chain withdrawal against its TX3 proof, in order.
    fn validate_tx4(&self, block: &Block) -> Result<(), CrossChainError> {
        let mut index = 0usize;
        for tx in &block.payload.transactions {
            if matches!(tx.kind, TxKind::WithdrawFromMainChain { .. }) {
                let proof = block.tx3_proofs.get(index).ok_or_else(|| {
                    CrossChainError::InvalidProof(format!("missing TX3 proof at {index}"))
                })?;
                index += 1;
                self.cross_chain.validate_tx3_proof_data(proof)?;
                self.cross_chain.validate_tx4_with_proof(tx, proof)?;
            }
        }
        Ok(())
    }

    /// Enter PrevoteWait: +2/3 prevoted for something; give stragglers a
    /// bounded chance to complete a polka.
    fn enter_prevote_wait(
        &mut self,
        height: u64,
        round: i32,
    ) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrevoteWait)
        {
            debug!(height, round, current = %self.rs, "enter_prevote_wait: out of turn, ignoring");
            return Ok(vec![]);
        }
        if !self
            .rs
            .votes
            .prevotes(round)
            .is_some_and(|set| set.has_two_thirds_any())
        {
            invariant_violation!("entered prevote wait at {height}/{round} without +2/3 prevotes");
        }
        info!(height, round, "entering prevote wait");

        let mut actions =
            vec![self.schedule_timeout(self.config.prevote(round), round, Step::PrevoteWait)];
        self.rs.round = round;
        self.rs.step = Step::PrevoteWait;
        actions.push(self.new_step());
        Ok(actions)
    }

    /// Enter Precommit and apply the locking rules against this round's
    /// prevote majority.
    fn enter_precommit(&mut self, height: u64, round: i32) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            debug!(height, round, current = %self.rs, "enter_precommit: out of turn, ignoring");
            return Ok(vec![]);
        }
        info!(height, round, "entering precommit");

        let mut actions = Vec::new();
        let maj23 = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|set| set.two_thirds_majority());

        match maj23 {
            None => {
                // No polka: keep any lock, precommit nil.
                if self.rs.locked_block.is_some() {
                    info!("no polka while locked, precommitting nil");
                } else {
                    info!("no polka, precommitting nil");
                }
                actions.extend(self.sign_add_vote(VoteType::Precommit, BlockId::nil()));
            }
            Some(block_id) => {
                actions.push(Action::Publish(ConsensusEvent::Polka { height, round }));

                if block_id.is_nil() {
                    // Polka for nil releases any lock.
                    if self.rs.locked_block.is_some() {
                        info!("+2/3 prevoted nil, unlocking");
                        self.unlock();
                        actions.push(Action::Publish(ConsensusEvent::Unlock { height, round }));
                    } else {
                        info!("+2/3 prevoted nil");
                    }
                    actions.extend(self.sign_add_vote(VoteType::Precommit, BlockId::nil()));
                } else if self.rs.locked_block_hashes_to(block_id.hash) {
                    info!(%block_id, "+2/3 prevoted our locked block, relocking");
                    self.rs.locked_round = round;
                    actions.push(Action::Publish(ConsensusEvent::Relock { height, round }));
                    actions.extend(self.sign_add_vote(VoteType::Precommit, block_id));
                } else if self.rs.proposal_block_hashes_to(block_id.hash) {
                    info!(%block_id, "+2/3 prevoted the proposal block, locking");
                    let block = self.rs.proposal_block.clone().expect("hash checked");
                    if let Err(e) = block.validate_basic(
                        &self.config.chain_id,
                        self.rs.height,
                        self.rs.validators.validators_hash(),
                    ) {
                        invariant_violation!("+2/3 prevoted an invalid block: {e}");
                    }
                    self.rs.locked_round = round;
                    self.rs.locked_block = Some(block);
                    self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                    actions.push(Action::Publish(ConsensusEvent::Lock { height, round }));
                    actions.extend(self.sign_add_vote(VoteType::Precommit, block_id));
                } else {
                    // Polka for a block we don't have: unlock, re-target
                    // the part set so gossip can fill it, precommit nil.
                    info!(%block_id, "+2/3 prevoted a block we don't have, fetching");
                    self.unlock();
                    if !self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .is_some_and(|parts| parts.has_header(block_id.parts))
                    {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
                    }
                    actions.push(Action::Publish(ConsensusEvent::Unlock { height, round }));
                    actions.extend(self.sign_add_vote(VoteType::Precommit, BlockId::nil()));
                }
            }
        }

        self.rs.round = round;
        self.rs.step = Step::Precommit;
        actions.push(self.new_step());
        Ok(actions)
    }

    fn unlock(&mut self) {
        self.rs.locked_round = -1;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
    }

    /// Enter PrecommitWait: +2/3 precommitted for something; wait for a
    /// decisive majority before moving to the next round.
    fn enter_precommit_wait(
        &mut self,
        height: u64,
        round: i32,
    ) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrecommitWait)
        {
            debug!(height, round, current = %self.rs, "enter_precommit_wait: out of turn, ignoring");
            return Ok(vec![]);
        }
        if !self
            .rs
            .votes
            .precommits(round)
            .is_some_and(|set| set.has_two_thirds_any())
        {
            invariant_violation!(
                "entered precommit wait at {height}/{round} without +2/3 precommits"
            );
        }
        info!(height, round, "entering precommit wait");

        let mut actions =
            vec![self.schedule_timeout(self.config.precommit(round), round, Step::PrecommitWait)];
        self.rs.round = round;
        self.rs.step = Step::PrecommitWait;
        actions.push(self.new_step());
        Ok(actions)
    }

    /// Enter Commit: +2/3 precommitted one block at `commit_round`.
    fn enter_commit(
        &mut self,
        height: u64,
        commit_round: i32,
    ) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height || self.rs.step >= Step::Commit {
            debug!(height, commit_round, current = %self.rs, "enter_commit: out of turn, ignoring");
            return Ok(vec![]);
        }
        info!(height, commit_round, "entering commit");

        let block_id = match self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|set| set.two_thirds_majority())
        {
            Some(id) if !id.is_nil() => id,
            other => invariant_violation!(
                "entered commit at {height}/{commit_round} without a +2/3 block ({other:?})"
            ),
        };

        // The lock has served its purpose; surface the locked block as
        // the proposal block if it is the one being committed.
        if self.rs.locked_block_hashes_to(block_id.hash) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        if !self.rs.proposal_block_hashes_to(block_id.hash)
            && !self
                .rs
                .proposal_block_parts
                .as_ref()
                .is_some_and(|parts| parts.has_header(block_id.parts))
        {
            // Committing a block we don't hold yet: re-target the part
            // set and let gossip deliver it.
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.parts));
        }

        // Keep the round where the majority formed; votes for it live
        // under commit_round, not rs.round.
        self.rs.step = Step::Commit;
        self.rs.commit_round = commit_round;
        self.rs.commit_time = self.now;
        let mut actions = vec![self.new_step()];

        actions.extend(self.try_finalize_commit(height)?);
        Ok(actions)
    }

    /// Finalize if we hold the committed block; otherwise keep waiting
    /// for its parts.
    fn try_finalize_commit(&mut self, height: u64) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height {
            invariant_violation!(
                "try_finalize_commit at height {height} while at {}",
                self.rs.height
            );
        }

        let maj23 = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|set| set.two_thirds_majority());
        let Some(block_id) = maj23.filter(|id| !id.is_nil()) else {
            warn!(height, "cannot finalize: no +2/3 for a block");
            return Ok(vec![]);
        };
        if !self.rs.proposal_block_hashes_to(block_id.hash) {
            debug!(height, %block_id, "cannot finalize yet: missing the committed block");
            return Ok(vec![]);
        }

        self.finalize_commit(height)
    }

    /// Validate the committed block, hand it to the backend, and advance
    /// to the next height.
    fn finalize_commit(&mut self, height: u64) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height || self.rs.step != Step::Commit {
            debug!(height, current = %self.rs, "finalize_commit: out of turn, ignoring");
            return Ok(vec![]);
        }

        let precommits = self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .cloned()
            .expect("commit round set exists");
        let block_id = match precommits.two_thirds_majority() {
            Some(id) if !id.is_nil() => id,
            other => invariant_violation!("finalize without a +2/3 block majority ({other:?})"),
        };
        let Some(mut block) = self.rs.proposal_block.clone() else {
            invariant_violation!("finalize without the committed block");
        };
        if !self
            .rs
            .proposal_block_parts
            .as_ref()
            .is_some_and(|parts| parts.has_header(block_id.parts))
        {
            invariant_violation!("committed part set header does not match the commit");
        }
        if !block.hashes_to(block_id.hash) {
            invariant_violation!("committed block does not hash to the commit");
        }
        if let Err(e) = block.validate_basic(
            &self.config.chain_id,
            height,
            self.rs.validators.validators_hash(),
        ) {
            invariant_violation!("+2/3 committed an invalid block: {e}");
        }

        // Local justification for the commit; may differ from the commit
        // the next block carries.
        let seen_commit = precommits.make_commit()?;
        block.seen_commit = Some(seen_commit);

        info!(height, block = %block, round = self.rs.commit_round, "committing block");

        // Adopt a next-epoch descriptor once it is committed.
        if !block.epoch_bytes.is_empty() {
            match Epoch::from_bytes(&block.epoch_bytes) {
                Ok(next) if next.number == self.epoch.number + 1 => {
                    info!(epoch = next.number, start = next.start_block, "next epoch committed");
                    self.next_epoch = Some(next);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "committed block carries malformed epoch bytes"),
            }
        }

        // Cross-chain duties owed for this block, settled at the next
        // propose point by whichever of us is proposer.
        if self.config.chain_id != self.config.main_chain_id {
            if !block.epoch_bytes.is_empty() {
                info!(height, "block carries epoch bytes, main-chain save pending");
                self.need_to_save = true;
            }
            if block.has_child_chain_withdrawal() {
                info!(height, "block carries a TX3 withdrawal, main-chain broadcast pending");
                self.need_to_broadcast = true;
            }
        }

        let boxed = Box::new(block);
        self.last_committed_block = Some(boxed.clone());

        let mut actions = vec![
            Action::Publish(ConsensusEvent::NewBlock {
                block: boxed.clone(),
            }),
            Action::Publish(ConsensusEvent::NewBlockHeader { height }),
            Action::CommitBlock { block: boxed },
        ];
        actions.extend(self.update_to_next_height(precommits)?);
        Ok(actions)
    }

    /// Reset the round state for the next height and schedule its round 0.
    fn update_to_next_height(
        &mut self,
        precommits: VoteSet,
    ) -> Result<Vec<Action>, InvariantError> {
        let new_height = self.rs.height + 1;

        // Epoch boundary: switch to the committed next epoch's validators.
        let epoch_switch = self
            .next_epoch
            .as_ref()
            .is_some_and(|next| next.start_block == new_height);
        let mut validators = if epoch_switch {
            let next = self.next_epoch.take().expect("checked above");
            info!(epoch = next.number, height = new_height, "entering new epoch");
            self.epoch = next;
            self.epoch.validators.clone()
        } else {
            self.rs.validators.clone()
        };
        validators.increment_accum(1);

        let start_time = self.rs.commit_time + self.config.commit();
        let skip_commit_wait = self.config.skip_timeout_commit && precommits.has_all();

        self.rs = RoundState {
            height: new_height,
            round: 0,
            step: Step::NewHeight,
            start_time,
            commit_time: Duration::ZERO,
            votes: HeightVoteSet::new(
                self.config.chain_id.clone(),
                new_height,
                Arc::new(validators.clone()),
            ),
            validators,
            proposal: None,
            proposal_block: None,
            proposal_block_parts: None,
            locked_round: -1,
            locked_block: None,
            locked_block_parts: None,
            commit_round: -1,
            last_commit: Some(precommits),
        };
        self.block_from_miner = None;

        if skip_commit_wait {
            // Every precommit arrived; no straggler to wait for.
            info!(height = new_height, "skipping commit timeout");
            return self.enter_new_round(new_height, 0);
        }

        let delay = start_time.saturating_sub(self.now);
        Ok(vec![self.schedule_timeout(delay, 0, Step::NewHeight)])
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Message handlers
    // ═══════════════════════════════════════════════════════════════════════════

    fn on_proposal(
        &mut self,
        proposal: Proposal,
        from: Option<PeerId>,
    ) -> Result<Vec<Action>, InvariantError> {
        let behavior = Arc::clone(&self.behavior);
        match behavior.set_proposal(self, proposal) {
            Ok(actions) => Ok(actions),
            Err(ConsensusError::Invariant(e)) => Err(e),
            Err(e) => {
                warn!(error = %e, ?from, "rejected proposal");
                Ok(vec![])
            }
        }
    }

    /// Accept a proposal for the current height and round.
    pub(crate) fn default_set_proposal(
        &mut self,
        proposal: Proposal,
    ) -> Result<Vec<Action>, ConsensusError> {
        // Already have one for this round.
        if self.rs.proposal.is_some() {
            return Ok(vec![]);
        }
        // Not ours to handle: wrong height or round. Future-round
        // proposals are dropped, not buffered; the vote-driven round skip
        // recovers without them.
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!(%proposal, current = %self.rs, "proposal does not apply");
            return Ok(vec![]);
        }
        // Too late to matter.
        if self.rs.step >= Step::Commit {
            return Ok(vec![]);
        }

        if proposal.pol_round != -1
            && (proposal.pol_round < 0 || proposal.pol_round >= proposal.round)
        {
            return Err(ConsensusError::InvalidProposalPOLRound);
        }

        let proposer = self.rs.validators.proposer();
        let sign_bytes = signing::proposal_sign_bytes(&self.config.chain_id, &proposal);
        if !proposer
            .public_key
            .verify(&sign_bytes, &proposal.signature)
        {
            return Err(ConsensusError::InvalidProposalSignature);
        }

        info!(%proposal, "accepted proposal");
        self.rs.proposal_block_parts = Some(PartSet::from_header(proposal.block_parts));
        self.rs.proposal = Some(proposal);
        Ok(vec![])
    }

    fn on_block_part(
        &mut self,
        height: u64,
        round: i32,
        part: Part,
        from: Option<PeerId>,
    ) -> Result<Vec<Action>, InvariantError> {
        if self.rs.height != height {
            debug!(height, part = part.index, "block part for another height, ignoring");
            return Ok(vec![]);
        }
        let Some(parts) = self.rs.proposal_block_parts.as_mut() else {
            // Not expecting parts; without a header there is nothing to
            // verify them against.
            debug!(part = part.index, "unsolicited block part, ignoring");
            return Ok(vec![]);
        };

        // Our own parts were proven when we built them.
        let verify = from.is_some();
        let added = match parts.add_part(part, verify) {
            Ok(added) => added,
            Err(e) => {
                // Suppress complaints about parts from other rounds; block
                // gossip reuses them freely.
                if round == self.rs.round {
                    warn!(error = %e, ?from, "bad block part");
                }
                return Ok(vec![]);
            }
        };
        if !added || !parts.is_complete() {
            return Ok(vec![]);
        }

        let bytes = parts
            .assemble()
            .expect("complete part set always assembles");
        let block = match Block::from_bytes(&bytes) {
            Ok(block) => block,
            Err(e) => {
                warn!(error = %e, "complete part set does not decode to a block");
                return Ok(vec![]);
            }
        };
        info!(height, block = %block, "received complete proposal block");
        self.rs.proposal_block = Some(block);

        if self.rs.step == Step::Propose && self.is_proposal_complete() {
            self.enter_prevote(height, self.rs.round)
        } else if self.rs.step == Step::Commit {
            // This was the block we were waiting on to finalize.
            self.try_finalize_commit(height)
        } else {
            Ok(vec![])
        }
    }

    fn on_vote(&mut self, vote: Vote, from: Option<PeerId>) -> Result<Vec<Action>, InvariantError> {
        match self.try_add_vote(vote, from.clone()) {
            Ok(actions) => Ok(actions),
            Err(ConsensusError::Invariant(e)) => Err(e),
            Err(ConsensusError::VoteHeightMismatch) => {
                // Peer is ahead or behind; not our problem.
                debug!(?from, "vote height mismatch, ignoring");
                Ok(vec![])
            }
            Err(ConsensusError::ConflictingVotes(evidence)) => {
                if from.is_none() {
                    // Only a key-management accident produces this.
                    error!(
                        height = evidence.existing.height,
                        round = evidence.existing.round,
                        "conflicting vote from ourselves; check for duplicated validator keys"
                    );
                } else {
                    warn!(
                        ?from,
                        index = evidence.existing.validator_index,
                        "conflicting votes: equivocation evidence"
                    );
                }
                Ok(vec![])
            }
            Err(e) => {
                // Bad signature or similar; possibly a malicious peer.
                warn!(error = %e, ?from, "failed to add vote");
                Ok(vec![])
            }
        }
    }

    /// Add a vote and run any transitions it unlocks. Surfaces vote
    /// admission errors to the caller, including equivocation evidence.
    pub fn try_add_vote(
        &mut self,
        vote: Vote,
        _from: Option<PeerId>,
    ) -> Result<Vec<Action>, ConsensusError> {
        if vote.height < self.rs.height {
            // Precommits for the height we just committed keep arriving
            // while we wait out the commit timeout. Fold them into the
            // last commit; once every validator is in, there is nobody
            // left to wait for.
            if vote.height + 1 == self.rs.height
                && vote.vote_type == VoteType::Precommit
                && self.rs.step == Step::NewHeight
            {
                let added = match self.rs.last_commit.as_mut() {
                    Some(last_commit) => match last_commit.add_vote(vote.clone()) {
                        Ok(added) => added,
                        Err(e) => {
                            debug!(error = %e, %vote, "straggler precommit rejected");
                            return Ok(vec![]);
                        }
                    },
                    None => false,
                };
                if !added {
                    return Ok(vec![]);
                }
                debug!(%vote, "added straggler precommit to last commit");
                let mut actions = vec![Action::Publish(ConsensusEvent::Vote(vote))];
                let all_in = self
                    .rs
                    .last_commit
                    .as_ref()
                    .is_some_and(|last_commit| last_commit.has_all());
                if self.config.skip_timeout_commit && all_in {
                    info!("all precommits in, skipping commit timeout");
                    actions.extend(self.enter_new_round(self.rs.height, 0)?);
                }
                return Ok(actions);
            }
            debug!(%vote, height = self.rs.height, "vote from a past height, ignoring");
            return Ok(vec![]);
        }
        if vote.height > self.rs.height {
            return Err(ConsensusError::VoteHeightMismatch);
        }

        let added = self.rs.votes.add_vote(vote.clone()).map_err(|e| match e {
            crate::error::VoteSetError::Conflicting(evidence) => {
                ConsensusError::ConflictingVotes(evidence)
            }
            other => ConsensusError::AddingVoteFailed(other),
        })?;
        if !added {
            return Ok(vec![]);
        }

        let mut actions = vec![Action::Publish(ConsensusEvent::Vote(vote.clone()))];
        let height = self.rs.height;

        match vote.vote_type {
            VoteType::Prevote => {
                let (has_any, maj23) = {
                    let prevotes = self
                        .rs
                        .votes
                        .prevotes(vote.round)
                        .expect("vote was just added to this round");
                    (prevotes.has_two_thirds_any(), prevotes.two_thirds_majority())
                };
                debug!(%vote, has_any, ?maj23, "added prevote");

                // A polka in (locked_round, current_round] for another
                // block releases our lock.
                if self.rs.locked_block.is_some()
                    && self.rs.locked_round < vote.round
                    && vote.round <= self.rs.round
                {
                    if let Some(id) = maj23 {
                        if !self.rs.locked_block_hashes_to(id.hash) {
                            info!(
                                locked_round = self.rs.locked_round,
                                pol_round = vote.round,
                                "unlocking: polka for another block"
                            );
                            self.unlock();
                            actions.push(Action::Publish(ConsensusEvent::Unlock {
                                height,
                                round: vote.round,
                            }));
                        }
                    }
                }

                if vote.round >= self.rs.round && has_any {
                    // Round-skip to where the voting is happening.
                    actions.extend(self.enter_new_round(height, vote.round)?);
                    if maj23.is_some() {
                        actions.extend(self.enter_precommit(height, vote.round)?);
                    } else {
                        actions.extend(self.enter_prevote(height, vote.round)?);
                        actions.extend(self.enter_prevote_wait(height, vote.round)?);
                    }
                } else if let Some(proposal) = self.rs.proposal.clone() {
                    // This prevote may have completed the proposal's POL.
                    if proposal.pol_round >= 0
                        && proposal.pol_round == vote.round
                        && self.is_proposal_complete()
                    {
                        actions.extend(self.enter_prevote(height, self.rs.round)?);
                    }
                }
            }
            VoteType::Precommit => {
                let (has_any, maj23) = {
                    let precommits = self
                        .rs
                        .votes
                        .precommits(vote.round)
                        .expect("vote was just added to this round");
                    (
                        precommits.has_two_thirds_any(),
                        precommits.two_thirds_majority(),
                    )
                };
                debug!(%vote, has_any, ?maj23, "added precommit");

                match maj23 {
                    Some(id) if id.is_nil() => {
                        // Decisive nil: this round is dead, move on.
                        actions.extend(self.enter_new_round(height, vote.round + 1)?);
                    }
                    Some(_) => {
                        actions.extend(self.enter_new_round(height, vote.round)?);
                        actions.extend(self.enter_precommit(height, vote.round)?);
                        actions.extend(self.enter_commit(height, vote.round)?);
                    }
                    None if vote.round >= self.rs.round && has_any => {
                        actions.extend(self.enter_new_round(height, vote.round)?);
                        actions.extend(self.enter_precommit(height, vote.round)?);
                        actions.extend(self.enter_precommit_wait(height, vote.round)?);
                    }
                    None => {}
                }
            }
        }

        Ok(actions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Vote signing
    // ═══════════════════════════════════════════════════════════════════════════

    /// Sign a vote for the current position and send it through the
    /// internal queue. No-op when we are not in the validator set.
    fn sign_add_vote(&mut self, vote_type: VoteType, block_id: BlockId) -> Vec<Action> {
        let Some(signer) = &self.priv_validator else {
            return vec![];
        };
        let address = signer.address();
        let Some((index, _)) = self.rs.validators.by_address(&address) else {
            return vec![];
        };

        let mut vote = Vote {
            validator_address: address,
            validator_index: index,
            height: self.rs.height,
            round: self.rs.round,
            vote_type,
            block_id,
            signature: Signature::zero(),
        };
        match signer.sign_vote(&self.config.chain_id, &vote) {
            Ok(signature) => {
                vote.signature = signature;
                info!(%vote, "signed vote");
                vec![Action::SendInternal(Message::Vote(vote))]
            }
            Err(e) => {
                warn!(error = %e, %vote, "failed to sign vote");
                vec![]
            }
        }
    }
}
