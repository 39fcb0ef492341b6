//! The consensus driver.
//!
//! One tokio task owns the state machine and serializes its three input
//! streams: peer messages, our own internal messages, and ticker
//! timeouts. Every transition runs to completion while holding the state
//! mutex; the mutex is uncontended inside the driver and exists so
//! observers can take consistent snapshots.
//!
//! The driver executes the actions each transition returns: arming the
//! ticker, committing blocks to the backend, publishing notifications,
//! and feeding our own messages back through the internal queue. When the
//! internal queue is full the overflow goes to a local FIFO list drained
//! before the next select, so our own votes are never reordered.
//!
//! Cross-chain calls can block for tens of seconds, so they run on
//! detached blocking tasks; consensus never waits for the main chain.

use crate::state::ConsensusState;
use crate::ticker::TimeoutTicker;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tenderbft_core::{
    Action, Backend, ConsensusEvent, CrossChainHelper, Event, Message, PeerId,
};
use tenderbft_types::{ExecPayload, Part, PartSet, Proposal, ValidatorSet, Vote};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::round_state::RoundState;

/// Capacity of the peer and internal message queues.
const MSG_QUEUE_SIZE: usize = 1000;

/// Capacity of the published event stream. Slow subscribers lag and skip;
/// the driver never blocks on them.
const EVENT_STREAM_SIZE: usize = 256;

/// Public interface for feeding messages into consensus and observing it.
///
/// Senders may block when the corresponding queue is full.
#[derive(Clone)]
pub struct ConsensusHandle {
    peer_tx: mpsc::Sender<Event>,
    internal_tx: mpsc::Sender<Event>,
    state: Arc<Mutex<ConsensusState>>,
    events: broadcast::Sender<ConsensusEvent>,
}

impl ConsensusHandle {
    /// Feed a vote in. `from` is `None` for our own votes.
    pub async fn add_vote(&self, vote: Vote, from: Option<PeerId>) {
        self.send(Event::Vote { vote, from }).await;
    }

    /// Feed a proposal in.
    pub async fn set_proposal(&self, proposal: Proposal, from: Option<PeerId>) {
        self.send(Event::Proposal { proposal, from }).await;
    }

    /// Feed a block part in.
    pub async fn add_block_part(&self, height: u64, round: i32, part: Part, from: Option<PeerId>) {
        self.send(Event::BlockPart {
            height,
            round,
            part,
            from,
        })
        .await;
    }

    /// Feed a proposal and all parts of its block in.
    pub async fn set_proposal_and_block(
        &self,
        proposal: Proposal,
        parts: &PartSet,
        from: Option<PeerId>,
    ) {
        let height = proposal.height;
        let round = proposal.round;
        self.set_proposal(proposal, from.clone()).await;
        for index in 0..parts.total() {
            if let Some(part) = parts.part(index) {
                self.add_block_part(height, round, part.clone(), from.clone())
                    .await;
            }
        }
    }

    /// Deliver the execution engine's candidate payload.
    pub async fn submit_miner_block(&self, payload: ExecPayload) {
        let _ = self
            .internal_tx
            .send(Event::MinerBlock { payload })
            .await;
    }

    async fn send(&self, event: Event) {
        let queue = match &event {
            Event::Proposal { from, .. }
            | Event::BlockPart { from, .. }
            | Event::Vote { from, .. }
                if from.is_some() =>
            {
                &self.peer_tx
            }
            _ => &self.internal_tx,
        };
        if queue.send(event).await.is_err() {
            debug!("consensus driver is gone, dropping message");
        }
    }

    /// Deep snapshot of the current round state.
    pub fn round_state(&self) -> RoundState {
        self.state.lock().round_state().clone()
    }

    /// The current height and its validator set.
    pub fn validators(&self) -> (u64, ValidatorSet) {
        let state = self.state.lock();
        let rs = state.round_state();
        (rs.height, rs.validators.clone())
    }

    /// Subscribe to the consensus event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<ConsensusEvent> {
        self.events.subscribe()
    }
}

/// Controls the driver task's lifetime. Dropping it shuts the driver
/// down.
#[derive(Debug)]
pub struct ShutdownHandle {
    quit: Option<oneshot::Sender<()>>,
    done: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// Signal shutdown without waiting.
    pub fn shutdown(mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
    }

    /// Signal shutdown and wait for the driver to finish its current
    /// event and stop.
    pub async fn shutdown_and_wait(mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        while !*self.done.borrow() {
            if self.done.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
    }
}

/// Spawns and runs the consensus task.
pub struct ConsensusDriver;

impl ConsensusDriver {
    /// Start consensus. The returned handle feeds and observes it; the
    /// shutdown handle stops it.
    pub fn spawn(state: ConsensusState) -> (ConsensusHandle, ShutdownHandle) {
        let backend = state.backend_arc();
        let cross_chain = state.cross_chain_arc();

        let (peer_tx, mut peer_rx) = mpsc::channel::<Event>(MSG_QUEUE_SIZE);
        let (internal_tx, mut internal_rx) = mpsc::channel::<Event>(MSG_QUEUE_SIZE);
        let (events_tx, _) = broadcast::channel(EVENT_STREAM_SIZE);
        let (quit_tx, mut quit_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = watch::channel(false);

        let state = Arc::new(Mutex::new(state));
        let handle = ConsensusHandle {
            peer_tx,
            internal_tx: internal_tx.clone(),
            state: Arc::clone(&state),
            events: events_tx.clone(),
        };

        tokio::spawn(async move {
            let (ticker, mut tick_rx) = TimeoutTicker::spawn();
            let started = Instant::now();

            let mut ctx = DriverContext {
                state,
                backend,
                cross_chain,
                ticker,
                internal_tx,
                pending_internal: VecDeque::new(),
                events_tx,
                started,
            };

            let initial = {
                let mut st = ctx.state.lock();
                st.set_now(ctx.started.elapsed());
                st.start()
            };
            ctx.execute(initial);

            loop {
                ctx.drain_pending_internal();
                tokio::select! {
                    biased;
                    _ = &mut quit_rx => {
                        info!("consensus driver shutting down");
                        break;
                    }
                    // Internal before peer: consequences of our own
                    // transitions come first.
                    Some(event) = internal_rx.recv() => ctx.process(event),
                    Some(event) = peer_rx.recv() => ctx.process(event),
                    Some(info) = tick_rx.recv() => ctx.process(Event::Timeout(info)),
                }
            }

            ctx.ticker.stop();
            let _ = done_tx.send(true);
        });

        (
            handle,
            ShutdownHandle {
                quit: Some(quit_tx),
                done: done_rx,
            },
        )
    }
}

struct DriverContext {
    state: Arc<Mutex<ConsensusState>>,
    backend: Arc<dyn Backend>,
    cross_chain: Arc<dyn CrossChainHelper>,
    ticker: TimeoutTicker,
    internal_tx: mpsc::Sender<Event>,
    /// Internal messages that did not fit in the queue, drained in order
    /// before each select.
    pending_internal: VecDeque<Event>,
    events_tx: broadcast::Sender<ConsensusEvent>,
    started: Instant,
}

impl DriverContext {
    fn process(&mut self, event: Event) {
        let result = {
            let mut state = self.state.lock();
            state.set_now(self.started.elapsed());
            state.handle(event)
        };
        match result {
            Ok(actions) => self.execute(actions),
            Err(violation) => {
                // A broken safety assumption. Continuing could sign
                // conflicting votes; stopping here is the safe option.
                error!(%violation, "consensus invariant violated, aborting");
                std::process::abort();
            }
        }
    }

    fn execute(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::ScheduleTimeout(info) => self.ticker.schedule(info),
                Action::SendInternal(message) => self.send_internal(message),
                Action::CommitBlock { block } => {
                    if let Err(e) = self.backend.commit(&block, &[]) {
                        error!(error = %e, height = block.height, "backend commit failed");
                    }
                }
                Action::SaveToMainChain { block } => {
                    let cross_chain = Arc::clone(&self.cross_chain);
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = cross_chain.save_block_proof(&block) {
                            warn!(error = %e, height = block.height, "saving block proof to main chain failed");
                        }
                    });
                }
                Action::BroadcastProofData { block } => {
                    let cross_chain = Arc::clone(&self.cross_chain);
                    tokio::task::spawn_blocking(move || {
                        if let Err(e) = cross_chain.broadcast_tx3_proof(&block) {
                            warn!(error = %e, height = block.height, "broadcasting TX3 proof data failed");
                        }
                    });
                }
                Action::Publish(event) => {
                    // Only fails when nobody subscribes, which is fine.
                    let _ = self.events_tx.send(event);
                }
            }
        }
    }

    /// Gossip one of our own messages and loop it back through the
    /// internal queue.
    fn send_internal(&mut self, message: Message) {
        self.backend.broadcaster().broadcast(&message);
        let event = match message {
            Message::Proposal(proposal) => Event::Proposal {
                proposal,
                from: None,
            },
            Message::BlockPart {
                height,
                round,
                part,
            } => Event::BlockPart {
                height,
                round,
                part,
                from: None,
            },
            Message::Vote(vote) => Event::Vote { vote, from: None },
        };
        self.queue_internal(event);
    }

    fn queue_internal(&mut self, event: Event) {
        if !self.pending_internal.is_empty() {
            // Keep strict FIFO: never jump the overflow line.
            self.pending_internal.push_back(event);
            return;
        }
        if let Err(mpsc::error::TrySendError::Full(event)) = self.internal_tx.try_send(event) {
            warn!("internal queue full, deferring message");
            self.pending_internal.push_back(event);
        }
    }

    fn drain_pending_internal(&mut self) {
        while let Some(event) = self.pending_internal.pop_front() {
            match self.internal_tx.try_send(event) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.pending_internal.push_front(event);
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }
}
