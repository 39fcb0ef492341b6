//! Outputs of the state machine.

use crate::{ConsensusEvent, Message, TimeoutInfo};
use tenderbft_types::Block;

/// Actions the state machine wants performed.
///
/// The state machine itself does no I/O: every transition returns the
/// actions it implies, and the driver executes them in order. This keeps
/// transitions deterministic and lets tests run the machine without a
/// runtime.
#[derive(Debug, Clone)]
pub enum Action {
    /// Arm the timeout ticker. Supersedes any pending timeout.
    ScheduleTimeout(TimeoutInfo),

    /// Feed one of our own messages back through the internal queue, and
    /// hand it to the broadcaster for gossip. The driver appends to a
    /// deterministic pending list when the queue is full, preserving FIFO
    /// order of our own votes.
    SendInternal(Message),

    /// Hand a finalized block to the backend for execution and storage.
    CommitBlock { block: Box<Block> },

    /// Ship the committed block's proof data to the main chain. Runs on a
    /// detached task; consensus does not wait for it.
    SaveToMainChain { block: Box<Block> },

    /// Broadcast TX3 proof data for the committed block to the main
    /// chain. Runs on a detached task; consensus does not wait for it.
    BroadcastProofData { block: Box<Block> },

    /// Publish a notification on the event stream.
    Publish(ConsensusEvent),
}
