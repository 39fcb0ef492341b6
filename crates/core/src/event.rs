//! Inputs to and observable outputs of the state machine.

use crate::Step;
use std::time::Duration;
use tenderbft_types::{Block, ExecPayload, Part, Proposal, Vote};

/// Identifies the peer a message came from. `None` means the message is
/// our own, from the internal queue.
pub type PeerId = String;

/// A requested or fired timeout, tagged with the position it was armed
/// for so stale firings can be filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutInfo {
    pub duration: Duration,
    pub height: u64,
    pub round: i32,
    pub step: Step,
}

impl std::fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} ; {}/{} {}",
            self.duration, self.height, self.round, self.step
        )
    }
}

/// All possible inputs to the consensus state machine.
///
/// Events are passive data; the driver serializes them from the peer
/// queue, the internal queue, and the timeout ticker.
#[derive(Debug, Clone)]
pub enum Event {
    /// A proposal arrived.
    Proposal {
        proposal: Proposal,
        from: Option<PeerId>,
    },
    /// A block part arrived.
    BlockPart {
        height: u64,
        round: i32,
        part: Part,
        from: Option<PeerId>,
    },
    /// A vote arrived.
    Vote { vote: Vote, from: Option<PeerId> },
    /// The execution engine delivered a candidate payload for the next
    /// block.
    MinerBlock { payload: ExecPayload },
    /// A scheduled timeout fired.
    Timeout(TimeoutInfo),
}

/// Notifications published on the consensus event stream.
///
/// Observers (gossip reactor, RPC, metrics) subscribe to these; the state
/// machine never waits on them.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    NewRoundStep {
        height: u64,
        round: i32,
        step: Step,
    },
    NewRound {
        height: u64,
        round: i32,
    },
    CompleteProposal {
        height: u64,
        round: i32,
    },
    /// +2/3 prevotes for one block id at the given round.
    Polka {
        height: u64,
        round: i32,
    },
    Lock {
        height: u64,
        round: i32,
    },
    Unlock {
        height: u64,
        round: i32,
    },
    Relock {
        height: u64,
        round: i32,
    },
    Vote(Vote),
    TimeoutPropose {
        height: u64,
        round: i32,
    },
    TimeoutWait {
        height: u64,
        round: i32,
    },
    NewBlock {
        block: Box<Block>,
    },
    NewBlockHeader {
        height: u64,
    },
}
