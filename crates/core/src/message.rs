//! Gossipable consensus messages.

use tenderbft_types::{Part, Proposal, Vote};

/// A consensus message, from a peer or from ourselves.
///
/// Self-generated messages travel the internal queue; peer messages
/// arrive through the gossip layer. Both feed the same handlers.
#[derive(Debug, Clone)]
pub enum Message {
    Proposal(Proposal),
    BlockPart { height: u64, round: i32, part: Part },
    Vote(Vote),
}

impl Message {
    /// Short label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Proposal(_) => "proposal",
            Message::BlockPart { .. } => "block_part",
            Message::Vote(_) => "vote",
        }
    }
}
