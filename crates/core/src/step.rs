//! Round steps.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The steps of a consensus round, in order.
///
/// The numeric ordering matters: transition guards compare
/// `(height, round, step)` lexicographically, and a timeout is stale
/// exactly when its step sorts below the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Step {
    /// Waiting out the commit timeout before round 0 of a new height.
    NewHeight = 1,
    /// Setting up a new round before proposing.
    NewRound = 2,
    /// Proposer is waiting for the execution engine's candidate payload.
    WaitForMinerBlock = 3,
    /// Proposal made or awaited; gossiping proposal and parts.
    Propose = 4,
    /// Prevote cast; gossiping prevotes.
    Prevote = 5,
    /// Saw +2/3 prevotes for anything; waiting for stragglers.
    PrevoteWait = 6,
    /// Precommit cast; gossiping precommits.
    Precommit = 7,
    /// Saw +2/3 precommits for anything; waiting for stragglers.
    PrecommitWait = 8,
    /// Saw +2/3 precommits for one block; assembling and finalizing it.
    Commit = 9,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::WaitForMinerBlock => "WaitForMinerBlock",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{name}")
    }
}

/// Lexicographic comparison of two `(height, round, step)` positions.
pub fn compare_hrs(
    h1: u64,
    r1: i32,
    s1: Step,
    h2: u64,
    r2: i32,
    s2: Step,
) -> std::cmp::Ordering {
    (h1, r1, s1).cmp(&(h2, r2, s2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn test_step_order() {
        assert!(Step::NewHeight < Step::NewRound);
        assert!(Step::NewRound < Step::WaitForMinerBlock);
        assert!(Step::WaitForMinerBlock < Step::Propose);
        assert!(Step::Propose < Step::Prevote);
        assert!(Step::PrevoteWait < Step::Precommit);
        assert!(Step::PrecommitWait < Step::Commit);
    }

    #[test]
    fn test_compare_hrs_lexicographic() {
        assert_eq!(
            compare_hrs(2, 0, Step::NewHeight, 1, 9, Step::Commit),
            Ordering::Greater
        );
        assert_eq!(
            compare_hrs(1, 1, Step::Propose, 1, 2, Step::NewRound),
            Ordering::Less
        );
        assert_eq!(
            compare_hrs(1, 1, Step::Propose, 1, 1, Step::Propose),
            Ordering::Equal
        );
    }
}
