//! Property tests for vote tallying and timeout filtering.

mod common;

use common::*;
use proptest::prelude::*;
use std::sync::Arc;
use tenderbft_consensus::VoteSet;
use tenderbft_core::{Event, Step, TimeoutInfo};
use tenderbft_types::{BlockId, Hash, PartSetHeader, VoteType};

fn block_id(tag: u8) -> BlockId {
    BlockId::new(Hash::of(&[tag]), PartSetHeader::empty())
}

proptest! {
    /// Once a vote set records a two-thirds majority, no later vote —
    /// in any arrival order — changes it.
    #[test]
    fn maj23_stable_under_any_ordering(order in Just((0u32..7).collect::<Vec<_>>()).prop_shuffle()) {
        let keys = sorted_keys(7);
        let validators = Arc::new(validator_set(&keys));
        let mut set = VoteSet::new(
            CHAIN_ID.to_string(),
            1,
            0,
            VoteType::Prevote,
            validators,
        );

        // Validators 0..5 vote A, 5..7 vote B. A ends with 5/7 of the
        // power, so whichever order the votes land in, the majority is A.
        let mut first_maj = None;
        for index in order {
            let target = if index < 5 { block_id(0xaa) } else { block_id(0xbb) };
            set.add_vote(signed_vote(&keys, index, 1, 0, VoteType::Prevote, target))
                .unwrap();
            match (first_maj, set.two_thirds_majority()) {
                (None, Some(id)) => first_maj = Some(id),
                (Some(expected), current) => prop_assert_eq!(current, Some(expected)),
                (None, None) => {}
            }
        }
        prop_assert_eq!(first_maj, Some(block_id(0xaa)));
    }
}

/// Timeouts tagged with a stale position are ignored: only a timeout
/// matching the machine's current height, round, and step transitions it.
#[test]
fn test_stale_timeouts_ignored() {
    let keys = sorted_keys(4);
    let mut state = new_state(
        &keys,
        3,
        test_config(),
        Arc::new(tenderbft_consensus::DefaultBehavior),
    );
    let mut out = Outbox::default();
    state.start();
    pump(
        &mut state,
        Event::Timeout(TimeoutInfo {
            duration: std::time::Duration::ZERO,
            height: 1,
            round: 0,
            step: Step::NewHeight,
        }),
        &mut out,
    );
    assert_eq!(state.round_state().step, Step::Propose);

    let before_votes = out.sent_votes().len();

    // Wrong height.
    pump(
        &mut state,
        Event::Timeout(TimeoutInfo {
            duration: std::time::Duration::ZERO,
            height: 9,
            round: 0,
            step: Step::Propose,
        }),
        &mut out,
    );
    // Step below the current one.
    pump(
        &mut state,
        Event::Timeout(TimeoutInfo {
            duration: std::time::Duration::ZERO,
            height: 1,
            round: 0,
            step: Step::NewHeight,
        }),
        &mut out,
    );
    assert_eq!(state.round_state().step, Step::Propose, "state unchanged");
    assert_eq!(out.sent_votes().len(), before_votes, "no votes from stale timeouts");

    // The matching timeout does transition: propose deadline passes and
    // we prevote nil (no proposal ever arrived).
    pump(
        &mut state,
        Event::Timeout(TimeoutInfo {
            duration: std::time::Duration::ZERO,
            height: 1,
            round: 0,
            step: Step::Propose,
        }),
        &mut out,
    );
    assert_eq!(state.round_state().step, Step::Prevote);
    let vote = out.last_vote();
    assert_eq!(vote.vote_type, VoteType::Prevote);
    assert!(vote.block_id.is_nil());
}
