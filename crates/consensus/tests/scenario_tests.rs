//! End-to-end consensus scenarios on the deterministic harness.
//!
//! Four equal-power validators unless stated otherwise. The harness
//! routes every message explicitly and fires timeouts by advancing a
//! simulated clock, so each scenario is fully reproducible.

mod common;

use common::*;
use std::sync::Arc;
use tenderbft_consensus::{
    ConsensusConfig, ConsensusError, ConsensusState, DefaultBehavior, RoundBehavior,
};
use tenderbft_core::{Action, ConsensusEvent, Event, Message, Step, TimeoutInfo};
use tenderbft_types::{BlockId, Vote, VoteType};

/// Proposes nothing, ever. Used to simulate a crashed or withholding
/// proposer while leaving the rest of the machine untouched.
struct SilentProposer;

impl RoundBehavior for SilentProposer {
    fn decide_proposal(
        &self,
        _state: &mut ConsensusState,
        _height: u64,
        _round: i32,
    ) -> Vec<Action> {
        Vec::new()
    }
}

/// Happy path: the round-0 proposer proposes, everyone prevotes and
/// precommits it, and the block commits at round 0.
#[test]
fn test_happy_path_single_round_commit() {
    let mut harness = Harness::new(4, test_config());
    harness.start_all();
    for i in 0..4 {
        harness.give_miner_block(i, payload(i as u64));
    }

    harness.run_until(Harness::all_committed, 50);

    let expected = harness.nodes[0].committed[0].hash();
    for (i, node) in harness.nodes.iter().enumerate() {
        assert_eq!(node.committed.len(), 1, "node {i} commit count");
        let block = &node.committed[0];
        assert_eq!(block.height, 1);
        assert_eq!(block.hash(), expected, "node {i} committed block");
        let seen = block.seen_commit.as_ref().expect("seen commit attached");
        assert_eq!(seen.round, 0, "committed in round 0");
        assert!(seen.count() >= 3, "+2/3 precommits recorded");
        assert_eq!(node.state.round_state().height, 2, "advanced to height 2");
    }
    harness.assert_no_double_votes();
    harness.assert_no_conflicting_commits();
}

/// A silent round-0 proposer: the others prevote nil after the propose
/// timeout, precommit nil, and the round-1 proposer gets the block
/// through.
#[test]
fn test_silent_proposer_skips_to_round_one() {
    let behaviors: Vec<Arc<dyn RoundBehavior>> = vec![
        Arc::new(SilentProposer),
        Arc::new(DefaultBehavior),
        Arc::new(DefaultBehavior),
        Arc::new(DefaultBehavior),
    ];
    let mut harness = Harness::with_behaviors(4, test_config(), behaviors);
    harness.start_all();
    for i in 0..4 {
        harness.give_miner_block(i, payload(10 + i as u64));
    }

    harness.run_until(Harness::all_committed, 100);

    for (i, node) in harness.nodes.iter().enumerate() {
        let block = &node.committed[0];
        assert_eq!(block.height, 1);
        assert_eq!(
            block.seen_commit.as_ref().unwrap().round,
            1,
            "node {i} committed in round 1"
        );
    }
    harness.assert_no_double_votes();
    harness.assert_no_conflicting_commits();
}

/// Lock & carry: a polka forms in round 0 but the precommits are too
/// thinned out to commit. The locked majority re-prevotes its locked
/// block in round 1 — not the round-1 proposer's fresh block — and that
/// block commits.
#[test]
fn test_locked_block_carries_into_next_round() {
    let mut harness = Harness::new(4, test_config());
    // Round 0 shaping: node 1 never sees the proposal, so it prevotes
    // nil; node 3's precommit is lost, and node 3 itself misses node 2's
    // precommit, so nobody assembles +2/3 precommits for the block.
    harness.filter = Box::new(|from, to, message| match message {
        Message::Proposal(p) if p.round == 0 => to != 1,
        Message::BlockPart { round: 0, .. } => to != 1,
        Message::Vote(v) if v.round == 0 && v.vote_type == VoteType::Precommit => {
            from != 3 && !(from == 2 && to == 3)
        }
        _ => true,
    });
    harness.start_all();
    for i in 0..4 {
        harness.give_miner_block(i, payload(20 + i as u64));
    }

    harness.run_until(
        |h| h.nodes.iter().filter(|n| !n.committed.is_empty()).count() >= 3,
        100,
    );

    // The block that finally committed is the round-0 polka block.
    let committed = harness
        .nodes
        .iter()
        .find_map(|n| n.committed.first().cloned())
        .expect("some node committed");
    assert_eq!(committed.height, 1);
    assert_eq!(
        committed.seen_commit.as_ref().unwrap().round,
        1,
        "committed in round 1"
    );

    // Locked nodes prevoted the locked block in round 1, ignoring the
    // fresh round-1 proposal.
    for i in [0usize, 2, 3] {
        let round1_prevote = harness.nodes[i]
            .sent_votes
            .iter()
            .find(|v| v.height == 1 && v.round == 1 && v.vote_type == VoteType::Prevote)
            .unwrap_or_else(|| panic!("node {i} cast no round-1 prevote"));
        assert_eq!(
            round1_prevote.block_id.hash,
            committed.hash(),
            "node {i} carried its lock into round 1"
        );
    }

    harness.assert_no_double_votes();
    harness.assert_no_conflicting_commits();
}

/// Unlock by higher polka: a validator locked in round 0 sees a polka
/// for a different block in round 2, releases its lock, and precommits
/// the new block.
#[test]
fn test_unlock_on_higher_round_polka() {
    let keys = sorted_keys(4);
    // Drive validator 3 alone; rotation makes validators 0, 1, 2 the
    // proposers of rounds 0, 1, 2.
    let mut state = new_state(
        &keys,
        3,
        test_config(),
        Arc::new(DefaultBehavior),
    );
    let mut out = Outbox::default();

    let (block_b, parts_b) = make_block(&keys, 1);
    let id_b = block_id_of(&block_b, &parts_b);
    let (block_b2, parts_b2) = make_block(&keys, 2);
    let id_b2 = block_id_of(&block_b2, &parts_b2);
    assert_ne!(id_b.hash, id_b2.hash);

    state.start();
    pump(&mut state, timeout(1, 0, Step::NewHeight), &mut out);

    // Round 0: proposal B arrives and we prevote it.
    let proposal = signed_proposal(&keys, 0, 1, 0, parts_b.header(), -1, BlockId::nil());
    pump(
        &mut state,
        Event::Proposal {
            proposal,
            from: Some("node-0".to_string()),
        },
        &mut out,
    );
    pump_parts(&mut state, &parts_b, 0, &mut out);
    assert_eq!(out.last_vote().block_id, id_b);

    // Peers 0..2 prevote B: polka, so we lock and precommit B.
    for index in 0..3u32 {
        let vote = signed_vote(&keys, index, 1, 0, VoteType::Prevote, id_b);
        pump(&mut state, peer_vote(vote), &mut out);
    }
    assert_eq!(state.round_state().locked_round, 0);
    assert!(state.round_state().locked_block_hashes_to(id_b.hash));
    assert_eq!(out.last_vote().vote_type, VoteType::Precommit);
    assert_eq!(out.last_vote().block_id, id_b);

    // Peers precommit nil: the round is dead, on to round 1.
    for index in 0..3u32 {
        let vote = signed_vote(&keys, index, 1, 0, VoteType::Precommit, BlockId::nil());
        pump(&mut state, peer_vote(vote), &mut out);
    }
    assert_eq!(state.round_state().round, 1);

    // Round 1: no proposal reaches us; prevote our locked block on the
    // propose timeout.
    pump(&mut state, timeout(1, 1, Step::Propose), &mut out);
    let round1_prevote = out.last_vote().clone();
    assert_eq!(round1_prevote.round, 1);
    assert_eq!(round1_prevote.block_id, id_b, "still locked on B");

    // Split prevotes (one for B, two nil): no polka, precommit nil, lock
    // intact.
    pump(
        &mut state,
        peer_vote(signed_vote(&keys, 0, 1, 1, VoteType::Prevote, id_b)),
        &mut out,
    );
    for index in 1..3u32 {
        let vote = signed_vote(&keys, index, 1, 1, VoteType::Prevote, BlockId::nil());
        pump(&mut state, peer_vote(vote), &mut out);
    }
    pump(&mut state, timeout(1, 1, Step::PrevoteWait), &mut out);
    assert_eq!(out.last_vote().vote_type, VoteType::Precommit);
    assert!(out.last_vote().block_id.is_nil());
    assert_eq!(state.round_state().locked_round, 0, "lock survives round 1");

    for index in 0..3u32 {
        let vote = signed_vote(&keys, index, 1, 1, VoteType::Precommit, BlockId::nil());
        pump(&mut state, peer_vote(vote), &mut out);
    }
    assert_eq!(state.round_state().round, 2);

    // Round 2: proposer 2 proposes B'. We are locked, so we prevote B
    // regardless.
    let proposal = signed_proposal(&keys, 2, 1, 2, parts_b2.header(), -1, BlockId::nil());
    pump(
        &mut state,
        Event::Proposal {
            proposal,
            from: Some("node-2".to_string()),
        },
        &mut out,
    );
    pump_parts(&mut state, &parts_b2, 2, &mut out);
    assert_eq!(out.last_vote().block_id, id_b, "locked prevote in round 2");

    // Polka for B' in round 2: higher than our locked round, so we
    // unlock, relock on B', and precommit it.
    for index in 0..3u32 {
        let vote = signed_vote(&keys, index, 1, 2, VoteType::Prevote, id_b2);
        pump(&mut state, peer_vote(vote), &mut out);
    }
    assert!(
        out.events
            .iter()
            .any(|e| matches!(e, ConsensusEvent::Unlock { round: 2, .. })),
        "unlock fired"
    );
    assert_eq!(state.round_state().locked_round, 2);
    assert!(state.round_state().locked_block_hashes_to(id_b2.hash));
    assert_eq!(out.last_vote().vote_type, VoteType::Precommit);
    assert_eq!(out.last_vote().block_id, id_b2, "precommitted the new block");
}

/// Equivocation: a second differing vote from the same validator is
/// rejected and both signed votes come back as evidence.
#[test]
fn test_conflicting_votes_surface_evidence() {
    let keys = sorted_keys(4);
    let mut state = new_state(
        &keys,
        3,
        test_config(),
        Arc::new(DefaultBehavior),
    );
    let mut out = Outbox::default();
    state.start();
    pump(&mut state, timeout(1, 0, Step::NewHeight), &mut out);

    let (block_b, parts_b) = make_block(&keys, 1);
    let (block_b2, parts_b2) = make_block(&keys, 2);
    let first = signed_vote(&keys, 0, 1, 0, VoteType::Prevote, block_id_of(&block_b, &parts_b));
    let second = signed_vote(
        &keys,
        0,
        1,
        0,
        VoteType::Prevote,
        block_id_of(&block_b2, &parts_b2),
    );

    state
        .try_add_vote(first.clone(), Some("node-0".to_string()))
        .expect("first vote accepted");
    match state.try_add_vote(second.clone(), Some("node-0".to_string())) {
        Err(ConsensusError::ConflictingVotes(evidence)) => {
            assert_eq!(evidence.existing, first);
            assert_eq!(evidence.new, second);
        }
        other => panic!("expected conflicting-vote evidence, got {other:?}"),
    }
}

/// With `skip_timeout_commit`, a node that has seen every precommit
/// starts the next height without waiting out the commit timeout.
#[test]
fn test_skip_commit_timeout_advances_immediately() {
    let config = ConsensusConfig {
        skip_timeout_commit: true,
        ..test_config()
    };
    let mut harness = Harness::new(4, config);
    harness.start_all();
    for i in 0..4 {
        harness.give_miner_block(i, payload(30 + i as u64));
    }

    harness.run_until(Harness::all_committed, 50);
    // Only the zero-delay NewHeight timers have fired; the simulated
    // clock never reached the commit timeout.
    assert!(harness.now < harness.nodes[0].state.config().commit());

    for (i, node) in harness.nodes.iter().enumerate() {
        let rs = node.state.round_state();
        assert_eq!(rs.height, 2, "node {i} at height 2");
        assert!(
            rs.step > Step::NewHeight,
            "node {i} moved past NewHeight without the commit wait (step {})",
            rs.step
        );
    }
    harness.assert_no_double_votes();
    harness.assert_no_conflicting_commits();
}

fn timeout(height: u64, round: i32, step: Step) -> Event {
    Event::Timeout(TimeoutInfo {
        duration: std::time::Duration::ZERO,
        height,
        round,
        step,
    })
}

fn peer_vote(vote: Vote) -> Event {
    Event::Vote {
        vote,
        from: Some("peer".to_string()),
    }
}
