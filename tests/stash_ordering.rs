//! Contended blocks are stashed and replayed ahead of the next live block.

use lunahost::harness::RtHarness;
use lunahost::invariant_rt::{contract_test_rt, INV_STASH_OVERFLOW, INV_STASH_REPLAYED};
use lunahost::host::BypassReason;
use lunahost::{BlockOutcome, HostConfig};
use proptest::prelude::*;

fn echo_harness() -> RtHarness {
    RtHarness::new(HostConfig::default().with_initial_code("echo")).unwrap()
}

#[test]
fn stashed_block_is_flushed_at_block_start() {
    let mut h = echo_harness();
    h.set_input(0, &[(3, 1), (40, 2)]);
    assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);
    assert!(h.host.is_replay_pending());
    // Bypass output while contended.
    assert!(h.output_events(0).is_empty());

    h.set_input(0, &[(0, 3), (10, 4)]);
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: true });
    assert_eq!(h.output_events(0), vec![(0, 1), (0, 2), (0, 3), (10, 4)]);
    assert!(!h.host.is_replay_pending());

    let stats = h.host.stats();
    assert_eq!(stats.blocks_stashed, 1);
    assert_eq!(stats.replays, 1);
}

#[test]
fn several_stashed_blocks_replay_once() {
    let mut h = RtHarness::new(HostConfig::default().with_initial_code("count")).unwrap();
    for _ in 0..3 {
        h.set_input(0, &[(1, 0), (2, 0)]);
        assert_eq!(h.run_block_contended(32), BlockOutcome::Stashed);
    }
    h.set_input(0, &[(5, 0)]);
    assert_eq!(h.run_block(32), BlockOutcome::Processed { replayed: true });
    // Replay counted six events and emitted at its last frame, then zeroed;
    // the live block adds one more.
    assert_eq!(h.output_events(0), vec![(0, 6), (31, 7)]);
}

#[test]
fn stash_overflow_drops_and_counts() {
    // Room for the sequence header and two int events.
    let config = HostConfig::default()
        .with_initial_code("echo")
        .with_stash_capacity(64);
    let mut h = RtHarness::new(config).unwrap();
    h.set_input(0, &[(0, 1), (1, 2), (2, 3)]);
    assert_eq!(h.run_block_contended(16), BlockOutcome::Stashed);
    h.set_input(0, &[]);
    assert_eq!(h.run_block(16), BlockOutcome::Processed { replayed: true });
    assert_eq!(h.output_events(0), vec![(0, 1), (0, 2)]);
    assert_eq!(h.host.stats().stash_dropped, 1);

    let signals = h.worker.drain_signals();
    contract_test_rt(
        "stash overflow",
        &signals,
        &[INV_STASH_OVERFLOW, INV_STASH_REPLAYED],
    );
}

#[test]
fn out_of_range_event_time_is_dropped_while_stashing() {
    let mut h = echo_harness();
    assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);
    h.set_input(0, &[(7, 1), (i64::MAX, 2)]);
    assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);

    h.set_input(0, &[(3, 3)]);
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: true });
    assert_eq!(h.output_events(0), vec![(0, 1), (3, 3)]);
    assert_eq!(h.host.stats().stash_dropped, 1);
}

#[test]
fn failed_live_run_does_not_replay_twice() {
    let config = HostConfig::default().with_initial_code("count\nflood 2500");
    let mut h = RtHarness::new(config).unwrap();
    h.set_input(0, &[(1, 0), (2, 0)]);
    assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);

    // The replay fits the output port, the live block's flood does not.
    h.set_input(0, &[(3, 0)]);
    assert_eq!(
        h.run_block(64),
        BlockOutcome::Bypassed(BypassReason::Overflow)
    );
    assert!(!h.host.is_replay_pending());
    assert_eq!(h.host.stats().replays, 0);

    h.worker.load_script("count").unwrap();
    h.set_input(0, &[]);
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: false });
    assert_eq!(h.output_events(0), vec![(63, 3)]);
}

#[test]
fn sticky_error_during_replay_spends_the_stash() {
    let mut h = RtHarness::new(HostConfig::default().with_initial_code("fail")).unwrap();
    h.set_input(0, &[(1, 5)]);
    assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);

    h.set_input(0, &[(2, 6)]);
    assert_eq!(h.run_block(64), BlockOutcome::Bypassed(BypassReason::Error));
    assert!(!h.host.is_replay_pending());
    assert!(h.output_events(0).is_empty());

    h.worker.load_script("echo").unwrap();
    h.set_input(0, &[(4, 9)]);
    assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: false });
    assert_eq!(h.output_events(0), vec![(4, 9)]);
}

#[test]
fn out_of_memory_during_replay_spends_the_stash() {
    let config = HostConfig::default()
        .with_initial_region_size(8192)
        .with_max_regions(1)
        .with_initial_code("churn 20000\necho");
    let mut h = RtHarness::new(config).unwrap();
    h.set_input(0, &[(1, 5)]);
    assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);

    h.set_input(0, &[(2, 6)]);
    assert_eq!(
        h.run_block(64),
        BlockOutcome::Bypassed(BypassReason::OutOfMemory)
    );
    assert!(!h.host.is_replay_pending());
    assert!(h.output_events(0).is_empty());

    let stats = h.host.stats();
    assert_eq!(stats.replays, 0);
    assert_eq!(stats.growth_requests, 0);

    // Not sticky: the script keeps running, still without memory.
    assert_eq!(
        h.run_block(64),
        BlockOutcome::Bypassed(BypassReason::OutOfMemory)
    );
    assert!(!h.host.is_replay_pending());
}

fn block() -> impl Strategy<Value = Vec<(i64, i32)>> {
    prop::collection::vec((0i64..64, any::<i32>()), 0..12).prop_map(|mut events| {
        events.sort_by_key(|&(t, _)| t);
        events
    })
}

proptest! {
    #[test]
    fn replay_preserves_order_and_events(b1 in block(), b2 in block()) {
        let mut h = echo_harness();
        h.set_input(0, &b1);
        prop_assert_eq!(h.run_block_contended(64), BlockOutcome::Stashed);
        h.set_input(0, &b2);
        prop_assert_eq!(h.run_block(64), BlockOutcome::Processed { replayed: true });

        let out = h.output_events(0);
        prop_assert!(out.windows(2).all(|w| w[0].0 <= w[1].0));

        let mut got: Vec<i64> = out.iter().map(|&(_, v)| v).collect();
        let mut want: Vec<i64> = b1.iter().chain(&b2).map(|&(_, v)| i64::from(v)).collect();
        got.sort_unstable();
        want.sort_unstable();
        prop_assert_eq!(got, want);
    }
}
