//! Connection resilience at node level: backoff cadence, offline
//! queueing, half-open probing, and the no-give-up guarantee.

use fieldnode::hal::sim;
use fieldnode::net::client::BreakerState;

use crate::common::{fresh_node, TestNode};

fn connected_node() -> TestNode {
    let mut node = fresh_node();
    node.boot(0);
    node.run_iteration(10);
    assert!(node.client.is_connected());
    node
}

#[test]
fn reconnect_storm_cadence() {
    let _hw = sim::lock();
    let mut node = connected_node();

    node.link.reachable = false;
    node.link.drop_connection();

    let mut attempts = Vec::new();
    let mut now = 1_000u64;
    while now <= 240_000 {
        let before = node.link.connect_attempts;
        node.run_iteration(now);
        if node.link.connect_attempts > before {
            attempts.push(now);
        }
        now += 100;
    }

    // First attempt lands within 1–2 s of the drop.
    assert!(
        (1_000..=3_000).contains(&attempts[0]),
        "first attempt at {}",
        attempts[0]
    );

    // Dwells double toward the cap, then settle at ~60 s.
    let deltas: Vec<u64> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert_eq!(&deltas[..5], &[1_000, 2_000, 4_000, 8_000, 16_000]);
    for d in &deltas[6..] {
        assert!(
            (59_000..=61_100).contains(d),
            "late dwell should be ~60 s, got {d}"
        );
    }
}

#[test]
fn node_reconnects_within_one_slot_after_recovery() {
    let _hw = sim::lock();
    let mut node = connected_node();

    node.link.reachable = false;
    node.link.drop_connection();
    for now in (1_000..30_000).step_by(100) {
        node.run_iteration(now);
    }
    assert!(!node.client.is_connected());

    node.link.reachable = true;
    let mut now = 30_000u64;
    while !node.client.is_connected() {
        node.run_iteration(now);
        now += 100;
        assert!(now < 100_000, "did not reconnect within one backoff slot");
    }
}

#[test]
fn no_give_up_over_ten_thousand_drops() {
    let _hw = sim::lock();
    let mut node = connected_node();
    let mut now = 1_000u64;
    let mut reconnects = 0u32;

    for _ in 0..10_000 {
        node.link.drop_connection();
        let mut guard = 0;
        loop {
            now += 250;
            node.run_iteration(now);
            if node.client.is_connected() {
                reconnects += 1;
                break;
            }
            guard += 1;
            assert!(
                guard < 100,
                "reconnect stalled after {reconnects} successful recoveries"
            );
        }
    }
    assert_eq!(reconnects, 10_000);
}

#[test]
fn offline_telemetry_queues_and_drains_fifo() {
    let _hw = sim::lock();
    let mut node = connected_node();

    node.link.reachable = false;
    node.link.drop_connection();
    node.run_iteration(1_000);
    assert!(!node.client.is_connected());

    // Three tracker events while offline: each is offered to the
    // messaging client immediately, which queues it.
    let queued_before = node.client.queued();
    for now in [2_000u64, 2_100, 2_200] {
        node.tracker.record(
            9_000 + now as u16,
            fieldnode::error::Severity::Error,
            "synthetic",
            now,
        );
        node.run_iteration(now);
    }
    assert!(node.client.queued() > queued_before, "nothing queued offline");

    node.link.reachable = true;
    node.link.published.clear();
    let mut now = 3_000u64;
    while !node.client.is_connected() {
        node.run_iteration(now);
        now += 100;
        assert!(now < 120_000);
    }

    // Drained events arrive in insertion order on the diagnostics topic.
    let drained: Vec<u64> = node
        .link
        .payloads_for("ctrl/node-1/system/diagnostics")
        .into_iter()
        .map(|p| serde_json::from_slice::<serde_json::Value>(p).unwrap()["code"]
            .as_u64()
            .unwrap())
        .collect();
    let mut sorted = drained.clone();
    sorted.sort_unstable();
    assert_eq!(drained, sorted, "offline queue drain broke FIFO order");
    assert!(drained.len() >= 3);
}

#[test]
fn breaker_opens_and_half_open_probe_bypasses_dwell() {
    let _hw = sim::lock();
    let mut node = connected_node();

    node.link.reachable = false;
    node.link.drop_connection();
    for now in (1_000..80_000).step_by(100) {
        node.run_iteration(now);
    }
    assert_eq!(node.client.breaker_state(), BreakerState::Open);

    // The probe fires as soon as the cooldown expires, despite the
    // 60 s connection dwell still pending.
    let mut now = 80_000u64;
    let probe_at = loop {
        let before = node.link.connect_attempts;
        node.run_iteration(now);
        if node.link.connect_attempts > before {
            break now;
        }
        now += 100;
        assert!(now < 200_000, "half-open probe never fired");
    };
    assert!(probe_at < 145_000, "probe waited out the dwell: {probe_at}");
}
