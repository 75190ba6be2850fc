//! Command dispatch: correlation, verbs, durations, validation.

use fieldnode::hal::sim;

use crate::common::{all_json, fresh_node, last_json, TestNode};

fn node_with_relay(pin: u8) -> TestNode {
    let mut node = fresh_node();
    node.boot(0);
    node.run_iteration(10);
    let cfg = format!(
        r#"{{"actuators":[{{"gpio":{pin},"actuator_type":"relay","actuator_name":"r{pin}"}}]}}"#
    );
    node.link.inject("ctrl/node-1/config", cfg.as_bytes());
    node.run_iteration(20);
    assert!(node.actuators.has_actuator_on(pin));
    node
}

#[test]
fn command_response_echoes_correlation_id() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link.inject(
        "ctrl/node-1/actuator/5/command",
        br#"{"command":"on","correlation_id":"abc-123"}"#,
    );
    node.run_iteration(30);

    let response = last_json(&node, "ctrl/node-1/actuator/5/response").expect("no response");
    assert_eq!(response["success"], true);
    assert_eq!(response["correlation_id"], "abc-123");
    assert_eq!(response["command"], "on");

    let status = last_json(&node, "ctrl/node-1/actuator/5/status").expect("no status");
    assert_eq!(status["state"], true);
    assert!(sim::output_level(5));
}

#[test]
fn response_lands_in_the_same_iteration() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link.inject(
        "ctrl/node-1/actuator/5/command",
        br#"{"command":"on","correlation_id":"x1"}"#,
    );
    let before = node.link.published.len();
    node.run_iteration(30);
    let new: Vec<_> = node.link.published[before..]
        .iter()
        .map(|(t, _, _)| t.as_str())
        .collect();
    assert!(
        new.contains(&"ctrl/node-1/actuator/5/response"),
        "response must be emitted in the iteration that received the command"
    );
}

#[test]
fn toggle_flips_state() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"toggle"}"#);
    node.run_iteration(30);
    assert!(sim::output_level(5));

    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"toggle"}"#);
    node.run_iteration(40);
    assert!(!sim::output_level(5));
}

#[test]
fn pwm_verb_needs_a_value_in_range() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link.inject(
        "ctrl/node-1/actuator/5/command",
        br#"{"command":"pwm","value":1.5,"correlation_id":"r1"}"#,
    );
    node.run_iteration(30);
    let response = last_json(&node, "ctrl/node-1/actuator/5/response").unwrap();
    assert_eq!(response["success"], false);
    assert_eq!(response["correlation_id"], "r1");

    node.link.inject(
        "ctrl/node-1/actuator/5/command",
        br#"{"command":"pwm","correlation_id":"r2"}"#,
    );
    node.run_iteration(40);
    let response = last_json(&node, "ctrl/node-1/actuator/5/response").unwrap();
    assert_eq!(response["success"], false);
}

#[test]
fn duration_auto_off_fires_from_the_loop() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link.inject(
        "ctrl/node-1/actuator/5/command",
        br#"{"command":"on","duration":30}"#,
    );
    node.run_iteration(1_000);
    assert!(sim::output_level(5));

    node.run_iteration(30_900);
    assert!(sim::output_level(5), "auto-off fired early");

    node.run_iteration(31_100);
    assert!(!sim::output_level(5), "auto-off never fired");
    let status = last_json(&node, "ctrl/node-1/actuator/5/status").unwrap();
    assert_eq!(status["state"], false);
}

#[test]
fn command_for_unconfigured_pin_fails_cleanly() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link.inject(
        "ctrl/node-1/actuator/13/command",
        br#"{"command":"on","correlation_id":"ghost"}"#,
    );
    node.run_iteration(30);
    let response = last_json(&node, "ctrl/node-1/actuator/13/response").expect("no response");
    assert_eq!(response["success"], false);
    assert_eq!(response["correlation_id"], "ghost");
}

#[test]
fn malformed_command_still_gets_a_response() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    node.link
        .inject("ctrl/node-1/actuator/5/command", b"{\"command\": ");
    node.run_iteration(30);
    let response = last_json(&node, "ctrl/node-1/actuator/5/response").expect("no response");
    assert_eq!(response["success"], false);
}

#[test]
fn every_command_gets_exactly_one_response() {
    let _hw = sim::lock();
    let mut node = node_with_relay(5);

    for (i, payload) in [
        br#"{"command":"on"}"#.as_slice(),
        br#"{"command":"off"}"#.as_slice(),
        br#"{"command":"dance"}"#.as_slice(),
    ]
    .iter()
    .enumerate()
    {
        node.link.inject("ctrl/node-1/actuator/5/command", payload);
        node.run_iteration(30 + i as u64 * 10);
    }

    let responses = all_json(&node, "ctrl/node-1/actuator/5/response");
    assert_eq!(responses.len(), 3);
}
