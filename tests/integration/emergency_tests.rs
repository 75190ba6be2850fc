//! Emergency lifecycle and runtime protection at node level.

use fieldnode::hal::sim;
use fieldnode::safety::SystemState;

use crate::common::{all_json, fresh_node, last_json, TestNode};

fn node_with_pump(pin: u8, max_runtime_ms: u32, cooldown_ms: u32) -> TestNode {
    let mut node = fresh_node();
    node.boot(0);
    node.run_iteration(10);
    let cfg = format!(
        r#"{{"actuators":[{{"gpio":{pin},"actuator_type":"pump","actuator_name":"pump",
            "max_runtime_ms":{max_runtime_ms},"cooldown_ms":{cooldown_ms}}}]}}"#
    );
    node.link.inject("ctrl/node-1/config", cfg.as_bytes());
    node.run_iteration(20);
    assert!(node.actuators.has_actuator_on(pin));
    node
}

#[test]
fn runtime_protection_trip_alert_and_refusal() {
    let _hw = sim::lock();
    let mut node = node_with_pump(5, 2_000, 1_000);

    // t=1000: pump on.
    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"on"}"#);
    node.run_iteration(1_000);
    assert!(sim::output_level(5));

    // Just before the budget: still running, no alert.
    node.run_iteration(2_900);
    assert!(sim::output_level(5));
    assert!(all_json(&node, "ctrl/node-1/actuator/5/alert").is_empty());

    // Past max runtime (trip window t+2.0..t+2.2 s): alert + off.
    node.run_iteration(3_100);
    let alert = last_json(&node, "ctrl/node-1/actuator/5/alert").expect("no alert");
    assert_eq!(alert["alert_type"], "runtime_protection");
    let status = last_json(&node, "ctrl/node-1/actuator/5/status").unwrap();
    assert_eq!(status["state"], false);
    assert!(!sim::output_level(5));

    // A fresh `on` within the cooldown fails.
    node.link.inject(
        "ctrl/node-1/actuator/5/command",
        br#"{"command":"on","correlation_id":"again"}"#,
    );
    node.run_iteration(3_500);
    let response = last_json(&node, "ctrl/node-1/actuator/5/response").unwrap();
    assert_eq!(response["success"], false);
    assert_eq!(response["correlation_id"], "again");
}

#[test]
fn fresh_on_does_not_extend_the_runtime_budget() {
    let _hw = sim::lock();
    let mut node = node_with_pump(5, 2_000, 1_000);

    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"on"}"#);
    node.run_iteration(1_000);

    // Re-issue `on` mid-run; the activation stamp must not move.
    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"on"}"#);
    node.run_iteration(2_500);
    assert!(sim::output_level(5));

    // Budget expires relative to the FIRST start (1000+2000), not the
    // second command.
    node.run_iteration(3_100);
    let alert = last_json(&node, "ctrl/node-1/actuator/5/alert").expect("no trip");
    assert_eq!(alert["alert_type"], "runtime_protection");
}

#[test]
fn node_emergency_topic_latches_all() {
    let _hw = sim::lock();
    let mut node = node_with_pump(5, 60_000, 0);

    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"on"}"#);
    node.run_iteration(100);
    assert!(sim::output_level(5));

    node.link.inject("ctrl/node-1/actuator/emergency", b"{}");
    node.run_iteration(200);
    assert!(!sim::output_level(5));
    assert_eq!(node.safety.state(), SystemState::Latched);

    let alert = last_json(&node, "ctrl/node-1/actuator/5/alert").unwrap();
    assert_eq!(alert["alert_type"], "emergency_stop");
}

#[test]
fn recovery_does_not_restore_outputs() {
    let _hw = sim::lock();
    let mut node = node_with_pump(5, 60_000, 0);

    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"on"}"#);
    node.run_iteration(100);
    node.link.inject("ctrl/broadcast/emergency", b"{}");
    node.run_iteration(200);

    node.link.inject(
        "ctrl/node-1/system/command",
        br#"{"command":"exit_safe_mode"}"#,
    );
    node.run_iteration(300);
    assert_eq!(node.safety.state(), SystemState::OutputsOff);
    assert!(!sim::output_level(5), "exit_safe_mode must not re-energize");

    node.link.inject(
        "ctrl/node-1/system/command",
        br#"{"command":"resume_operation"}"#,
    );
    node.run_iteration(400);
    assert_eq!(node.safety.state(), SystemState::Normal);
    assert!(
        !sim::output_level(5),
        "resume must bring actuators back OFF, not restore outputs"
    );

    // Normal operation accepts commands again.
    node.link
        .inject("ctrl/node-1/actuator/5/command", br#"{"command":"on"}"#);
    node.run_iteration(500);
    assert!(sim::output_level(5));
}

#[test]
fn valve_emergency_forces_closed_and_motor_off() {
    let _hw = sim::lock();
    let mut node = fresh_node();
    node.boot(0);
    node.run_iteration(10);

    node.link.inject(
        "ctrl/node-1/config",
        br#"{"actuators":[{"gpio":13,"actuator_type":"valve","actuator_name":"v1",
            "aux_gpio":14,"valve_travel_ms":4000}]}"#,
    );
    node.run_iteration(20);

    // Start opening.
    node.link.inject(
        "ctrl/node-1/actuator/13/command",
        br#"{"command":"pwm","value":1.0}"#,
    );
    node.run_iteration(100);
    assert!(sim::output_level(13), "motor should be energized");

    node.link.inject("ctrl/broadcast/emergency", b"{}");
    node.run_iteration(200);
    assert!(!sim::output_level(13), "motor must de-energize");
    assert!(!sim::output_level(14), "direction must drop low");
}

#[test]
fn status_reflects_emergency_state_transitions() {
    let _hw = sim::lock();
    let mut node = node_with_pump(5, 60_000, 0);

    node.link.inject("ctrl/broadcast/emergency", b"{}");
    node.run_iteration(100);
    let status = last_json(&node, "ctrl/node-1/status").unwrap();
    assert_eq!(status["system_state"], "latched");
    assert_eq!(status["reason"], "broadcast");

    node.link.inject(
        "ctrl/node-1/system/command",
        br#"{"command":"exit_safe_mode"}"#,
    );
    node.run_iteration(200);
    let status = last_json(&node, "ctrl/node-1/status").unwrap();
    assert_eq!(status["system_state"], "outputs_off");
}
