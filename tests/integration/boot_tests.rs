//! Boot scenarios: cold boot, warm boot from a persisted set, and the
//! boot-to-emit path.

use fieldnode::actuators::{ActuatorConfig, ActuatorKind, RuntimeLimits};
use fieldnode::bus::onewire::SimOneWire;
use fieldnode::config::store::{self, MemStore, StoragePort};
use fieldnode::gpio::Owner;
use fieldnode::hal::sim;
use fieldnode::sensors::{SensorConfig, SensorKind};

use crate::common::{all_json, fresh_node, last_json, node_with_store};

fn seeded_store(rom: u64) -> MemStore {
    let mut store = MemStore::new();

    let mut type_name = heapless::String::new();
    let _ = type_name.push_str("DS18B20");
    let mut sensor_name = heapless::String::new();
    let _ = sensor_name.push_str("t1");
    let sensors: heapless::Vec<SensorConfig, 16> = heapless::Vec::from_slice(&[SensorConfig {
        pin: 4,
        kind: SensorKind::Ds18b20,
        type_name,
        name: sensor_name,
        subzone: None,
        interval_ms: 30_000,
        raw_only: true,
        rom: Some(rom),
        calibration: None,
    }])
    .unwrap();
    store::save_blob(&mut store, store::NS_SENSORS, &sensors).unwrap();

    let mut actuator_name = heapless::String::new();
    let _ = actuator_name.push_str("p1");
    let actuators: heapless::Vec<ActuatorConfig, 16> =
        heapless::Vec::from_slice(&[ActuatorConfig {
            pin: 5,
            kind: ActuatorKind::Relay,
            name: actuator_name,
            subzone: None,
            inverted: false,
            default_on: false,
            default_pwm: 255,
            critical: false,
            aux_pin: None,
            valve_travel_ms: 5_000,
            limits: RuntimeLimits::unlimited(),
        }])
        .unwrap();
    store::save_blob(&mut store, store::NS_ACTUATORS, &actuators).unwrap();

    store
}

#[test]
fn boot_to_emit_from_persisted_config() {
    let _hw = sim::lock();
    let rom = SimOneWire::make_rom(0x42);
    let mut node = node_with_store(seeded_store(rom));
    node.onewire.io_mut().add_device(rom, 401);

    node.boot(0);
    node.run_iteration(10); // connect, drain boot status, start conversion

    // Actuator status for the restored relay, state false.
    let status = last_json(&node, "ctrl/node-1/actuator/5/status").expect("no actuator status");
    assert_eq!(status["state"], false);

    // Sensor sample appears once the conversion latency has elapsed —
    // well inside the 35 s window for a 30 s interval.
    node.run_iteration(400);
    assert!(last_json(&node, "ctrl/node-1/sensor/4/data").is_none());
    node.run_iteration(800);
    let sample = last_json(&node, "ctrl/node-1/sensor/4/data").expect("no sensor sample");
    assert_eq!(sample["raw"], 401);
    assert!(
        sample.get("value").is_none() || sample["value"] == sample["raw"],
        "raw-mode sample must not carry a scaled value"
    );
}

#[test]
fn safe_mode_holds_until_config_applies() {
    let _hw = sim::lock();
    let mut node = fresh_node();
    node.boot(0);

    // Bus pins are system-owned, nothing else is claimed.
    assert_eq!(node.gpio.owner(fieldnode::board::I2C_SDA_PIN), Some(Owner::System));
    assert_eq!(node.gpio.owner(fieldnode::board::I2C_SCL_PIN), Some(Owner::System));
    assert_eq!(node.gpio.owner(5), None);
    assert_eq!(node.sensors.count(), 0);
    assert_eq!(node.actuators.count(), 0);
}

#[test]
fn removed_actuator_stays_gone_across_warm_boot() {
    let _hw = sim::lock();
    let mut node = fresh_node();
    node.boot(0);
    node.run_iteration(10);

    node.link.inject(
        "ctrl/node-1/config",
        br#"{"actuators":[{"gpio":5,"actuator_type":"relay","actuator_name":"p1","active":true}]}"#,
    );
    node.run_iteration(20);
    assert!(node.actuators.has_actuator_on(5));

    node.link.inject(
        "ctrl/node-1/config",
        br#"{"actuators":[{"gpio":5,"actuator_type":"relay","actuator_name":"p1","active":false}]}"#,
    );
    node.run_iteration(30);
    assert!(!node.actuators.has_actuator_on(5));

    // Same store, fresh node: the removal must have been persisted.
    let store = std::mem::take(&mut node.store);
    let mut reborn = node_with_store(store);
    reborn.boot(0);
    reborn.run_iteration(10);
    assert!(
        !reborn.actuators.has_actuator_on(5),
        "warm boot resurrected a removed actuator"
    );
    assert_eq!(reborn.gpio.owner(5), None);
}

#[test]
fn boot_status_reaches_broker_after_connect() {
    let _hw = sim::lock();
    let mut node = fresh_node();
    node.boot(0);

    // Nothing on the wire yet: the status is queued offline.
    assert!(node.link.published.is_empty());

    node.run_iteration(10);
    let statuses = all_json(&node, "ctrl/node-1/status");
    assert!(!statuses.is_empty(), "boot status never drained");
    assert_eq!(statuses[0]["system_state"], "normal");
    assert_eq!(
        statuses[0]["firmware_version"],
        env!("CARGO_PKG_VERSION")
    );
}

#[test]
fn corrupt_actuator_namespace_boots_bare() {
    let _hw = sim::lock();
    let mut store = MemStore::new();
    store
        .write(store::NS_ACTUATORS, store::KEY_SET, &[0xFF; 64])
        .unwrap();

    let mut node = node_with_store(store);
    node.boot(0);
    node.run_iteration(10);

    assert_eq!(node.actuators.count(), 0);
    // The corruption was offered to the controller as a critical event.
    let events = all_json(&node, "ctrl/node-1/system/diagnostics");
    assert!(
        events.iter().any(|e| e["severity"] == "critical"),
        "corruption critical never surfaced"
    );
}
