//! Configuration lifecycle: receive → parse → validate → apply →
//! persist → acknowledge.
//!
//! One structured parse per inbound packet; categories apply in the
//! fixed order wifi → zone → system → sensors → actuators. A category
//! that fails validation is not applied and not persisted — the ack
//! carries the offending fragment. Warm boot loads the same categories
//! from the store in the same order; a malformed namespace is logged
//! critical and treated as empty so the node comes up bare instead of
//! not at all.

pub mod packets;
pub mod store;

use core::fmt::Write as _;

use log::{info, warn};

use crate::actuators::manager::{emit_json, ActuatorManager};
use crate::actuators::{ActuatorConfig, ActuatorKind, HwParts, RuntimeLimits};
use crate::board;
use crate::bus::onewire::{OneWireBus, OneWireIo};
use crate::error::{codes, ErrorTracker, Severity};
use crate::net::{Publish, QoS};
use crate::sensors::manager::SensorManager;
use crate::sensors::{clamp_interval_ms, SensorConfig, SensorKind};
use crate::topics::TopicBuilder;

use self::packets::{
    classify_parse_error, ActuatorEntry, ConfigAck, ConfigEnvelope, CorrelationId, SensorEntry,
    SystemSettings, WifiConfig, ZoneConfig,
};
use self::store::StoragePort;

/// A validation rejection: code, human message, offending fragment.
struct Rejection {
    code: u16,
    message: heapless::String<{ packets::MSG_CAP }>,
    detail: heapless::String<{ packets::DETAIL_CAP }>,
}

impl Rejection {
    fn new(code: u16, message: &str, detail: core::fmt::Arguments<'_>) -> Self {
        let mut m = heapless::String::new();
        let _ = m.push_str(&message[..message.len().min(packets::MSG_CAP)]);
        let mut d = heapless::String::new();
        let _ = d.write_fmt(detail);
        Self {
            code,
            message: m,
            detail: d,
        }
    }
}

/// Owner of the applied wifi/zone/system documents and the apply
/// pipeline for all five categories.
pub struct ConfigManager {
    wifi: WifiConfig,
    zone: ZoneConfig,
    settings: SystemSettings,
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigManager {
    pub fn new() -> Self {
        Self {
            wifi: WifiConfig::default(),
            zone: ZoneConfig::default(),
            settings: SystemSettings::default(),
        }
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn wifi(&self) -> &WifiConfig {
        &self.wifi
    }

    pub fn zone(&self) -> &ZoneConfig {
        &self.zone
    }

    // ── Inbound packets ───────────────────────────────────────

    /// Handle one packet from the config topic. Emits one ack per
    /// category present (or a single parse-failure ack).
    #[allow(clippy::too_many_arguments)]
    pub fn handle_packet<W: OneWireIo>(
        &mut self,
        payload: &[u8],
        sensors: &mut SensorManager,
        actuators: &mut ActuatorManager,
        hw: &mut HwParts<'_>,
        onewire: &mut OneWireBus<W>,
        store: &mut dyn StoragePort,
        publish: &mut impl Publish,
        topics: &mut TopicBuilder,
        tracker: &mut ErrorTracker,
        now_ms: u64,
    ) {
        let envelope: ConfigEnvelope = match serde_json::from_slice(payload) {
            Ok(env) => env,
            Err(e) => {
                let code = classify_parse_error(&e);
                tracker.record(code, Severity::Error, "config parse failed", now_ms);
                let mut msg = heapless::String::<{ packets::MSG_CAP }>::new();
                let _ = write!(msg, "parse failed: {e}");
                send_ack(
                    ConfigAck::err("packet", code, &msg, None, None),
                    publish,
                    topics,
                );
                return;
            }
        };
        let cid = envelope.correlation_id.clone();

        if let Some(wifi) = envelope.wifi {
            let ack = self.apply_wifi(wifi, store, cid.clone());
            send_ack(ack, publish, topics);
        }
        if let Some(zone) = envelope.zone {
            let ack = self.apply_zone(zone, store, topics, cid.clone());
            send_ack(ack, publish, topics);
        }
        if let Some(system) = envelope.system {
            let ack = self.apply_system(system, store, cid.clone());
            send_ack(ack, publish, topics);
        }
        if let Some(entries) = envelope.sensors {
            let ack = self.apply_sensors(
                entries, sensors, actuators, hw, onewire, store, cid.clone(), now_ms,
            );
            send_ack(ack, publish, topics);
        }
        if let Some(entries) = envelope.actuators {
            let ack =
                self.apply_actuators(entries, sensors, actuators, hw, store, publish, topics, cid);
            send_ack(ack, publish, topics);
        }
    }

    // ── Category application ──────────────────────────────────

    fn apply_wifi(
        &mut self,
        wifi: WifiConfig,
        store: &mut dyn StoragePort,
        cid: Option<CorrelationId>,
    ) -> ConfigAck {
        if let Some(ssid) = &wifi.ssid {
            if ssid.is_empty() {
                return ConfigAck::err(
                    "wifi",
                    codes::CONFIG_VALIDATION_FAILED,
                    "ssid must not be empty",
                    Some("ssid"),
                    cid,
                );
            }
        }
        self.wifi = wifi;
        if store::save_blob(store, store::NS_WIFI, &self.wifi).is_err() {
            return ConfigAck::err(
                "wifi",
                codes::STORE_WRITE_FAILED,
                "persist failed",
                None,
                cid,
            );
        }
        info!("config: wifi credentials updated");
        ConfigAck::ok("wifi", cid)
    }

    fn apply_zone(
        &mut self,
        zone: ZoneConfig,
        store: &mut dyn StoragePort,
        topics: &mut TopicBuilder,
        cid: Option<CorrelationId>,
    ) -> ConfigAck {
        self.zone = zone;
        if let Some(name) = &self.zone.node_name {
            topics.set_node_id(name);
        }
        if store::save_blob(store, store::NS_ZONE, &self.zone).is_err() {
            return ConfigAck::err(
                "zone",
                codes::STORE_WRITE_FAILED,
                "persist failed",
                None,
                cid,
            );
        }
        info!("config: zone updated (node id '{}')", topics.node_id());
        ConfigAck::ok("zone", cid)
    }

    fn apply_system(
        &mut self,
        settings: SystemSettings,
        store: &mut dyn StoragePort,
        cid: Option<CorrelationId>,
    ) -> ConfigAck {
        if settings.heartbeat_interval_seconds == 0 || settings.sensor_batch_interval_seconds == 0
        {
            return ConfigAck::err(
                "system",
                codes::CONFIG_VALUE_RANGE,
                "intervals must be positive",
                None,
                cid,
            );
        }
        self.settings = settings;
        if store::save_blob(store, store::NS_SYSTEM, &self.settings).is_err() {
            return ConfigAck::err(
                "system",
                codes::STORE_WRITE_FAILED,
                "persist failed",
                None,
                cid,
            );
        }
        info!(
            "config: system settings updated (heartbeat {} s)",
            self.settings.heartbeat_interval_seconds
        );
        ConfigAck::ok("system", cid)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_sensors<W: OneWireIo>(
        &mut self,
        entries: Vec<SensorEntry>,
        sensors: &mut SensorManager,
        actuators: &ActuatorManager,
        hw: &mut HwParts<'_>,
        onewire: &mut OneWireBus<W>,
        store: &mut dyn StoragePort,
        cid: Option<CorrelationId>,
        now_ms: u64,
    ) -> ConfigAck {
        // Validate everything before touching any state.
        let mut validated: Vec<SensorAction> = Vec::with_capacity(entries.len());
        for entry in &entries {
            match validate_sensor_entry(entry, &validated, actuators) {
                Ok(action) => validated.push(action),
                Err(r) => {
                    return ConfigAck::err("sensor", r.code, &r.message, Some(&r.detail), cid)
                }
            }
        }

        for action in validated {
            match action {
                SensorAction::Apply(cfg) => {
                    let pin = cfg.pin;
                    if let Err(e) = sensors.configure(
                        cfg,
                        hw.gpio,
                        onewire,
                        actuators.has_actuator_on(pin),
                        store,
                        now_ms,
                    ) {
                        let mut msg = heapless::String::<{ packets::MSG_CAP }>::new();
                        let _ = write!(msg, "{e}");
                        let mut detail = heapless::String::<{ packets::DETAIL_CAP }>::new();
                        let _ = write!(detail, "gpio {pin}");
                        return ConfigAck::err("sensor", e.code(), &msg, Some(&detail), cid);
                    }
                }
                SensorAction::Remove { pin, rom } => {
                    sensors.remove(pin, rom, hw.gpio, store);
                }
            }
        }
        ConfigAck::ok("sensor", cid)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_actuators(
        &mut self,
        entries: Vec<ActuatorEntry>,
        sensors: &SensorManager,
        actuators: &mut ActuatorManager,
        hw: &mut HwParts<'_>,
        store: &mut dyn StoragePort,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
        cid: Option<CorrelationId>,
    ) -> ConfigAck {
        let mut validated: Vec<(ActuatorConfig, bool)> = Vec::with_capacity(entries.len());
        for entry in &entries {
            match validate_actuator_entry(entry, &validated, sensors) {
                Ok(item) => validated.push(item),
                Err(r) => {
                    return ConfigAck::err("actuator", r.code, &r.message, Some(&r.detail), cid)
                }
            }
        }

        for (cfg, active) in validated {
            let pin = cfg.pin;
            let result = if active {
                actuators.configure(
                    cfg,
                    hw,
                    sensors.has_sensor_on_gpio(pin),
                    store,
                    publish,
                    topics,
                )
            } else {
                // active=false is removal.
                actuators.remove(pin, hw, store)
            };
            if let Err(e) = result {
                let mut msg = heapless::String::<{ packets::MSG_CAP }>::new();
                let _ = write!(msg, "{e}");
                let mut detail = heapless::String::<{ packets::DETAIL_CAP }>::new();
                let _ = write!(detail, "gpio {pin}");
                return ConfigAck::err("actuator", e.code(), &msg, Some(&detail), cid);
            }
        }
        ConfigAck::ok("actuator", cid)
    }

    // ── Warm boot ─────────────────────────────────────────────

    /// Restore all categories from the store, wifi → zone → system →
    /// sensors → actuators. Missing namespaces are fine; corrupt ones
    /// log critical and load empty.
    #[allow(clippy::too_many_arguments)]
    pub fn warm_boot<W: OneWireIo>(
        &mut self,
        sensors: &mut SensorManager,
        actuators: &mut ActuatorManager,
        hw: &mut HwParts<'_>,
        onewire: &mut OneWireBus<W>,
        store: &mut dyn StoragePort,
        publish: &mut impl Publish,
        topics: &mut TopicBuilder,
        tracker: &mut ErrorTracker,
        now_ms: u64,
    ) {
        if let Some(wifi) = load_category::<WifiConfig>(store, store::NS_WIFI, tracker, now_ms) {
            self.wifi = wifi;
        }

        if let Some(zone) = load_category::<ZoneConfig>(store, store::NS_ZONE, tracker, now_ms) {
            if let Some(name) = &zone.node_name {
                topics.set_node_id(name);
            }
            self.zone = zone;
        }

        if let Some(settings) =
            load_category::<SystemSettings>(store, store::NS_SYSTEM, tracker, now_ms)
        {
            self.settings = settings;
        }

        if let Some(set) = load_category::<heapless::Vec<SensorConfig, { board::MAX_SENSORS }>>(
            store,
            store::NS_SENSORS,
            tracker,
            now_ms,
        ) {
            for cfg in set {
                let pin = cfg.pin;
                if let Err(e) = sensors.configure(
                    cfg,
                    hw.gpio,
                    onewire,
                    actuators.has_actuator_on(pin),
                    store,
                    now_ms,
                ) {
                    warn!("config: warm boot sensor on pin {} failed: {}", pin, e);
                }
            }
        }

        if let Some(set) = load_category::<heapless::Vec<ActuatorConfig, { board::MAX_ACTUATORS }>>(
            store,
            store::NS_ACTUATORS,
            tracker,
            now_ms,
        ) {
            for cfg in set {
                let pin = cfg.pin;
                if let Err(e) = actuators.configure(
                    cfg,
                    hw,
                    sensors.has_sensor_on_gpio(pin),
                    store,
                    publish,
                    topics,
                ) {
                    warn!("config: warm boot actuator on pin {} failed: {}", pin, e);
                }
            }
        }

        info!(
            "config: warm boot complete, {} sensors, {} actuators",
            sensors.count(),
            actuators.count()
        );
    }
}

fn send_ack(ack: ConfigAck, publish: &mut impl Publish, topics: &TopicBuilder) {
    emit_json(
        topics.config_response().as_str(),
        &ack,
        QoS::AtLeastOnce,
        false,
        publish,
    );
}

/// Load one namespace; `None` for "never written". Corruption logs a
/// critical and also loads empty rather than failing boot.
fn load_category<T: serde::de::DeserializeOwned>(
    store: &dyn StoragePort,
    namespace: &str,
    tracker: &mut ErrorTracker,
    now_ms: u64,
) -> Option<T> {
    match store::load_blob::<T>(store, namespace) {
        Ok(value) => Some(value),
        Err(crate::error::StoreError::NotFound) => None,
        Err(e) => {
            warn!("config: namespace '{}' unreadable: {}", namespace, e);
            let mut msg = heapless::String::<{ packets::MSG_CAP }>::new();
            let _ = write!(msg, "persisted namespace '{namespace}' corrupted");
            tracker.record(codes::STORE_READ_FAILED, Severity::Critical, &msg, now_ms);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// One validated sensor packet item.
enum SensorAction {
    Apply(SensorConfig),
    Remove { pin: u8, rom: Option<u64> },
}

fn validate_sensor_entry(
    entry: &SensorEntry,
    already: &[SensorAction],
    actuators: &ActuatorManager,
) -> Result<SensorAction, Rejection> {
    let Some(pin) = entry.gpio else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "gpio is required",
            format_args!("gpio"),
        ));
    };

    if !entry.active {
        // Removal needs only the identity.
        let pin = if pin == 0 {
            board::ONEWIRE_DEFAULT_PIN
        } else {
            pin
        };
        return Ok(SensorAction::Remove {
            pin,
            rom: entry.rom,
        });
    }

    let Some(type_name) = entry.sensor_type.clone() else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "sensor_type is required",
            format_args!("gpio {pin}"),
        ));
    };
    let Some(name) = entry.sensor_name.clone() else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "sensor_name is required",
            format_args!("gpio {pin}"),
        ));
    };
    let Some(interval_s) = entry.measurement_interval_seconds else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "measurement_interval_seconds is required",
            format_args!("gpio {pin}"),
        ));
    };

    let Some(kind) = SensorKind::from_type_str(&type_name) else {
        return Err(Rejection::new(
            codes::CONFIG_UNKNOWN_KIND,
            "unknown sensor_type",
            format_args!("{type_name}"),
        ));
    };

    if usize::from(pin) >= board::GPIO_COUNT {
        return Err(Rejection::new(
            codes::CONFIG_VALUE_RANGE,
            "gpio out of range",
            format_args!("gpio {pin}"),
        ));
    }

    // Pin 0 is only meaningful as "bus default" for one-wire devices.
    if pin == 0 && !kind.uses_onewire() {
        return Err(Rejection::new(
            codes::CONFIG_VALUE_RANGE,
            "gpio 0 is reserved",
            format_args!("gpio 0"),
        ));
    }

    let resolved_pin = if pin == 0 && kind.uses_onewire() {
        board::ONEWIRE_DEFAULT_PIN
    } else {
        pin
    };

    let duplicate = already.iter().any(|a| match a {
        SensorAction::Apply(c) => c.pin == resolved_pin && c.rom == entry.rom,
        SensorAction::Remove { pin, rom } => *pin == resolved_pin && *rom == entry.rom,
    });
    if duplicate {
        return Err(Rejection::new(
            codes::CONFIG_DUPLICATE_PIN,
            "duplicate pin in packet",
            format_args!("gpio {resolved_pin}"),
        ));
    }

    if actuators.has_actuator_on(resolved_pin) {
        return Err(Rejection::new(
            codes::GPIO_CONFLICT,
            "pin held by an actuator",
            format_args!("gpio {resolved_pin}"),
        ));
    }

    Ok(SensorAction::Apply(SensorConfig {
        pin: resolved_pin,
        kind,
        type_name,
        name,
        subzone: entry.subzone_id.clone(),
        interval_ms: clamp_interval_ms(interval_s),
        raw_only: entry.raw_mode,
        rom: entry.rom,
        calibration: entry.calibration,
    }))
}

fn validate_actuator_entry(
    entry: &ActuatorEntry,
    already: &[(ActuatorConfig, bool)],
    sensors: &SensorManager,
) -> Result<(ActuatorConfig, bool), Rejection> {
    let Some(pin) = entry.gpio else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "gpio is required",
            format_args!("gpio"),
        ));
    };
    let Some(type_name) = entry.actuator_type.as_ref() else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "actuator_type is required",
            format_args!("gpio {pin}"),
        ));
    };
    let Some(name) = entry.actuator_name.clone() else {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "actuator_name is required",
            format_args!("gpio {pin}"),
        ));
    };

    let Some(kind) = ActuatorKind::parse(type_name) else {
        return Err(Rejection::new(
            codes::CONFIG_UNKNOWN_KIND,
            "unknown actuator_type",
            format_args!("{type_name}"),
        ));
    };

    if usize::from(pin) >= board::GPIO_COUNT || pin == 0 {
        return Err(Rejection::new(
            codes::CONFIG_VALUE_RANGE,
            "gpio out of range",
            format_args!("gpio {pin}"),
        ));
    }

    let default_pwm = entry.default_pwm.unwrap_or(255);
    if default_pwm > 255 {
        return Err(Rejection::new(
            codes::CONFIG_VALUE_RANGE,
            "default_pwm must be 0-255",
            format_args!("gpio {pin}"),
        ));
    }

    if kind == ActuatorKind::Valve && entry.aux_gpio.is_none() {
        return Err(Rejection::new(
            codes::CONFIG_MISSING_FIELD,
            "valve requires aux_gpio",
            format_args!("gpio {pin}"),
        ));
    }

    if already.iter().any(|(c, _)| c.pin == pin) {
        return Err(Rejection::new(
            codes::CONFIG_DUPLICATE_PIN,
            "duplicate pin in packet",
            format_args!("gpio {pin}"),
        ));
    }

    if sensors.has_sensor_on_gpio(pin) {
        return Err(Rejection::new(
            codes::GPIO_CONFLICT,
            "pin held by a sensor",
            format_args!("gpio {pin}"),
        ));
    }

    let defaults = if kind == ActuatorKind::Pump {
        RuntimeLimits::default()
    } else {
        RuntimeLimits::unlimited()
    };
    let limits = RuntimeLimits {
        max_on_ms: entry.max_runtime_ms.unwrap_or(defaults.max_on_ms),
        cooldown_ms: entry.cooldown_ms.unwrap_or(defaults.cooldown_ms),
        max_starts_per_window: entry
            .max_activations
            .unwrap_or(defaults.max_starts_per_window),
        window_ms: entry.activation_window_ms.unwrap_or(defaults.window_ms),
    };

    Ok((
        ActuatorConfig {
            pin,
            kind,
            name,
            subzone: entry.subzone_id.clone(),
            inverted: entry.inverted_logic,
            default_on: entry.default_state,
            default_pwm: default_pwm as u8,
            critical: entry.critical,
            aux_pin: entry.aux_gpio,
            valve_travel_ms: entry.valve_travel_ms.unwrap_or(5_000),
            limits,
        },
        entry.active,
    ))
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::bus::onewire::SimOneWire;
    use crate::bus::pwm::PwmController;
    use crate::config::store::MemStore;
    use crate::gpio::GpioManager;
    use crate::hal::sim;

    struct Captured(Vec<(String, Vec<u8>)>);

    impl Publish for Captured {
        fn publish(&mut self, topic: &str, payload: &[u8], _qos: QoS, _critical: bool) {
            self.0.push((topic.to_string(), payload.to_vec()));
        }
    }

    impl Captured {
        fn acks(&self) -> Vec<serde_json::Value> {
            self.0
                .iter()
                .filter(|(t, _)| t == "ctrl/node-1/config")
                .map(|(_, p)| serde_json::from_slice(p).unwrap())
                .collect()
        }
    }

    struct Env {
        gpio: GpioManager,
        pwm: PwmController,
        onewire: OneWireBus<SimOneWire>,
        store: MemStore,
        publish: Captured,
        topics: TopicBuilder,
        tracker: ErrorTracker,
        sensors: SensorManager,
        actuators: ActuatorManager,
        config: ConfigManager,
    }

    fn env() -> Env {
        sim::reset();
        let mut gpio = GpioManager::new();
        gpio.initialize_to_safe_mode();
        Env {
            gpio,
            pwm: PwmController::new(),
            onewire: OneWireBus::new(SimOneWire::new()),
            store: MemStore::new(),
            publish: Captured(Vec::new()),
            topics: TopicBuilder::new("ctrl", "node-1"),
            tracker: ErrorTracker::new(),
            sensors: SensorManager::new(),
            actuators: ActuatorManager::new(),
            config: ConfigManager::new(),
        }
    }

    impl Env {
        fn handle(&mut self, payload: &str) {
            let mut hw = HwParts {
                gpio: &mut self.gpio,
                pwm: &mut self.pwm,
            };
            self.config.handle_packet(
                payload.as_bytes(),
                &mut self.sensors,
                &mut self.actuators,
                &mut hw,
                &mut self.onewire,
                &mut self.store,
                &mut self.publish,
                &mut self.topics,
                &mut self.tracker,
                0,
            );
        }
    }

    const ACTUATOR_PACKET: &str = r#"{
        "actuators": [{
            "gpio": 5, "actuator_type": "relay", "actuator_name": "p1",
            "active": true, "default_state": false
        }],
        "correlation_id": "cfg-7"
    }"#;

    #[test]
    fn actuator_config_applies_and_acks() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(ACTUATOR_PACKET);

        let acks = env.publish.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["category"], "actuator");
        assert_eq!(acks[0]["success"], true);
        assert_eq!(acks[0]["correlation_id"], "cfg-7");
        assert!(env.actuators.has_actuator_on(5));
        assert!(env.store.exists(store::NS_ACTUATORS, store::KEY_SET));
    }

    #[test]
    fn missing_field_rejects_whole_category() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(
            r#"{"actuators": [
                {"gpio": 5, "actuator_type": "relay", "actuator_name": "a"},
                {"gpio": 13, "actuator_type": "relay"}
            ]}"#,
        );

        let acks = env.publish.acks();
        assert_eq!(acks[0]["success"], false);
        assert_eq!(acks[0]["error_code"], codes::CONFIG_MISSING_FIELD);
        // Nothing was applied: validation failed before any mutation.
        assert!(!env.actuators.has_actuator_on(5));
        assert!(!env.store.exists(store::NS_ACTUATORS, store::KEY_SET));
    }

    #[test]
    fn duplicate_pin_in_packet_rejected() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(
            r#"{"actuators": [
                {"gpio": 5, "actuator_type": "relay", "actuator_name": "a"},
                {"gpio": 5, "actuator_type": "pump", "actuator_name": "b"}
            ]}"#,
        );
        let acks = env.publish.acks();
        assert_eq!(acks[0]["error_code"], codes::CONFIG_DUPLICATE_PIN);
    }

    #[test]
    fn sensor_actuator_collision_rejected() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(ACTUATOR_PACKET);
        env.handle(
            r#"{"sensors": [{
                "gpio": 5, "sensor_type": "digital", "sensor_name": "s",
                "measurement_interval_seconds": 10
            }]}"#,
        );

        let acks = env.publish.acks();
        assert_eq!(acks[1]["category"], "sensor");
        assert_eq!(acks[1]["success"], false);
        assert_eq!(acks[1]["error_code"], codes::GPIO_CONFLICT);
    }

    #[test]
    fn active_false_removes_and_persists() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(ACTUATOR_PACKET);
        assert!(env.actuators.has_actuator_on(5));

        env.handle(
            r#"{"actuators": [{
                "gpio": 5, "actuator_type": "relay", "actuator_name": "p1",
                "active": false
            }]}"#,
        );
        assert!(!env.actuators.has_actuator_on(5));

        let set: heapless::Vec<ActuatorConfig, { board::MAX_ACTUATORS }> =
            store::load_blob(&env.store, store::NS_ACTUATORS).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn cross_boundary_round_trip_via_warm_boot() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(ACTUATOR_PACKET);
        env.handle(
            r#"{"actuators": [{
                "gpio": 5, "actuator_type": "relay", "actuator_name": "p1",
                "active": false
            }]}"#,
        );

        // Boot a fresh node off the same store.
        let store = core::mem::take(&mut env.store);
        sim::reset();
        let mut gpio = GpioManager::new();
        gpio.initialize_to_safe_mode();
        let mut pwm = PwmController::new();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };
        let mut onewire = OneWireBus::new(SimOneWire::new());
        let mut store = store;
        let mut publish = Captured(Vec::new());
        let mut topics = TopicBuilder::new("ctrl", "node-1");
        let mut tracker = ErrorTracker::new();
        let mut sensors = SensorManager::new();
        let mut actuators = ActuatorManager::new();
        let mut config = ConfigManager::new();

        config.warm_boot(
            &mut sensors,
            &mut actuators,
            &mut hw,
            &mut onewire,
            &mut store,
            &mut publish,
            &mut topics,
            &mut tracker,
            0,
        );
        assert!(
            !actuators.has_actuator_on(5),
            "removed actuator must stay gone across warm boot"
        );
    }

    #[test]
    fn warm_boot_restores_sensor_and_actuator_sets() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(
            r#"{
                "sensors": [{"gpio": 4, "sensor_type": "DS18B20", "sensor_name": "t1",
                             "measurement_interval_seconds": 30, "raw_mode": true}],
                "actuators": [{"gpio": 5, "actuator_type": "relay", "actuator_name": "p1",
                               "active": true, "default_state": false}]
            }"#,
        );

        let store = core::mem::take(&mut env.store);
        sim::reset();
        let mut gpio = GpioManager::new();
        gpio.initialize_to_safe_mode();
        let mut pwm = PwmController::new();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };
        let mut onewire = OneWireBus::new(SimOneWire::new());
        let mut store = store;
        let mut publish = Captured(Vec::new());
        let mut topics = TopicBuilder::new("ctrl", "node-1");
        let mut tracker = ErrorTracker::new();
        let mut sensors = SensorManager::new();
        let mut actuators = ActuatorManager::new();
        let mut config = ConfigManager::new();

        config.warm_boot(
            &mut sensors,
            &mut actuators,
            &mut hw,
            &mut onewire,
            &mut store,
            &mut publish,
            &mut topics,
            &mut tracker,
            0,
        );
        assert_eq!(sensors.count(), 1);
        assert!(sensors.has_sensor_on_gpio(board::ONEWIRE_DEFAULT_PIN));
        assert!(actuators.has_actuator_on(5));
    }

    #[test]
    fn corrupt_namespace_loads_empty_with_critical() {
        let _hw = sim::lock();
        let mut env = env();
        env.store
            .write(store::NS_ACTUATORS, store::KEY_SET, &[0xFF; 32])
            .unwrap();

        let mut hw = HwParts {
            gpio: &mut env.gpio,
            pwm: &mut env.pwm,
        };
        env.config.warm_boot(
            &mut env.sensors,
            &mut env.actuators,
            &mut hw,
            &mut env.onewire,
            &mut env.store,
            &mut env.publish,
            &mut env.topics,
            &mut env.tracker,
            0,
        );
        assert_eq!(env.actuators.count(), 0);
        assert_eq!(
            env.tracker.count_by_severity(Severity::Critical),
            1,
            "corrupt namespace must log critical"
        );
    }

    #[test]
    fn sensor_active_false_removes() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(
            r#"{"sensors": [{"gpio": 4, "sensor_type": "DS18B20", "sensor_name": "t1",
                "measurement_interval_seconds": 30}]}"#,
        );
        assert_eq!(env.sensors.count(), 1);

        env.handle(r#"{"sensors": [{"gpio": 4, "active": false}]}"#);
        assert_eq!(env.sensors.count(), 0);
        let acks = env.publish.acks();
        assert_eq!(acks[1]["success"], true);
    }

    #[test]
    fn zone_rename_retargets_topics() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(r#"{"zone": {"zone_id": "greenhouse-2", "node_name": "bench-3"}}"#);
        assert_eq!(env.topics.node_id(), "bench-3");
        let acks = env.publish.acks();
        // The ack goes out under the new node id.
        assert!(env.publish.0.iter().any(|(t, _)| t == "ctrl/bench-3/config"));
        assert_eq!(acks.len(), 0, "old-id topic should carry nothing");
    }

    #[test]
    fn parse_failure_acks_with_code() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(r#"{"sensors": ["#);
        let acks = env.publish.acks();
        assert_eq!(acks[0]["success"], false);
        assert_eq!(acks[0]["error_code"], codes::CONFIG_PARSE_FAILED);
    }

    #[test]
    fn unknown_kind_is_rejected_with_detail() {
        let _hw = sim::lock();
        let mut env = env();
        env.handle(
            r#"{"sensors": [{"gpio": 13, "sensor_type": "thermocouple",
                "sensor_name": "x", "measurement_interval_seconds": 5}]}"#,
        );
        let acks = env.publish.acks();
        assert_eq!(acks[0]["error_code"], codes::CONFIG_UNKNOWN_KIND);
        assert_eq!(acks[0]["detail"], "thermocouple");
    }
}
