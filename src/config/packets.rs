//! Typed wire payloads: commands, responses, alerts, configuration
//! packets and acknowledgements.
//!
//! Every inbound message gets exactly one structured parse into one of
//! these types; handlers never scan raw substrings. Required fields are
//! modeled as `Option` so validation can distinguish a missing field
//! from a type mismatch and report the precise error code.

use serde::{Deserialize, Serialize};

use crate::error::codes;

pub const CORRELATION_CAP: usize = 48;
pub const MSG_CAP: usize = 96;
pub const DETAIL_CAP: usize = 48;

pub type CorrelationId = heapless::String<CORRELATION_CAP>;

// ---------------------------------------------------------------------------
// Actuator commands
// ---------------------------------------------------------------------------

/// Inbound actuator command. The verb stays a string here so an unknown
/// verb can still produce a correlated response instead of a parse
/// error.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub command: heapless::String<12>,
    #[serde(default)]
    pub value: Option<f32>,
    /// Seconds; 0 or absent = indefinite.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandVerb {
    On,
    Off,
    Pwm,
    Toggle,
}

impl CommandVerb {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on" => Some(Self::On),
            "off" => Some(Self::Off),
            "pwm" => Some(Self::Pwm),
            "toggle" => Some(Self::Toggle),
            _ => None,
        }
    }
}

/// Response emitted on the per-pin response topic for every command,
/// success or not, echoing the correlation id unchanged.
#[derive(Debug, Clone, Serialize)]
pub struct CommandResponse {
    pub command: heapless::String<12>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    pub success: bool,
    pub message: heapless::String<MSG_CAP>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

/// One-shot alert on the per-pin alert topic.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub alert_type: &'static str,
    pub pin: u8,
    pub message: heapless::String<MSG_CAP>,
    pub timestamp_ms: u64,
}

// ---------------------------------------------------------------------------
// System commands
// ---------------------------------------------------------------------------

/// Inbound system command on the system-command topic.
#[derive(Debug, Clone, Deserialize)]
pub struct SystemCommand {
    pub command: heapless::String<24>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

// ---------------------------------------------------------------------------
// Configuration packets
// ---------------------------------------------------------------------------

/// Calibration metadata carried with a sensor; the node stores and
/// echoes it, conversion stays at the controller.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    #[serde(default)]
    pub offset: f32,
    #[serde(default = "one")]
    pub scale: f32,
}

fn one() -> f32 {
    1.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    pub gpio: Option<u8>,
    pub sensor_type: Option<heapless::String<24>>,
    pub sensor_name: Option<heapless::String<32>>,
    pub measurement_interval_seconds: Option<u32>,
    #[serde(default)]
    pub subzone_id: Option<heapless::String<16>>,
    #[serde(default)]
    pub raw_mode: bool,
    /// 64-bit ROM for bus-addressed devices.
    #[serde(default)]
    pub rom: Option<u64>,
    #[serde(default)]
    pub calibration: Option<Calibration>,
    /// `false` removes the sensor, mirroring actuator lifecycle.
    #[serde(default = "yes")]
    pub active: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActuatorEntry {
    pub gpio: Option<u8>,
    pub actuator_type: Option<heapless::String<12>>,
    pub actuator_name: Option<heapless::String<32>>,
    #[serde(default)]
    pub aux_gpio: Option<u8>,
    #[serde(default)]
    pub subzone_id: Option<heapless::String<16>>,
    #[serde(default = "yes")]
    pub active: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default)]
    pub inverted_logic: bool,
    #[serde(default)]
    pub default_state: bool,
    #[serde(default)]
    pub default_pwm: Option<u16>,
    #[serde(default)]
    pub max_runtime_ms: Option<u32>,
    #[serde(default)]
    pub cooldown_ms: Option<u32>,
    #[serde(default)]
    pub max_activations: Option<u8>,
    #[serde(default)]
    pub activation_window_ms: Option<u32>,
    #[serde(default)]
    pub valve_travel_ms: Option<u32>,
}

fn yes() -> bool {
    true
}

/// Network credentials. Applied on the next reconnect cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiConfig {
    pub ssid: Option<heapless::String<32>>,
    pub password: Option<heapless::String<64>>,
}

/// Fleet placement: which controller zone this node reports into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: Option<heapless::String<24>>,
    pub node_name: Option<heapless::String<24>>,
}

/// Node-level tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSettings {
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_seconds: u32,
    #[serde(default = "default_batch_secs")]
    pub sensor_batch_interval_seconds: u32,
}

fn default_heartbeat_secs() -> u32 {
    60
}

fn default_batch_secs() -> u32 {
    60
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: default_heartbeat_secs(),
            sensor_batch_interval_seconds: default_batch_secs(),
        }
    }
}

/// One inbound config packet. Sections present in the JSON are applied
/// in the fixed order wifi → zone → system → sensors → actuators.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigEnvelope {
    #[serde(default)]
    pub wifi: Option<WifiConfig>,
    #[serde(default)]
    pub zone: Option<ZoneConfig>,
    #[serde(default)]
    pub system: Option<SystemSettings>,
    #[serde(default)]
    pub sensors: Option<Vec<SensorEntry>>,
    #[serde(default)]
    pub actuators: Option<Vec<ActuatorEntry>>,
    #[serde(default)]
    pub correlation_id: Option<CorrelationId>,
}

/// Structured acknowledgement on the config-response topic.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigAck {
    pub category: &'static str,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    pub message: heapless::String<MSG_CAP>,
    /// Offending fragment, e.g. `"gpio 12"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<heapless::String<DETAIL_CAP>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
}

impl ConfigAck {
    pub fn ok(category: &'static str, correlation_id: Option<CorrelationId>) -> Self {
        let mut message = heapless::String::new();
        let _ = message.push_str("applied");
        Self {
            category,
            success: true,
            error_code: None,
            message,
            detail: None,
            correlation_id,
        }
    }

    pub fn err(
        category: &'static str,
        code: u16,
        message: &str,
        detail: Option<&str>,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        let mut m = heapless::String::new();
        let _ = m.push_str(&message[..message.len().min(MSG_CAP)]);
        let detail = detail.map(|d| {
            let mut s = heapless::String::new();
            let _ = s.push_str(&d[..d.len().min(DETAIL_CAP)]);
            s
        });
        Self {
            category,
            success: false,
            error_code: Some(code),
            message: m,
            detail,
            correlation_id,
        }
    }
}

/// Classify a serde_json failure into the config error taxonomy.
pub fn classify_parse_error(err: &serde_json::Error) -> u16 {
    if err.is_data() {
        codes::CONFIG_TYPE_MISMATCH
    } else {
        codes::CONFIG_PARSE_FAILED
    }
}

// ---------------------------------------------------------------------------
// Sensor emission payloads
// ---------------------------------------------------------------------------

/// One sensor sample on the per-pin data topic. `value` is present only
/// when the sensor is not raw-only, and then carries the calibrated raw
/// (scaling to engineering units stays at the controller).
#[derive(Debug, Clone, Serialize)]
pub struct SamplePayload {
    pub gpio: u8,
    pub sensor_type: heapless::String<24>,
    pub sensor_name: heapless::String<32>,
    pub raw: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    pub quality: &'static str,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subzone_id: Option<heapless::String<16>>,
}

/// Aggregated batch on the sensor-batch topic.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPayload {
    pub samples: Vec<SamplePayload>,
    pub timestamp_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parses_with_and_without_optionals() {
        let cmd: Command =
            serde_json::from_str(r#"{"command":"on","correlation_id":"abc-123"}"#).unwrap();
        assert_eq!(cmd.command.as_str(), "on");
        assert_eq!(cmd.correlation_id.as_deref(), Some("abc-123"));
        assert!(cmd.value.is_none());

        let cmd: Command =
            serde_json::from_str(r#"{"command":"pwm","value":0.5,"duration":30}"#).unwrap();
        assert_eq!(CommandVerb::parse(&cmd.command), Some(CommandVerb::Pwm));
        assert_eq!(cmd.value, Some(0.5));
        assert_eq!(cmd.duration, Some(30));
    }

    #[test]
    fn unknown_verb_is_not_a_parse_error() {
        let cmd: Command = serde_json::from_str(r#"{"command":"dance"}"#).unwrap();
        assert_eq!(CommandVerb::parse(&cmd.command), None);
    }

    #[test]
    fn envelope_detects_present_sections() {
        let env: ConfigEnvelope = serde_json::from_str(
            r#"{
                "sensors": [{"gpio": 4, "sensor_type": "DS18B20",
                             "sensor_name": "t1",
                             "measurement_interval_seconds": 30,
                             "raw_mode": true}],
                "correlation_id": "cfg-1"
            }"#,
        )
        .unwrap();
        assert!(env.wifi.is_none());
        assert!(env.actuators.is_none());
        let sensors = env.sensors.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].gpio, Some(4));
        assert!(sensors[0].raw_mode);
    }

    #[test]
    fn missing_fields_stay_none_rather_than_failing() {
        let env: ConfigEnvelope =
            serde_json::from_str(r#"{"actuators": [{"gpio": 5}]}"#).unwrap();
        let acts = env.actuators.unwrap();
        assert_eq!(acts[0].gpio, Some(5));
        assert!(acts[0].actuator_type.is_none());
        assert!(acts[0].active, "active defaults to true");
    }

    #[test]
    fn type_mismatch_classifies_as_data_error() {
        let err = serde_json::from_str::<ConfigEnvelope>(r#"{"sensors": 42}"#).unwrap_err();
        assert_eq!(classify_parse_error(&err), codes::CONFIG_TYPE_MISMATCH);

        let err = serde_json::from_str::<ConfigEnvelope>(r#"{"sensors": ["#).unwrap_err();
        assert_eq!(classify_parse_error(&err), codes::CONFIG_PARSE_FAILED);
    }

    #[test]
    fn ack_serializes_correlation_id() {
        let mut cid = CorrelationId::new();
        let _ = cid.push_str("xyz");
        let ack = ConfigAck::ok("sensor", Some(cid));
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""correlation_id":"xyz""#));
        assert!(json.contains(r#""success":true"#));
    }
}
