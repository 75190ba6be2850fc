//! Actuator drivers: typed safe state transitions behind one contract.
//!
//! Configuration (immutable after apply) and runtime state (mutable)
//! are separate types; emergency latching lives in the runtime record
//! so command handling matches against it directly.
//!
//! Driver kinds: binary relay, pump (relay plus runtime protection),
//! PWM output, motor-driven valve. All are dispatched through the
//! [`Driver`] enum — no heap, fixed registries.

pub mod manager;
pub mod pump;
pub mod pwm_out;
pub mod relay;
pub mod valve;

use serde::{Deserialize, Serialize};

use crate::bus::pwm::PwmController;
use crate::error::ActuatorError;
use crate::gpio::GpioManager;

pub const NAME_CAP: usize = 32;
pub const SUBZONE_CAP: usize = 16;
pub const REASON_CAP: usize = 32;

/// Activation timestamps retained for duty-cycle protection; covers one
/// full protection window at the default limits.
pub const STARTS_HISTORY: usize = 8;

/// Hardware handles threaded through driver calls. The composition root
/// owns both; drivers never store them.
pub struct HwParts<'a> {
    pub gpio: &'a mut GpioManager,
    pub pwm: &'a mut PwmController,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActuatorKind {
    Relay,
    Pump,
    Pwm,
    Valve,
}

impl ActuatorKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relay" => Some(Self::Relay),
            "pump" => Some(Self::Pump),
            "pwm" => Some(Self::Pwm),
            "valve" => Some(Self::Valve),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Relay => "relay",
            Self::Pump => "pump",
            Self::Pwm => "pwm",
            Self::Valve => "valve",
        }
    }
}

/// Pump duty-cycle protection limits. Zero disables the corresponding
/// check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeLimits {
    /// Longest continuous-on burst before a cooldown is required.
    pub max_on_ms: u32,
    /// Rest required once the burst budget is spent.
    pub cooldown_ms: u32,
    /// Activations tolerated inside one trailing window.
    pub max_starts_per_window: u8,
    /// Length of the trailing activation window.
    pub window_ms: u32,
}

impl Default for RuntimeLimits {
    fn default() -> Self {
        Self {
            max_on_ms: 30 * 60 * 1000,
            cooldown_ms: 60 * 1000,
            max_starts_per_window: 6,
            window_ms: 60 * 60 * 1000,
        }
    }
}

impl RuntimeLimits {
    /// Limits for kinds without runtime protection.
    pub const fn unlimited() -> Self {
        Self {
            max_on_ms: 0,
            cooldown_ms: 0,
            max_starts_per_window: 0,
            window_ms: 0,
        }
    }
}

/// Immutable-after-apply actuator configuration. Identity is the pin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorConfig {
    pub pin: u8,
    pub kind: ActuatorKind,
    pub name: heapless::String<NAME_CAP>,
    #[serde(default)]
    pub subzone: Option<heapless::String<SUBZONE_CAP>>,
    /// Invert the electrical sense: "on" drives the pin low.
    pub inverted: bool,
    /// Output applied at begin().
    pub default_on: bool,
    /// Default PWM level (0-255) for pwm-kind actuators.
    pub default_pwm: u8,
    /// Controller marks load-bearing actuators; affects alert QoS only.
    pub critical: bool,
    /// Direction pin for motor valves.
    #[serde(default)]
    pub aux_pin: Option<u8>,
    /// Full open↔close travel time for motor valves.
    #[serde(default = "default_travel_ms")]
    pub valve_travel_ms: u32,
    pub limits: RuntimeLimits,
}

fn default_travel_ms() -> u32 {
    5_000
}

// ---------------------------------------------------------------------------
// Runtime state
// ---------------------------------------------------------------------------

/// Mutable per-actuator state, separate from configuration.
#[derive(Debug, Clone, Default)]
pub struct Runtime {
    pub running: bool,
    /// Zero iff not running.
    pub started_ms: u64,
    /// Total on-time since boot.
    pub accumulated_ms: u64,
    pub last_stop_ms: u64,
    /// Continuous-on budget spent since the last completed cooldown.
    pub burst_ms: u64,
    /// Latched emergency reason; any `Some` refuses activation.
    pub emergency: Option<heapless::String<REASON_CAP>>,
    /// Recent activation timestamps, oldest first.
    pub starts: heapless::Vec<u64, STARTS_HISTORY>,
}

impl Runtime {
    /// Record an off→on edge. A start after a full cooldown refreshes
    /// the burst budget.
    pub fn note_start(&mut self, now_ms: u64, cooldown_ms: u32) {
        if self.running {
            return;
        }
        if cooldown_ms > 0 && now_ms.saturating_sub(self.last_stop_ms) >= u64::from(cooldown_ms) {
            self.burst_ms = 0;
        }
        self.running = true;
        self.started_ms = now_ms;
        if self.starts.is_full() {
            self.starts.remove(0);
        }
        let _ = self.starts.push(now_ms);
    }

    /// Record an on→off edge.
    pub fn note_stop(&mut self, now_ms: u64) {
        if !self.running {
            return;
        }
        let ran = now_ms.saturating_sub(self.started_ms);
        self.accumulated_ms += ran;
        self.burst_ms += ran;
        self.running = false;
        self.started_ms = 0;
        self.last_stop_ms = now_ms;
    }

    /// Latch an emergency reason.
    pub fn latch(&mut self, reason: &str) {
        let mut r = heapless::String::new();
        let _ = r.push_str(&reason[..reason.len().min(REASON_CAP)]);
        self.emergency = Some(r);
    }

    pub fn is_latched(&self) -> bool {
        self.emergency.is_some()
    }

    /// Activations inside the trailing window ending at `now_ms`.
    pub fn starts_in_window(&self, now_ms: u64, window_ms: u32) -> usize {
        self.starts
            .iter()
            .filter(|t| now_ms.saturating_sub(**t) < u64::from(window_ms))
            .count()
    }
}

// ---------------------------------------------------------------------------
// Status snapshot
// ---------------------------------------------------------------------------

/// Point-in-time actuator snapshot for status topics and heartbeat.
#[derive(Debug, Clone, Serialize)]
pub struct ActuatorStatus {
    pub pin: u8,
    #[serde(rename = "actuator_type")]
    pub kind: ActuatorKind,
    #[serde(rename = "actuator_name")]
    pub name: heapless::String<NAME_CAP>,
    pub state: bool,
    /// Continuous level in [0,1]; binary kinds report 0.0 or 1.0.
    pub level: f32,
    pub emergency: bool,
    pub accumulated_runtime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subzone_id: Option<heapless::String<SUBZONE_CAP>>,
}

// ---------------------------------------------------------------------------
// Driver contract
// ---------------------------------------------------------------------------

/// Common contract every actuator driver implements.
pub trait ActuatorDriver {
    /// Reserve pin(s), set modes, apply the configured default output.
    fn begin(&mut self, hw: &mut HwParts<'_>) -> Result<(), ActuatorError>;

    /// Force the safe output level, then release pin(s). Every early
    /// return still leaves the output de-energized.
    fn end(&mut self, hw: &mut HwParts<'_>);

    /// Continuous control in [0,1]; binary kinds threshold at 0.5.
    fn set_value(&mut self, value: f32, now_ms: u64, hw: &mut HwParts<'_>)
        -> Result<(), ActuatorError>;

    /// Force on/off regardless of continuous semantics.
    fn set_binary(&mut self, on: bool, now_ms: u64, hw: &mut HwParts<'_>)
        -> Result<(), ActuatorError>;

    /// Latch and force the safe output. Subsequent commands are
    /// rejected until cleared.
    fn emergency_stop(&mut self, reason: &str, now_ms: u64, hw: &mut HwParts<'_>);

    /// Release the latch; the output stays at its safe level.
    fn clear_emergency(&mut self);

    /// Periodic tick for time-based internal logic. Returns true if the
    /// externally visible state changed.
    fn tick(&mut self, now_ms: u64, hw: &mut HwParts<'_>) -> bool;

    fn status(&self) -> ActuatorStatus;

    fn config(&self) -> &ActuatorConfig;

    fn runtime(&self) -> &Runtime;

    fn is_on(&self) -> bool {
        self.runtime().running
    }
}

// ---------------------------------------------------------------------------
// Enum dispatch
// ---------------------------------------------------------------------------

/// Tagged driver storage: fixed-size, no boxing.
pub enum Driver {
    Relay(relay::RelayDriver),
    Pump(pump::PumpDriver),
    Pwm(pwm_out::PwmOutDriver),
    Valve(valve::ValveDriver),
}

impl Driver {
    pub fn from_config(cfg: ActuatorConfig) -> Self {
        match cfg.kind {
            ActuatorKind::Relay => Self::Relay(relay::RelayDriver::new(cfg)),
            ActuatorKind::Pump => Self::Pump(pump::PumpDriver::new(cfg)),
            ActuatorKind::Pwm => Self::Pwm(pwm_out::PwmOutDriver::new(cfg)),
            ActuatorKind::Valve => Self::Valve(valve::ValveDriver::new(cfg)),
        }
    }
}

macro_rules! delegate {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Driver::Relay($inner) => $body,
            Driver::Pump($inner) => $body,
            Driver::Pwm($inner) => $body,
            Driver::Valve($inner) => $body,
        }
    };
}

impl ActuatorDriver for Driver {
    fn begin(&mut self, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        delegate!(self, d => d.begin(hw))
    }

    fn end(&mut self, hw: &mut HwParts<'_>) {
        delegate!(self, d => d.end(hw));
    }

    fn set_value(
        &mut self,
        value: f32,
        now_ms: u64,
        hw: &mut HwParts<'_>,
    ) -> Result<(), ActuatorError> {
        delegate!(self, d => d.set_value(value, now_ms, hw))
    }

    fn set_binary(
        &mut self,
        on: bool,
        now_ms: u64,
        hw: &mut HwParts<'_>,
    ) -> Result<(), ActuatorError> {
        delegate!(self, d => d.set_binary(on, now_ms, hw))
    }

    fn emergency_stop(&mut self, reason: &str, now_ms: u64, hw: &mut HwParts<'_>) {
        delegate!(self, d => d.emergency_stop(reason, now_ms, hw));
    }

    fn clear_emergency(&mut self) {
        delegate!(self, d => d.clear_emergency());
    }

    fn tick(&mut self, now_ms: u64, hw: &mut HwParts<'_>) -> bool {
        delegate!(self, d => d.tick(now_ms, hw))
    }

    fn status(&self) -> ActuatorStatus {
        delegate!(self, d => d.status())
    }

    fn config(&self) -> &ActuatorConfig {
        delegate!(self, d => d.config())
    }

    fn runtime(&self) -> &Runtime {
        delegate!(self, d => d.runtime())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_start_stop_accumulates() {
        let mut rt = Runtime::default();
        rt.note_start(1_000, 0);
        assert!(rt.running);
        assert_eq!(rt.started_ms, 1_000);

        rt.note_stop(3_500);
        assert!(!rt.running);
        assert_eq!(rt.started_ms, 0);
        assert_eq!(rt.accumulated_ms, 2_500);
        assert_eq!(rt.last_stop_ms, 3_500);
    }

    #[test]
    fn repeated_start_is_idempotent() {
        let mut rt = Runtime::default();
        rt.note_start(1_000, 0);
        rt.note_start(2_000, 0);
        assert_eq!(rt.started_ms, 1_000, "restart must not move the start stamp");
        assert_eq!(rt.starts.len(), 1);
    }

    #[test]
    fn cooldown_gap_refreshes_burst_budget() {
        let mut rt = Runtime::default();
        rt.note_start(0, 1_000);
        rt.note_stop(2_000);
        assert_eq!(rt.burst_ms, 2_000);

        // Restart before the cooldown has elapsed: budget keeps growing.
        rt.note_start(2_500, 1_000);
        rt.note_stop(3_000);
        assert_eq!(rt.burst_ms, 2_500);

        // Restart after a full cooldown: budget resets.
        rt.note_start(10_000, 1_000);
        assert_eq!(rt.burst_ms, 0);
    }

    #[test]
    fn starts_window_counts_trailing_only() {
        let mut rt = Runtime::default();
        for t in [0u64, 10_000, 20_000, 30_000] {
            rt.note_start(t, 0);
            rt.note_stop(t + 1_000);
        }
        assert_eq!(rt.starts_in_window(31_000, 25_000), 3);
        assert_eq!(rt.starts_in_window(31_000, 5_000), 1);
    }

    #[test]
    fn starts_history_is_bounded() {
        let mut rt = Runtime::default();
        for i in 0..(STARTS_HISTORY as u64 + 4) {
            rt.note_start(i * 10, 0);
            rt.note_stop(i * 10 + 5);
        }
        assert_eq!(rt.starts.len(), STARTS_HISTORY);
        // Oldest entries were dropped.
        assert_eq!(rt.starts[0], 40);
    }

    #[test]
    fn kind_string_round_trip() {
        for kind in [
            ActuatorKind::Relay,
            ActuatorKind::Pump,
            ActuatorKind::Pwm,
            ActuatorKind::Valve,
        ] {
            assert_eq!(ActuatorKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(ActuatorKind::parse("blender"), None);
    }
}
