//! Motor-driven valve: direction + enable pins, three quantized
//! positions (closed / partial / open).
//!
//! A position change energizes the motor for a time proportional to the
//! distance — |Δ| × half the configured travel time — and `tick()`
//! de-energizes it when the deadline passes. The main loop never blocks
//! on valve motion.

use crate::error::ActuatorError;
use crate::gpio::{Owner, PinMode};

use super::{ActuatorConfig, ActuatorDriver, ActuatorStatus, HwParts, Runtime};

/// Quantized valve positions.
pub const POS_CLOSED: u8 = 0;
pub const POS_PARTIAL: u8 = 1;
pub const POS_OPEN: u8 = 2;

pub struct ValveDriver {
    cfg: ActuatorConfig,
    rt: Runtime,
    position: u8,
    target: u8,
    /// Motor de-energize deadline while moving.
    moving_until_ms: Option<u64>,
}

impl ValveDriver {
    pub fn new(cfg: ActuatorConfig) -> Self {
        Self {
            cfg,
            rt: Runtime::default(),
            position: POS_CLOSED,
            target: POS_CLOSED,
            moving_until_ms: None,
        }
    }

    pub fn position(&self) -> u8 {
        self.position
    }

    fn dir_pin(&self) -> Result<u8, ActuatorError> {
        self.cfg.aux_pin.ok_or(ActuatorError::NotConfigured)
    }

    /// Quantize a continuous command into a position.
    fn quantize(value: f32) -> u8 {
        if value < 0.33 {
            POS_CLOSED
        } else if value < 0.66 {
            POS_PARTIAL
        } else {
            POS_OPEN
        }
    }

    fn start_motion(&mut self, target: u8, now_ms: u64, hw: &mut HwParts<'_>)
        -> Result<(), ActuatorError> {
        if target == self.position {
            self.target = target;
            return Ok(());
        }

        let dir_pin = self.dir_pin()?;
        let steps = u64::from(self.position.abs_diff(target));
        let duration = steps * u64::from(self.cfg.valve_travel_ms) / 2;

        // Direction high = opening.
        hw.gpio.write(dir_pin, target > self.position)?;
        hw.gpio.write(self.cfg.pin, true)?;
        self.target = target;
        self.moving_until_ms = Some(now_ms + duration);
        self.rt.note_start(now_ms, 0);
        Ok(())
    }

    fn stop_motor(&mut self, now_ms: u64, hw: &mut HwParts<'_>) {
        let _ = hw.gpio.write(self.cfg.pin, false);
        self.moving_until_ms = None;
        self.rt.note_stop(now_ms);
    }
}

impl ActuatorDriver for ValveDriver {
    fn begin(&mut self, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        let dir_pin = self.dir_pin()?;

        hw.gpio
            .request_pin(self.cfg.pin, Owner::Actuator, self.cfg.name.as_str())?;
        if let Err(e) = hw.gpio.request_pin(dir_pin, Owner::Actuator, self.cfg.name.as_str()) {
            let _ = hw.gpio.release_pin(self.cfg.pin);
            return Err(e.into());
        }

        let modes = hw
            .gpio
            .set_mode(self.cfg.pin, PinMode::Output)
            .and_then(|()| hw.gpio.set_mode(dir_pin, PinMode::Output));
        if let Err(e) = modes {
            let _ = hw.gpio.release_pin(self.cfg.pin);
            let _ = hw.gpio.release_pin(dir_pin);
            return Err(e.into());
        }

        // Motor off, direction low, assume closed until told otherwise.
        hw.gpio.write(self.cfg.pin, false)?;
        hw.gpio.write(dir_pin, false)?;
        self.position = POS_CLOSED;
        self.target = POS_CLOSED;

        if self.cfg.default_on {
            self.start_motion(POS_OPEN, 0, hw)?;
        }
        Ok(())
    }

    fn end(&mut self, hw: &mut HwParts<'_>) {
        let _ = hw.gpio.write(self.cfg.pin, false);
        if let Ok(dir_pin) = self.dir_pin() {
            let _ = hw.gpio.write(dir_pin, false);
            let _ = hw.gpio.release_pin(dir_pin);
        }
        self.moving_until_ms = None;
        self.rt.running = false;
        self.rt.started_ms = 0;
        let _ = hw.gpio.release_pin(self.cfg.pin);
    }

    fn set_value(
        &mut self,
        value: f32,
        now_ms: u64,
        hw: &mut HwParts<'_>,
    ) -> Result<(), ActuatorError> {
        if self.rt.is_latched() {
            return Err(ActuatorError::EmergencyLatched);
        }
        self.start_motion(Self::quantize(value), now_ms, hw)
    }

    fn set_binary(
        &mut self,
        on: bool,
        now_ms: u64,
        hw: &mut HwParts<'_>,
    ) -> Result<(), ActuatorError> {
        self.set_value(if on { 1.0 } else { 0.0 }, now_ms, hw)
    }

    fn emergency_stop(&mut self, reason: &str, now_ms: u64, hw: &mut HwParts<'_>) {
        // Zero target, motor off, direction low.
        let _ = hw.gpio.write(self.cfg.pin, false);
        if let Ok(dir_pin) = self.dir_pin() {
            let _ = hw.gpio.write(dir_pin, false);
        }
        self.moving_until_ms = None;
        self.target = POS_CLOSED;
        self.position = POS_CLOSED;
        self.rt.note_stop(now_ms);
        self.rt.latch(reason);
    }

    fn clear_emergency(&mut self) {
        self.rt.emergency = None;
    }

    fn tick(&mut self, now_ms: u64, hw: &mut HwParts<'_>) -> bool {
        match self.moving_until_ms {
            Some(deadline) if now_ms >= deadline => {
                self.stop_motor(now_ms, hw);
                self.position = self.target;
                true
            }
            _ => false,
        }
    }

    fn status(&self) -> ActuatorStatus {
        ActuatorStatus {
            pin: self.cfg.pin,
            kind: self.cfg.kind,
            name: self.cfg.name.clone(),
            state: self.position != POS_CLOSED || self.moving_until_ms.is_some(),
            level: f32::from(self.position) / 2.0,
            emergency: self.rt.is_latched(),
            accumulated_runtime_ms: self.rt.accumulated_ms,
            subzone_id: self.cfg.subzone.clone(),
        }
    }

    fn config(&self) -> &ActuatorConfig {
        &self.cfg
    }

    fn runtime(&self) -> &Runtime {
        &self.rt
    }
}

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::actuators::{ActuatorKind, RuntimeLimits};
    use crate::bus::pwm::PwmController;
    use crate::gpio::GpioManager;
    use crate::hal::sim;

    const ENABLE: u8 = 5;
    const DIR: u8 = 13;

    fn valve_cfg() -> ActuatorConfig {
        let mut name = heapless::String::new();
        let _ = name.push_str("zone-valve");
        ActuatorConfig {
            pin: ENABLE,
            kind: ActuatorKind::Valve,
            name,
            subzone: None,
            inverted: false,
            default_on: false,
            default_pwm: 0,
            critical: false,
            aux_pin: Some(DIR),
            valve_travel_ms: 4_000,
            limits: RuntimeLimits::unlimited(),
        }
    }

    fn env() -> (GpioManager, PwmController) {
        sim::reset();
        let mut gpio = GpioManager::new();
        gpio.initialize_to_safe_mode();
        (gpio, PwmController::new())
    }

    #[test]
    fn begin_claims_both_pins() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut valve = ValveDriver::new(valve_cfg());
        valve.begin(&mut hw).unwrap();
        assert_eq!(hw.gpio.owner(ENABLE), Some(Owner::Actuator));
        assert_eq!(hw.gpio.owner(DIR), Some(Owner::Actuator));
        assert_eq!(valve.position(), POS_CLOSED);
    }

    #[test]
    fn quantization_thresholds() {
        assert_eq!(ValveDriver::quantize(0.0), POS_CLOSED);
        assert_eq!(ValveDriver::quantize(0.32), POS_CLOSED);
        assert_eq!(ValveDriver::quantize(0.33), POS_PARTIAL);
        assert_eq!(ValveDriver::quantize(0.65), POS_PARTIAL);
        assert_eq!(ValveDriver::quantize(0.66), POS_OPEN);
        assert_eq!(ValveDriver::quantize(1.0), POS_OPEN);
    }

    #[test]
    fn full_open_runs_motor_for_full_travel() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut valve = ValveDriver::new(valve_cfg());
        valve.begin(&mut hw).unwrap();

        // closed → open is two steps: 2 × (4000/2) = 4000 ms.
        valve.set_value(1.0, 0, &mut hw).unwrap();
        assert!(sim::output_level(ENABLE), "motor energized");
        assert!(sim::output_level(DIR), "direction = opening");

        assert!(!valve.tick(3_999, &mut hw));
        assert!(sim::output_level(ENABLE));
        assert!(valve.tick(4_000, &mut hw), "motion completes at deadline");
        assert!(!sim::output_level(ENABLE), "motor de-energized");
        assert_eq!(valve.position(), POS_OPEN);
    }

    #[test]
    fn partial_move_runs_half_travel() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut valve = ValveDriver::new(valve_cfg());
        valve.begin(&mut hw).unwrap();

        valve.set_value(0.5, 0, &mut hw).unwrap();
        assert!(!valve.tick(1_999, &mut hw));
        assert!(valve.tick(2_000, &mut hw));
        assert_eq!(valve.position(), POS_PARTIAL);

        // partial → closed drives with direction low.
        valve.set_value(0.0, 3_000, &mut hw).unwrap();
        assert!(!sim::output_level(DIR), "direction = closing");
        assert!(valve.tick(5_000, &mut hw));
        assert_eq!(valve.position(), POS_CLOSED);
    }

    #[test]
    fn emergency_stops_motion_and_latches() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut valve = ValveDriver::new(valve_cfg());
        valve.begin(&mut hw).unwrap();
        valve.set_value(1.0, 0, &mut hw).unwrap();

        valve.emergency_stop("broadcast", 500, &mut hw);
        assert!(!sim::output_level(ENABLE));
        assert!(!sim::output_level(DIR));
        assert_eq!(valve.position(), POS_CLOSED);
        assert_eq!(
            valve.set_value(1.0, 600, &mut hw),
            Err(ActuatorError::EmergencyLatched)
        );
    }

    #[test]
    fn same_position_command_is_a_no_op() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut valve = ValveDriver::new(valve_cfg());
        valve.begin(&mut hw).unwrap();
        valve.set_value(0.0, 0, &mut hw).unwrap();
        assert!(!sim::output_level(ENABLE));
        assert!(!valve.rt.running);
    }
}
