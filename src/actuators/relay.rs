//! Binary relay driver: one pin, driven high/low, honoring inverted
//! logic. The safe level is always "off" — low for normal wiring, high
//! for inverted coils.

use crate::error::ActuatorError;
use crate::gpio::{Owner, PinMode};

use super::{ActuatorConfig, ActuatorDriver, ActuatorStatus, HwParts, Runtime};

pub struct RelayDriver {
    cfg: ActuatorConfig,
    rt: Runtime,
}

impl RelayDriver {
    pub fn new(cfg: ActuatorConfig) -> Self {
        Self {
            cfg,
            rt: Runtime::default(),
        }
    }

    /// Electrical level that means "on" for this wiring.
    fn on_level(&self) -> bool {
        !self.cfg.inverted
    }

    fn drive(&mut self, on: bool, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        hw.gpio.write(self.cfg.pin, on == self.on_level())?;
        Ok(())
    }
}

impl ActuatorDriver for RelayDriver {
    fn begin(&mut self, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        hw.gpio
            .request_pin(self.cfg.pin, Owner::Actuator, self.cfg.name.as_str())?;
        if let Err(e) = hw.gpio.set_mode(self.cfg.pin, PinMode::Output) {
            let _ = hw.gpio.release_pin(self.cfg.pin);
            return Err(e.into());
        }
        // Default state applies before anyone can command us.
        let default_on = self.cfg.default_on;
        self.drive(default_on, hw)?;
        if default_on {
            self.rt.note_start(0, self.cfg.limits.cooldown_ms);
        }
        Ok(())
    }

    fn end(&mut self, hw: &mut HwParts<'_>) {
        let _ = self.drive(false, hw);
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
        self.set_binary(value >= 0.5, now_ms, hw)
    }

    fn set_binary(
        &mut self,
        on: bool,
        now_ms: u64,
        hw: &mut HwParts<'_>,
    ) -> Result<(), ActuatorError> {
        if self.rt.is_latched() {
            return Err(ActuatorError::EmergencyLatched);
        }
        self.drive(on, hw)?;
        if on {
            self.rt.note_start(now_ms, self.cfg.limits.cooldown_ms);
        } else {
            self.rt.note_stop(now_ms);
        }
        Ok(())
    }

    fn emergency_stop(&mut self, reason: &str, now_ms: u64, hw: &mut HwParts<'_>) {
        let _ = self.drive(false, hw);
        self.rt.note_stop(now_ms);
        self.rt.latch(reason);
    }

    fn clear_emergency(&mut self) {
        self.rt.emergency = None;
    }

    fn tick(&mut self, _now_ms: u64, _hw: &mut HwParts<'_>) -> bool {
        false
    }

    fn status(&self) -> ActuatorStatus {
        ActuatorStatus {
            pin: self.cfg.pin,
            kind: self.cfg.kind,
            name: self.cfg.name.clone(),
            state: self.rt.running,
            level: if self.rt.running { 1.0 } else { 0.0 },
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
