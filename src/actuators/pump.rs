//! Pump driver: a binary relay plus hardware-level runtime protection.
//!
//! The protection is independent of the controller — a pump that has
//! spent its continuous-on budget, or been cycled too often inside the
//! trailing window, refuses to start no matter who asks. Refusals leave
//! state untouched; the manager publishes the alert.

use crate::error::ActuatorError;
use crate::gpio::{Owner, PinMode};

use super::{ActuatorConfig, ActuatorDriver, ActuatorStatus, HwParts, Runtime};

pub struct PumpDriver {
    cfg: ActuatorConfig,
    rt: Runtime,
}

impl PumpDriver {
    pub fn new(cfg: ActuatorConfig) -> Self {
        Self {
            cfg,
            rt: Runtime::default(),
        }
    }

    fn on_level(&self) -> bool {
        !self.cfg.inverted
    }

    fn drive(&mut self, on: bool, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        hw.gpio.write(self.cfg.pin, on == self.on_level())?;
        Ok(())
    }

    /// Hardware-level activation gate.
    ///
    /// Refuses when the continuous-on budget is spent and the cooldown
    /// has not yet elapsed, or when the trailing window already holds
    /// the maximum number of activations.
    pub fn can_activate(&self, now_ms: u64) -> bool {
        let limits = &self.cfg.limits;

        if limits.max_on_ms > 0
            && self.rt.burst_ms >= u64::from(limits.max_on_ms)
            && now_ms.saturating_sub(self.rt.last_stop_ms) < u64::from(limits.cooldown_ms)
        {
            return false;
        }

        if limits.max_starts_per_window > 0
            && self.rt.starts_in_window(now_ms, limits.window_ms)
                >= usize::from(limits.max_starts_per_window)
        {
            return false;
        }

        true
    }
}

impl ActuatorDriver for PumpDriver {
    fn begin(&mut self, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        hw.gpio
            .request_pin(self.cfg.pin, Owner::Actuator, self.cfg.name.as_str())?;
        if let Err(e) = hw.gpio.set_mode(self.cfg.pin, PinMode::Output) {
            let _ = hw.gpio.release_pin(self.cfg.pin);
            return Err(e.into());
        }
        // Pumps never default on: a pump that starts itself at boot,
        // before any sensor context exists, is a dry-run hazard.
        self.drive(false, hw)?;
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

        if !on {
            self.drive(false, hw)?;
            self.rt.note_stop(now_ms);
            return Ok(());
        }

        // A fresh "on" for a running pump is a no-op: it must not move
        // the activation stamp or consume another window slot.
        if self.rt.running {
            return Ok(());
        }

        if !self.can_activate(now_ms) {
            return Err(ActuatorError::ProtectionRefusal);
        }

        self.drive(true, hw)?;
        self.rt.note_start(now_ms, self.cfg.limits.cooldown_ms);
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
        // The max-runtime trip runs in the manager loop, which owns
        // alert emission.
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

#[cfg(all(test, not(target_os = "espidf")))]
mod tests {
    use super::*;
    use crate::actuators::{ActuatorKind, RuntimeLimits};
    use crate::bus::pwm::PwmController;
    use crate::gpio::GpioManager;
    use crate::hal::sim;

    fn pump_cfg(limits: RuntimeLimits) -> ActuatorConfig {
        let mut name = heapless::String::new();
        let _ = name.push_str("feed-pump");
        ActuatorConfig {
            pin: 5,
            kind: ActuatorKind::Pump,
            name,
            subzone: None,
            inverted: false,
            default_on: false,
            default_pwm: 0,
            critical: true,
            aux_pin: None,
            valve_travel_ms: 5_000,
            limits,
        }
    }

    fn env() -> (GpioManager, PwmController) {
        sim::reset();
        let mut gpio = GpioManager::new();
        gpio.initialize_to_safe_mode();
        (gpio, PwmController::new())
    }

    #[test]
    fn fresh_on_while_running_is_a_no_op() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut pump = PumpDriver::new(pump_cfg(RuntimeLimits::default()));
        pump.begin(&mut hw).unwrap();

        pump.set_binary(true, 1_000, &mut hw).unwrap();
        pump.set_binary(true, 5_000, &mut hw).unwrap();

        assert_eq!(pump.rt.started_ms, 1_000, "restart moved the start stamp");
        assert_eq!(pump.rt.starts.len(), 1, "restart consumed a window slot");
    }

    #[test]
    fn burst_budget_refuses_until_cooldown() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let limits = RuntimeLimits {
            max_on_ms: 2_000,
            cooldown_ms: 1_000,
            max_starts_per_window: 0,
            window_ms: 0,
        };
        let mut pump = PumpDriver::new(pump_cfg(limits));
        pump.begin(&mut hw).unwrap();

        // Spend the whole budget in one burst.
        pump.set_binary(true, 0, &mut hw).unwrap();
        pump.set_binary(false, 2_500, &mut hw).unwrap();

        // Within cooldown: refused, state untouched.
        assert_eq!(
            pump.set_binary(true, 3_000, &mut hw),
            Err(ActuatorError::ProtectionRefusal)
        );
        assert!(!pump.is_on());

        // After cooldown: allowed again.
        pump.set_binary(true, 3_600, &mut hw).unwrap();
        assert!(pump.is_on());
    }

    #[test]
    fn window_activation_cap_refuses() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let limits = RuntimeLimits {
            max_on_ms: 0,
            cooldown_ms: 0,
            max_starts_per_window: 2,
            window_ms: 60_000,
        };
        let mut pump = PumpDriver::new(pump_cfg(limits));
        pump.begin(&mut hw).unwrap();

        pump.set_binary(true, 0, &mut hw).unwrap();
        pump.set_binary(false, 100, &mut hw).unwrap();
        pump.set_binary(true, 200, &mut hw).unwrap();
        pump.set_binary(false, 300, &mut hw).unwrap();

        assert_eq!(
            pump.set_binary(true, 400, &mut hw),
            Err(ActuatorError::ProtectionRefusal)
        );

        // Outside the window the old starts no longer count.
        pump.set_binary(true, 70_000, &mut hw).unwrap();
    }

    #[test]
    fn protection_is_bypassed_by_nothing() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let limits = RuntimeLimits {
            max_on_ms: 1_000,
            cooldown_ms: 10_000,
            max_starts_per_window: 0,
            window_ms: 0,
        };
        let mut pump = PumpDriver::new(pump_cfg(limits));
        pump.begin(&mut hw).unwrap();

        pump.set_binary(true, 0, &mut hw).unwrap();
        pump.set_binary(false, 1_500, &mut hw).unwrap();

        // set_value goes through the same gate.
        assert_eq!(
            pump.set_value(1.0, 2_000, &mut hw),
            Err(ActuatorError::ProtectionRefusal)
        );
    }

    #[test]
    fn pumps_ignore_default_on() {
        let _hw = sim::lock();
        let (mut gpio, mut pwm) = env();
        let mut hw = HwParts {
            gpio: &mut gpio,
            pwm: &mut pwm,
        };

        let mut pump = PumpDriver::new(ActuatorConfig {
            default_on: true,
            ..pump_cfg(RuntimeLimits::default())
        });
        pump.begin(&mut hw).unwrap();
        assert!(!pump.is_on());
        assert!(!sim::output_level(5));
    }
}
