//! PWM actuator: continuous-level output over a bank channel.
//!
//! Attaches its channel at begin() and keeps it through emergency stop
//! (a latched dimmer writes 0 % but stays bound); only end() detaches.

use crate::error::ActuatorError;

use super::{ActuatorConfig, ActuatorDriver, ActuatorStatus, HwParts, Runtime};

/// Resolution used for actuator channels; matches the 0-255 default
/// levels in config packets.
const PWM_RES_BITS: u8 = 8;
const PWM_FREQ_HZ: u32 = 1_000;

pub struct PwmOutDriver {
    cfg: ActuatorConfig,
    rt: Runtime,
    channel: Option<u8>,
    /// Last commanded level in [0,1].
    level: f32,
}

impl PwmOutDriver {
    pub fn new(cfg: ActuatorConfig) -> Self {
        Self {
            cfg,
            rt: Runtime::default(),
            channel: None,
            level: 0.0,
        }
    }

    fn apply_level(&mut self, level: f32, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        let channel = self.channel.ok_or(ActuatorError::NotConfigured)?;
        let clamped = level.clamp(0.0, 1.0);
        let percent = (clamped * 100.0).round() as u8;
        hw.pwm.write_percent(channel, percent)?;
        self.level = clamped;
        Ok(())
    }

    /// Level expressed by the configured default (0-255 scale).
    fn default_level(&self) -> f32 {
        f32::from(self.cfg.default_pwm) / 255.0
    }
}

impl ActuatorDriver for PwmOutDriver {
    fn begin(&mut self, hw: &mut HwParts<'_>) -> Result<(), ActuatorError> {
        let channel = hw.pwm.attach(self.cfg.pin, hw.gpio)?;
        self.channel = Some(channel);
        if let Err(e) = hw
            .pwm
            .set_resolution(channel, PWM_RES_BITS)
            .and_then(|()| hw.pwm.set_frequency(channel, PWM_FREQ_HZ))
        {
            let _ = hw.pwm.detach(channel, hw.gpio);
            self.channel = None;
            return Err(e.into());
        }

        if self.cfg.default_on {
            let level = self.default_level();
            self.apply_level(level, hw)?;
            if level > 0.0 {
                self.rt.note_start(0, 0);
            }
        } else {
            self.apply_level(0.0, hw)?;
        }
        Ok(())
    }

    fn end(&mut self, hw: &mut HwParts<'_>) {
        if let Some(channel) = self.channel.take() {
            let _ = hw.pwm.write_percent(channel, 0);
            let _ = hw.pwm.detach(channel, hw.gpio);
        }
        self.rt.running = false;
        self.rt.started_ms = 0;
        self.level = 0.0;
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
        self.apply_level(value, hw)?;
        if self.level > 0.0 {
            self.rt.note_start(now_ms, 0);
        } else {
            self.rt.note_stop(now_ms);
        }
        Ok(())
    }

    fn set_binary(
        &mut self,
        on: bool,
        now_ms: u64,
        hw: &mut HwParts<'_>,
    ) -> Result<(), ActuatorError> {
        let level = if on { self.default_level().max(0.01) } else { 0.0 };
        self.set_value(level, now_ms, hw)
    }

    fn emergency_stop(&mut self, reason: &str, now_ms: u64, hw: &mut HwParts<'_>) {
        // 0 % without detaching: the channel stays ours.
        let _ = self.apply_level(0.0, hw);
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
            level: self.level,
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
