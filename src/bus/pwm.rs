//! PWM channel allocator over the timer-backed generator bank.
//!
//! A fixed bank of [`board::PWM_CHANNEL_COUNT`] channels. Attaching a
//! channel reserves its pin with the actuator owner through the GPIO
//! manager; detaching releases it. Duty writes validate against the
//! channel's configured resolution.

use log::{debug, info};

use crate::board;
use crate::error::PwmError;
use crate::gpio::{GpioManager, Owner, PinMode};
use crate::hal;

/// Default base frequency for a fresh channel.
pub const DEFAULT_FREQ_HZ: u32 = 5_000;
/// Default resolution for a fresh channel.
pub const DEFAULT_RESOLUTION_BITS: u8 = 10;

#[derive(Debug, Clone, Copy)]
struct Channel {
    pin: u8,
    freq_hz: u32,
    resolution_bits: u8,
    duty_raw: u32,
}

/// Allocator over the fixed PWM bank.
pub struct PwmController {
    channels: [Option<Channel>; board::PWM_CHANNEL_COUNT],
}

impl Default for PwmController {
    fn default() -> Self {
        Self::new()
    }
}

impl PwmController {
    pub fn new() -> Self {
        Self {
            channels: [None; board::PWM_CHANNEL_COUNT],
        }
    }

    /// Bind `pin` to a free channel, reserving it for the actuator
    /// owner. Returns the channel id.
    pub fn attach(&mut self, pin: u8, gpio: &mut GpioManager) -> Result<u8, PwmError> {
        let slot = self
            .channels
            .iter()
            .position(Option::is_none)
            .ok_or(PwmError::ChannelsExhausted)?;

        gpio.request_pin(pin, Owner::Actuator, "pwm")?;
        if let Err(e) = gpio.set_mode(pin, PinMode::Output) {
            let _ = gpio.release_pin(pin);
            return Err(e.into());
        }

        hal::ledc_attach(slot as u8, pin, DEFAULT_FREQ_HZ, DEFAULT_RESOLUTION_BITS);
        self.channels[slot] = Some(Channel {
            pin,
            freq_hz: DEFAULT_FREQ_HZ,
            resolution_bits: DEFAULT_RESOLUTION_BITS,
            duty_raw: 0,
        });
        info!("pwm: channel {} attached to pin {}", slot, pin);
        Ok(slot as u8)
    }

    /// Stop the channel and release its pin.
    pub fn detach(&mut self, channel: u8, gpio: &mut GpioManager) -> Result<(), PwmError> {
        let slot = self.channel_mut(channel)?;
        let pin = slot.pin;
        hal::ledc_set_duty(channel, 0);
        hal::ledc_detach(channel);
        self.channels[channel as usize] = None;
        let _ = gpio.release_pin(pin);
        debug!("pwm: channel {} detached (pin {})", channel, pin);
        Ok(())
    }

    pub fn set_frequency(&mut self, channel: u8, freq_hz: u32) -> Result<(), PwmError> {
        let slot = self.channel_mut(channel)?;
        slot.freq_hz = freq_hz;
        hal::ledc_set_frequency(channel, freq_hz);
        Ok(())
    }

    /// Resolution in bits, 1..=16.
    pub fn set_resolution(&mut self, channel: u8, bits: u8) -> Result<(), PwmError> {
        if !(1..=16).contains(&bits) {
            return Err(PwmError::BadResolution);
        }
        let slot = self.channel_mut(channel)?;
        slot.resolution_bits = bits;
        // Re-scale the held duty into the new range.
        slot.duty_raw = slot.duty_raw.min(max_duty(bits));
        Ok(())
    }

    /// Raw duty write, bounded by the channel resolution.
    pub fn write_duty(&mut self, channel: u8, raw: u32) -> Result<(), PwmError> {
        let slot = self.channel_mut(channel)?;
        if raw > max_duty(slot.resolution_bits) {
            return Err(PwmError::DutyOutOfRange);
        }
        slot.duty_raw = raw;
        hal::ledc_set_duty(channel, raw);
        Ok(())
    }

    /// Percent duty write, 0–100, clamped.
    pub fn write_percent(&mut self, channel: u8, percent: u8) -> Result<(), PwmError> {
        let slot = self.channel_mut(channel)?;
        let pct = u32::from(percent.min(100));
        let raw = max_duty(slot.resolution_bits) * pct / 100;
        slot.duty_raw = raw;
        hal::ledc_set_duty(channel, raw);
        Ok(())
    }

    /// Pin bound to a channel, if attached.
    pub fn channel_pin(&self, channel: u8) -> Option<u8> {
        self.channels
            .get(channel as usize)
            .and_then(|c| c.as_ref())
            .map(|c| c.pin)
    }

    /// Channels currently attached.
    pub fn in_use(&self) -> usize {
        self.channels.iter().flatten().count()
    }

    fn channel_mut(&mut self, channel: u8) -> Result<&mut Channel, PwmError> {
        self.channels
            .get_mut(channel as usize)
            .and_then(Option::as_mut)
            .ok_or(PwmError::BadChannel)
    }
}

fn max_duty(bits: u8) -> u32 {
    (1u32 << bits) - 1
}
