//! GPIO ownership manager.
//!
//! Single authority for pin allocation, mode and safe-mode invariants.
//! Every driver obtains its pins here before touching the hardware; no
//! two components ever drive the same pin.
//!
//! ## Safe mode
//!
//! A pin in safe mode is a pull-up input with no owner. Boot puts every
//! safe-listed pin there before any driver runs; emergency teardown
//! returns every pin there, driving outputs low *first* so an attached
//! relay never sees a floating line while the mode flips.

use core::fmt;

use log::{debug, info, warn};
use serde::Serialize;

use crate::board;
use crate::error::GpioError;
use crate::hal;

/// Settle time between de-energizing an output and reverting its mode.
const DEENERGIZE_SETTLE_US: u32 = 50;

const LABEL_CAP: usize = 24;
const SUBZONE_CAP: usize = 16;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Electrical mode of a pin, as tracked by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PinMode {
    /// High-impedance input with pull-up: the hardware-safe idle state.
    SafeInput,
    /// Floating digital input.
    Input,
    /// Push-pull digital output.
    Output,
}

/// Component class holding a pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Owner {
    System,
    Sensor,
    Actuator,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Sensor => write!(f, "sensor"),
            Self::Actuator => write!(f, "actuator"),
        }
    }
}

#[derive(Debug, Clone)]
struct Claim {
    owner: Owner,
    label: heapless::String<LABEL_CAP>,
    subzone: Option<heapless::String<SUBZONE_CAP>>,
}

#[derive(Debug, Clone)]
struct PinState {
    mode: PinMode,
    claim: Option<Claim>,
}

/// Public snapshot of one owned pin, for heartbeat and status payloads.
#[derive(Debug, Clone, Serialize)]
pub struct PinInfo {
    pub pin: u8,
    pub mode: PinMode,
    pub owner: Owner,
    pub label: heapless::String<LABEL_CAP>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subzone: Option<heapless::String<SUBZONE_CAP>>,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Process-wide pin authority. One instance, owned by the composition
/// root; handles are passed explicitly to every subsystem that needs
/// pins.
pub struct GpioManager {
    pins: [PinState; board::GPIO_COUNT],
}

impl Default for GpioManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GpioManager {
    pub fn new() -> Self {
        Self {
            pins: core::array::from_fn(|_| PinState {
                mode: PinMode::SafeInput,
                claim: None,
            }),
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    /// Put every safe-listed pin into safe mode, then pre-reserve the
    /// shared-bus pins for the system owner. Called once at boot before
    /// any driver starts.
    pub fn initialize_to_safe_mode(&mut self) {
        for &pin in board::SAFE_PINS {
            hal::gpio_config_input_pullup(pin);
            let state = &mut self.pins[pin as usize];
            state.mode = PinMode::SafeInput;
            state.claim = None;
            self.verify_pullup(pin);
        }

        // Bus lines belong to the system before anything else can ask.
        let _ = self.request_pin(board::I2C_SDA_PIN, Owner::System, "i2c-sda");
        let _ = self.request_pin(board::I2C_SCL_PIN, Owner::System, "i2c-scl");

        info!(
            "gpio: safe mode initialized, {} safe pins, bus pins {}+{} reserved",
            board::SAFE_PINS.len(),
            board::I2C_SDA_PIN,
            board::I2C_SCL_PIN
        );
    }

    /// Emergency teardown: de-energize every output, wait for the level
    /// to settle, then revert everything to safe mode and drop all
    /// claims. Order matters — reverting mode first could float an
    /// attached relay coil long enough to chatter.
    pub fn emergency_safe_mode_all(&mut self) {
        for &pin in board::SAFE_PINS {
            if self.pins[pin as usize].mode == PinMode::Output {
                hal::gpio_write(pin, false);
            }
        }

        hal::delay_us(DEENERGIZE_SETTLE_US);

        for &pin in board::SAFE_PINS {
            let state = &mut self.pins[pin as usize];
            hal::gpio_config_input_pullup(pin);
            state.mode = PinMode::SafeInput;
            state.claim = None;
        }

        warn!("gpio: emergency safe mode applied to all pins");
    }

    // ── Ownership ─────────────────────────────────────────────

    /// Reserve a pin for `owner`. Re-requesting with identical owner and
    /// label is idempotent; anything else on a held pin is a conflict.
    pub fn request_pin(&mut self, pin: u8, owner: Owner, label: &str) -> Result<(), GpioError> {
        if !board::is_safe_pin(pin) {
            return Err(GpioError::NotInSafeList);
        }

        let state = &mut self.pins[pin as usize];
        if let Some(claim) = &state.claim {
            if claim.owner == owner && claim.label.as_str() == label {
                debug!("gpio: pin {} re-reserved by {}/{}", pin, owner, label);
                return Ok(());
            }
            return Err(GpioError::Conflict);
        }

        let mut l = heapless::String::new();
        let _ = l.push_str(&label[..label.len().min(LABEL_CAP)]);
        state.claim = Some(Claim {
            owner,
            label: l,
            subzone: None,
        });
        debug!("gpio: pin {} reserved by {} ({})", pin, owner, label);
        Ok(())
    }

    /// Release a pin back to safe mode. Outputs are de-energized before
    /// the mode reverts, same as the emergency path.
    pub fn release_pin(&mut self, pin: u8) -> Result<(), GpioError> {
        let state = self
            .pins
            .get_mut(pin as usize)
            .ok_or(GpioError::NotInSafeList)?;
        if state.claim.is_none() {
            return Err(GpioError::NotOwned);
        }

        if state.mode == PinMode::Output {
            hal::gpio_write(pin, false);
            hal::delay_us(DEENERGIZE_SETTLE_US);
        }
        hal::gpio_config_input_pullup(pin);
        state.mode = PinMode::SafeInput;
        state.claim = None;
        debug!("gpio: pin {} released", pin);
        Ok(())
    }

    // ── Mode & level ──────────────────────────────────────────

    /// Change the electrical mode of an owned pin.
    pub fn set_mode(&mut self, pin: u8, mode: PinMode) -> Result<(), GpioError> {
        let state = self
            .pins
            .get_mut(pin as usize)
            .ok_or(GpioError::NotInSafeList)?;
        if state.claim.is_none() {
            return Err(GpioError::NotOwned);
        }
        if mode == PinMode::Output && board::is_input_only(pin) {
            return Err(GpioError::InputOnly);
        }

        match mode {
            PinMode::SafeInput => hal::gpio_config_input_pullup(pin),
            PinMode::Input => hal::gpio_config_input(pin),
            PinMode::Output => hal::gpio_config_output(pin),
        }
        state.mode = mode;

        if mode == PinMode::SafeInput {
            self.verify_pullup(pin);
        }
        Ok(())
    }

    /// Drive the level of an owned output pin.
    pub fn write(&mut self, pin: u8, high: bool) -> Result<(), GpioError> {
        let state = self.pins.get(pin as usize).ok_or(GpioError::NotInSafeList)?;
        if state.claim.is_none() {
            return Err(GpioError::NotOwned);
        }
        if state.mode != PinMode::Output {
            return Err(GpioError::WrongMode);
        }
        hal::gpio_write(pin, high);
        Ok(())
    }

    /// Read the current level of a pin.
    pub fn read(&self, pin: u8) -> bool {
        hal::gpio_read(pin)
    }

    // ── Queries ───────────────────────────────────────────────

    /// Snapshot of one pin, if it carries a claim.
    pub fn pin_info(&self, pin: u8) -> Option<PinInfo> {
        let state = self.pins.get(pin as usize)?;
        let claim = state.claim.as_ref()?;
        Some(PinInfo {
            pin,
            mode: state.mode,
            owner: claim.owner,
            label: claim.label.clone(),
            subzone: claim.subzone.clone(),
        })
    }

    /// Current owner of a pin, if any.
    pub fn owner(&self, pin: u8) -> Option<Owner> {
        self.pins
            .get(pin as usize)
            .and_then(|s| s.claim.as_ref())
            .map(|c| c.owner)
    }

    /// Tracked mode of a pin.
    pub fn mode(&self, pin: u8) -> PinMode {
        self.pins
            .get(pin as usize)
            .map_or(PinMode::SafeInput, |s| s.mode)
    }

    /// All owned pins, for the heartbeat snapshot.
    pub fn snapshot(&self) -> heapless::Vec<PinInfo, { board::GPIO_COUNT }> {
        let mut out = heapless::Vec::new();
        for pin in 0..board::GPIO_COUNT as u8 {
            if let Some(info) = self.pin_info(pin) {
                let _ = out.push(info);
            }
        }
        out
    }

    // ── Subzones ──────────────────────────────────────────────

    /// Tag an owned pin with a subzone. The tag is opaque to the node.
    pub fn assign_subzone(&mut self, pin: u8, tag: &str) -> Result<(), GpioError> {
        let state = self
            .pins
            .get_mut(pin as usize)
            .ok_or(GpioError::NotInSafeList)?;
        let claim = state.claim.as_mut().ok_or(GpioError::NotOwned)?;
        let mut t = heapless::String::new();
        let _ = t.push_str(&tag[..tag.len().min(SUBZONE_CAP)]);
        claim.subzone = Some(t);
        Ok(())
    }

    /// Remove the subzone tag from a pin.
    pub fn remove_subzone(&mut self, pin: u8) -> Result<(), GpioError> {
        let state = self
            .pins
            .get_mut(pin as usize)
            .ok_or(GpioError::NotInSafeList)?;
        let claim = state.claim.as_mut().ok_or(GpioError::NotOwned)?;
        claim.subzone = None;
        Ok(())
    }

    /// Pins carrying the given subzone tag.
    pub fn pins_in_subzone(&self, tag: &str) -> heapless::Vec<u8, { board::GPIO_COUNT }> {
        let mut out = heapless::Vec::new();
        for (i, state) in self.pins.iter().enumerate() {
            if let Some(claim) = &state.claim {
                if claim.subzone.as_deref() == Some(tag) {
                    let _ = out.push(i as u8);
                }
            }
        }
        out
    }

    // ── Internal ──────────────────────────────────────────────

    /// Best-effort check that a pull-up input actually reads high.
    /// A low read usually means something external is clamping the line;
    /// worth a warning, never a failure.
    fn verify_pullup(&self, pin: u8) {
        if !hal::gpio_read(pin) {
            warn!("gpio: pin {} reads low in pull-up input mode", pin);
        }
    }
}
