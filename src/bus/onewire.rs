//! One-wire multidrop bus: ROM enumeration and CRC-checked frame reads.
//!
//! Exactly one one-wire bus per node. Wire I/O goes through
//! [`OneWireIo`]; [`PinOneWire`] is the bit-banged implementation over a
//! single open-drain data pin, and host tests use [`SimOneWire`], a
//! protocol-level device model.
//!
//! The temperature read sequence must be reproduced exactly: reset →
//! select → convert, a fixed 750 ms latency, reset → select → read
//! scratchpad, nine bytes, CRC-8 over the first eight must equal the
//! ninth. The node emits the raw sixteenths-of-degree value; scaling is
//! the controller's job.

use log::{debug, info};

use crate::board;
use crate::error::OneWireError;
use crate::gpio::{GpioManager, Owner};
use crate::hal;

/// Fixed conversion latency (12-bit resolution).
pub const CONVERT_LATENCY_MS: u64 = 750;

/// Most ROMs a scan will return.
pub const MAX_DEVICES: usize = 16;

// ROM commands.
const CMD_SEARCH_ROM: u8 = 0xF0;
const CMD_MATCH_ROM: u8 = 0x55;
const CMD_SKIP_ROM: u8 = 0xCC;
// Function commands.
const CMD_CONVERT_T: u8 = 0x44;
const CMD_READ_SCRATCHPAD: u8 = 0xBE;

/// CRC-8/Maxim over `data` (poly 0x31 reflected → 0x8C).
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for byte in data {
        let mut b = *byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
    }
    crc
}

/// True if the 64-bit ROM's embedded CRC (top byte) matches the CRC-8
/// of its low seven bytes.
pub fn rom_crc_valid(rom: u64) -> bool {
    let bytes = rom.to_le_bytes();
    crc8(&bytes[..7]) == bytes[7]
}

// ---------------------------------------------------------------------------
// Wire I/O trait
// ---------------------------------------------------------------------------

/// Byte/bit-level one-wire transactions.
pub trait OneWireIo {
    /// Bind the I/O to a data pin. Called once by [`OneWireBus::begin`].
    fn attach(&mut self, pin: u8) -> Result<(), OneWireError>;

    /// Bus reset; returns true when at least one device answered the
    /// presence window.
    fn reset(&mut self) -> Result<bool, OneWireError>;

    fn write_byte(&mut self, byte: u8) -> Result<(), OneWireError>;

    fn read_byte(&mut self) -> Result<u8, OneWireError>;

    /// One search step: read the id bit and its complement, then write
    /// the chosen direction. On a discrepancy (devices disagree) the
    /// direction is `take_on_discrepancy`. Returns
    /// `(bit_taken, discrepancy_seen)`.
    fn triplet(&mut self, take_on_discrepancy: bool) -> Result<(bool, bool), OneWireError>;
}

// ---------------------------------------------------------------------------
// Bus driver
// ---------------------------------------------------------------------------

/// The node's single one-wire bus.
pub struct OneWireBus<W: OneWireIo> {
    io: W,
    pin: Option<u8>,
    /// ROMs skipped during enumeration for failing CRC. Counted, never
    /// fatal.
    crc_skips: u32,
}

impl<W: OneWireIo> OneWireBus<W> {
    pub fn new(io: W) -> Self {
        Self {
            io,
            pin: None,
            crc_skips: 0,
        }
    }

    /// Initialize over `pin`. Pin 0 means "use the board default" —
    /// never a literal pin. Re-initializing on the same pin is
    /// idempotent; a different pin is an error.
    pub fn begin(&mut self, pin: u8, gpio: &mut GpioManager) -> Result<(), OneWireError> {
        let pin = if pin == 0 {
            board::ONEWIRE_DEFAULT_PIN
        } else {
            pin
        };

        match self.pin {
            Some(current) if current == pin => return Ok(()),
            Some(_) => return Err(OneWireError::PinMismatch),
            None => {}
        }

        gpio.request_pin(pin, Owner::System, "one-wire")
            .map_err(|_| OneWireError::IoFailed)?;
        self.io.attach(pin)?;
        self.pin = Some(pin);
        info!("onewire: initialized on pin {}", pin);
        Ok(())
    }

    pub fn pin(&self) -> Option<u8> {
        self.pin
    }

    /// Direct access to the wire I/O (host tests populate the simulated
    /// segment through this).
    pub fn io_mut(&mut self) -> &mut W {
        &mut self.io
    }

    pub fn crc_skips(&self) -> u32 {
        self.crc_skips
    }

    /// One-line health summary for heartbeat payloads.
    pub fn status_string(&self) -> heapless::String<64> {
        let mut s = heapless::String::new();
        let _ = core::fmt::Write::write_fmt(
            &mut s,
            format_args!(
                "{} (crc skips {})",
                if self.pin.is_some() { "ok" } else { "down" },
                self.crc_skips
            ),
        );
        s
    }

    // ── Enumeration ───────────────────────────────────────────

    /// Enumerate device ROMs, up to `max`. Candidates failing the ROM
    /// CRC are skipped silently (counted in [`crc_skips`]).
    pub fn scan_devices(
        &mut self,
        max: usize,
    ) -> Result<heapless::Vec<u64, MAX_DEVICES>, OneWireError> {
        self.ensure_init()?;
        let mut found = heapless::Vec::new();

        // Classic discrepancy-walk search: remember the deepest bit
        // where we took the 0 branch with a 1 branch pending, and flip
        // it on the next pass.
        let mut last_discrepancy: i8 = -1;
        let mut previous_rom: u64 = 0;

        loop {
            if found.len() >= max.min(MAX_DEVICES) {
                break;
            }
            if !self.io.reset()? {
                break;
            }
            self.io.write_byte(CMD_SEARCH_ROM)?;

            let mut rom: u64 = 0;
            let mut last_zero: i8 = -1;
            for i in 0..64i8 {
                let take = match i.cmp(&last_discrepancy) {
                    core::cmp::Ordering::Less => previous_rom & (1 << i) != 0,
                    core::cmp::Ordering::Equal => true,
                    core::cmp::Ordering::Greater => false,
                };
                let (took, discrepancy) = self.io.triplet(take)?;
                if discrepancy && !took {
                    last_zero = i;
                }
                if took {
                    rom |= 1 << i;
                }
            }

            if rom_crc_valid(rom) {
                let _ = found.push(rom);
            } else {
                self.crc_skips = self.crc_skips.saturating_add(1);
                debug!("onewire: ROM {:#018x} failed CRC, skipped", rom);
            }

            previous_rom = rom;
            last_discrepancy = last_zero;
            if last_discrepancy < 0 {
                break;
            }
        }

        Ok(found)
    }

    /// True if `rom` currently answers enumeration.
    pub fn is_device_present(&mut self, rom: u64) -> bool {
        self.scan_devices(MAX_DEVICES)
            .map(|roms| roms.contains(&rom))
            .unwrap_or(false)
    }

    // ── Temperature ───────────────────────────────────────────

    /// Issue a conversion to `rom`. The caller waits
    /// [`CONVERT_LATENCY_MS`] before [`read_scratchpad`]; the sensor
    /// manager does this as a non-blocking state machine.
    pub fn start_conversion(&mut self, rom: u64) -> Result<(), OneWireError> {
        self.ensure_init()?;
        if !self.io.reset()? {
            return Err(OneWireError::NoPresence);
        }
        self.select(rom)?;
        self.io.write_byte(CMD_CONVERT_T)
    }

    /// Read the nine-byte scratchpad of `rom` and return the raw signed
    /// sixteenths-of-degree value. Fails on CRC mismatch.
    pub fn read_scratchpad(&mut self, rom: u64) -> Result<i16, OneWireError> {
        self.ensure_init()?;
        if !self.io.reset()? {
            return Err(OneWireError::NoPresence);
        }
        self.select(rom)?;
        self.io.write_byte(CMD_READ_SCRATCHPAD)?;

        let mut frame = [0u8; 9];
        for b in &mut frame {
            *b = self.io.read_byte()?;
        }
        if crc8(&frame[..8]) != frame[8] {
            return Err(OneWireError::CrcMismatch);
        }

        Ok(i16::from_le_bytes([frame[0], frame[1]]))
    }

    /// Blocking convert-and-read. The fixed in-line wait is a permitted
    /// suspension point; callers on the main loop use the two-phase API
    /// instead.
    pub fn read_raw_temperature(&mut self, rom: u64) -> Result<i16, OneWireError> {
        self.start_conversion(rom)?;
        hal::delay_ms(CONVERT_LATENCY_MS as u32);
        self.read_scratchpad(rom)
    }

    // ── Internal ──────────────────────────────────────────────

    fn ensure_init(&self) -> Result<(), OneWireError> {
        if self.pin.is_none() {
            return Err(OneWireError::NotInitialized);
        }
        Ok(())
    }

    fn select(&mut self, rom: u64) -> Result<(), OneWireError> {
        self.io.write_byte(CMD_MATCH_ROM)?;
        for byte in rom.to_le_bytes() {
            self.io.write_byte(byte)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Bit-banged pin I/O
// ---------------------------------------------------------------------------

/// Open-drain bit-bang over a single data pin. Timings per the
/// standard-speed one-wire budget; "release" means reverting the pin to
/// pull-up input so the line floats high.
pub struct PinOneWire {
    pin: Option<u8>,
}

impl Default for PinOneWire {
    fn default() -> Self {
        Self::new()
    }
}

impl PinOneWire {
    pub fn new() -> Self {
        Self { pin: None }
    }

    fn pin(&self) -> Result<u8, OneWireError> {
        self.pin.ok_or(OneWireError::NotInitialized)
    }

    fn drive_low(&self, pin: u8) {
        hal::gpio_config_output(pin);
        hal::gpio_write(pin, false);
    }

    fn release(&self, pin: u8) {
        hal::gpio_config_input_pullup(pin);
    }

    fn write_bit(&mut self, bit: bool) -> Result<(), OneWireError> {
        let pin = self.pin()?;
        self.drive_low(pin);
        hal::delay_us(if bit { 6 } else { 60 });
        self.release(pin);
        hal::delay_us(if bit { 64 } else { 10 });
        Ok(())
    }

    fn read_bit(&mut self) -> Result<bool, OneWireError> {
        let pin = self.pin()?;
        self.drive_low(pin);
        hal::delay_us(6);
        self.release(pin);
        hal::delay_us(9);
        let bit = hal::gpio_read(pin);
        hal::delay_us(55);
        Ok(bit)
    }
}

impl OneWireIo for PinOneWire {
    fn attach(&mut self, pin: u8) -> Result<(), OneWireError> {
        self.pin = Some(pin);
        hal::gpio_config_input_pullup(pin);
        Ok(())
    }

    fn reset(&mut self) -> Result<bool, OneWireError> {
        let pin = self.pin()?;
        self.drive_low(pin);
        hal::delay_us(480);
        self.release(pin);
        hal::delay_us(70);
        let presence = !hal::gpio_read(pin);
        hal::delay_us(410);
        Ok(presence)
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), OneWireError> {
        for i in 0..8 {
            self.write_bit(byte & (1 << i) != 0)?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, OneWireError> {
        let mut byte = 0u8;
        for i in 0..8 {
            if self.read_bit()? {
                byte |= 1 << i;
            }
        }
        Ok(byte)
    }

    fn triplet(&mut self, take_on_discrepancy: bool) -> Result<(bool, bool), OneWireError> {
        let id_bit = self.read_bit()?;
        let cmp_bit = self.read_bit()?;
        let (dir, discrepancy) = match (id_bit, cmp_bit) {
            (true, true) => return Err(OneWireError::NoPresence),
            (false, false) => (take_on_discrepancy, true),
            (bit, _) => (bit, false),
        };
        self.write_bit(dir)?;
        Ok((dir, discrepancy))
    }
}

// ---------------------------------------------------------------------------
// Host device model
// ---------------------------------------------------------------------------

/// Protocol-level simulation of a one-wire segment populated with
/// temperature devices. Interprets reset/select/search well enough to
/// exercise the real driver logic, including CRC failures.
#[cfg(not(target_os = "espidf"))]
pub struct SimOneWire {
    devices: Vec<SimDevice>,
    selected: Option<u64>,
    collecting_rom: Option<(u8, [u8; 8])>,
    rx: std::collections::VecDeque<u8>,
    search: Option<SearchProgress>,
    /// Force the next reset to report no presence.
    pub drop_presence: bool,
}

#[cfg(not(target_os = "espidf"))]
struct SimDevice {
    rom: u64,
    scratchpad: [u8; 9],
}

#[cfg(not(target_os = "espidf"))]
struct SearchProgress {
    bit: u8,
    candidates: Vec<u64>,
}

#[cfg(not(target_os = "espidf"))]
impl Default for SimOneWire {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl SimOneWire {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            selected: None,
            collecting_rom: None,
            rx: std::collections::VecDeque::new(),
            search: None,
            drop_presence: false,
        }
    }

    /// Build a valid temperature-device ROM from a 48-bit serial.
    pub fn make_rom(serial: u64) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[0] = 0x28; // temperature family
        bytes[1..7].copy_from_slice(&serial.to_le_bytes()[..6]);
        bytes[7] = crc8(&bytes[..7]);
        u64::from_le_bytes(bytes)
    }

    /// Add a device reporting `raw` sixteenths of a degree.
    pub fn add_device(&mut self, rom: u64, raw: i16) {
        let mut pad = [0u8; 9];
        pad[..2].copy_from_slice(&raw.to_le_bytes());
        pad[4] = 0x7F; // config register, 12-bit
        pad[8] = crc8(&pad[..8]);
        self.devices.push(SimDevice {
            rom,
            scratchpad: pad,
        });
    }

    /// Replace a device's scratchpad verbatim (tests use this to plant
    /// CRC corruption).
    pub fn set_scratchpad(&mut self, rom: u64, pad: [u8; 9]) {
        if let Some(d) = self.devices.iter_mut().find(|d| d.rom == rom) {
            d.scratchpad = pad;
        }
    }

    /// Update the temperature a device reports.
    pub fn set_temperature(&mut self, rom: u64, raw: i16) {
        if let Some(d) = self.devices.iter_mut().find(|d| d.rom == rom) {
            d.scratchpad[..2].copy_from_slice(&raw.to_le_bytes());
            d.scratchpad[8] = crc8(&d.scratchpad[..8]);
        }
    }
}

#[cfg(not(target_os = "espidf"))]
impl OneWireIo for SimOneWire {
    fn attach(&mut self, _pin: u8) -> Result<(), OneWireError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<bool, OneWireError> {
        self.selected = None;
        self.collecting_rom = None;
        self.rx.clear();
        self.search = None;
        if self.drop_presence {
            self.drop_presence = false;
            return Ok(false);
        }
        Ok(!self.devices.is_empty())
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), OneWireError> {
        if let Some((count, mut rom_bytes)) = self.collecting_rom.take() {
            rom_bytes[count as usize] = byte;
            if count == 7 {
                let rom = u64::from_le_bytes(rom_bytes);
                self.selected = self.devices.iter().find(|d| d.rom == rom).map(|d| d.rom);
            } else {
                self.collecting_rom = Some((count + 1, rom_bytes));
            }
            return Ok(());
        }

        match byte {
            CMD_MATCH_ROM => self.collecting_rom = Some((0, [0u8; 8])),
            CMD_SKIP_ROM => {
                self.selected = if self.devices.len() == 1 {
                    Some(self.devices[0].rom)
                } else {
                    None
                };
            }
            CMD_SEARCH_ROM => {
                self.search = Some(SearchProgress {
                    bit: 0,
                    candidates: self.devices.iter().map(|d| d.rom).collect(),
                });
            }
            CMD_CONVERT_T => {} // conversion latency is the caller's wait
            CMD_READ_SCRATCHPAD => {
                if let Some(rom) = self.selected {
                    if let Some(d) = self.devices.iter().find(|d| d.rom == rom) {
                        self.rx.extend(d.scratchpad);
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, OneWireError> {
        // An idle line reads all ones.
        Ok(self.rx.pop_front().unwrap_or(0xFF))
    }

    fn triplet(&mut self, take_on_discrepancy: bool) -> Result<(bool, bool), OneWireError> {
        let search = self.search.as_mut().ok_or(OneWireError::IoFailed)?;
        let bit = search.bit;
        search.bit += 1;

        let mask = 1u64 << bit;
        let any_zero = search.candidates.iter().any(|r| r & mask == 0);
        let any_one = search.candidates.iter().any(|r| r & mask != 0);

        let (took, discrepancy) = match (any_zero, any_one) {
            (false, false) => return Err(OneWireError::NoPresence),
            (true, true) => (take_on_discrepancy, true),
            (false, true) => (true, false),
            (true, false) => (false, false),
        };

        search
            .candidates
            .retain(|r| (r & mask != 0) == took);
        Ok((took, discrepancy))
    }
}
