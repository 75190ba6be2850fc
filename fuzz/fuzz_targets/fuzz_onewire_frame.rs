//! Fuzz target: one-wire CRC framing.
//!
//! The CRC check must accept exactly the frames whose ninth byte is
//! the CRC-8 of the first eight, and never panic on anything.
//!
//! cargo fuzz run fuzz_onewire_frame

#![no_main]

use fieldnode::bus::onewire::{crc8, rom_crc_valid};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = crc8(data);

    if data.len() >= 8 {
        let rom = u64::from_le_bytes(data[..8].try_into().unwrap());
        let valid = rom_crc_valid(rom);
        // Re-deriving the CRC must agree with the validity verdict.
        let expected = crc8(&rom.to_le_bytes()[..7]);
        assert_eq!(valid, expected == rom.to_le_bytes()[7]);
    }

    if data.len() >= 9 {
        let frame = &data[..9];
        let valid = crc8(&frame[..8]) == frame[8];
        // Appending the true CRC always frames validly.
        let mut fixed = [0u8; 9];
        fixed[..8].copy_from_slice(&frame[..8]);
        fixed[8] = crc8(&frame[..8]);
        assert!(crc8(&fixed[..8]) == fixed[8]);
        let _ = valid;
    }
});
