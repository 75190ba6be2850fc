//! Chip-level auxiliary drivers.

pub mod watchdog;
