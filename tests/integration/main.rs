//! Host-side integration tests for the full node: boot, command
//! dispatch, emergency lifecycle, reconnection, bus recovery.
//!
//! Everything runs against the in-crate simulation adapters — no
//! hardware, no broker. Tests that touch the simulated pin table hold
//! the shared hardware lock for their whole body.

#![cfg(not(target_os = "espidf"))]

mod common;

mod boot_tests;
mod bus_recovery_tests;
mod command_tests;
mod emergency_tests;
mod reconnect_tests;
