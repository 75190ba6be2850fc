//! Fuzz target: actuator command parsing.
//!
//! cargo fuzz run fuzz_command

#![no_main]

use fieldnode::config::packets::{Command, CommandVerb};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(cmd) = serde_json::from_slice::<Command>(data) {
        // Verb classification is total over arbitrary strings.
        let _ = CommandVerb::parse(&cmd.command);
        // Correlation ids pass through opaque; only bounded storage.
        if let Some(cid) = &cmd.correlation_id {
            assert!(cid.len() <= 48);
        }
    }
});
