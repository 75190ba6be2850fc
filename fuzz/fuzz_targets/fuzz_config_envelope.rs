//! Fuzz target: inbound config packet parsing.
//!
//! Arbitrary bytes through the single structured parse must never
//! panic, and every parse failure must classify into a stable config
//! error code.
//!
//! cargo fuzz run fuzz_config_envelope

#![no_main]

use fieldnode::config::packets::{classify_parse_error, ConfigEnvelope};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    match serde_json::from_slice::<ConfigEnvelope>(data) {
        Ok(envelope) => {
            // Section detection must be total: no panic when walking
            // whatever the parse accepted.
            let _ = envelope.sensors.map(|s| s.len());
            let _ = envelope.actuators.map(|a| a.len());
        }
        Err(e) => {
            let code = classify_parse_error(&e);
            assert!((2000..3000).contains(&code), "code {code} out of category");
        }
    }
});
