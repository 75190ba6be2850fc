//! Board definitions for the FieldNode main board (ESP32-class).
//!
//! Single source of truth — the GPIO manager and bus drivers reference
//! this module rather than hard-coding pin numbers. The `board-mini`
//! feature selects the small-board variant (fewer PWM channels, smaller
//! registries).
//!
//! The core never touches board pin numbers outside these tables; only
//! pin-role constants (I2C SDA/SCL, default one-wire) are exported.

/// Number of addressable GPIO indices on this chip family.
pub const GPIO_COUNT: usize = 40;

/// Pins that may be issued to sensor and actuator owners.
///
/// Everything not listed here or in [`RESERVED_PINS`] is treated as
/// reserved: requests for it fail with a not-in-safe-list error.
pub const SAFE_PINS: &[u8] = &[
    4, 5, 13, 14, 16, 17, 18, 19, 21, 22, 23, 25, 26, 27, 32, 33, 34, 35, 36, 39,
];

/// Pins the firmware must never issue: flash (6-11), UART0 (1, 3),
/// strapping pins (0, 2, 12, 15).
pub const RESERVED_PINS: &[u8] = &[0, 1, 2, 3, 6, 7, 8, 9, 10, 11, 12, 15];

/// Input-only pins (no output driver on this chip family).
pub const INPUT_ONLY_PINS: &[u8] = &[34, 35, 36, 39];

// ---------------------------------------------------------------------------
// Pin roles
// ---------------------------------------------------------------------------

/// Shared serial bus data line. Pre-reserved to the system owner by
/// safe-mode initialisation.
pub const I2C_SDA_PIN: u8 = 21;
/// Shared serial bus clock line. Pre-reserved to the system owner.
pub const I2C_SCL_PIN: u8 = 22;

/// Default one-wire data pin. A sensor config carrying pin 0 resolves to
/// this pin; literal GPIO0 is a strapping pin and is reserved.
pub const ONEWIRE_DEFAULT_PIN: u8 = 4;

// ---------------------------------------------------------------------------
// Capacity constants
// ---------------------------------------------------------------------------

/// Timer-backed PWM generators available on this chip.
#[cfg(not(feature = "board-mini"))]
pub const PWM_CHANNEL_COUNT: usize = 16;
#[cfg(feature = "board-mini")]
pub const PWM_CHANNEL_COUNT: usize = 6;

/// Upper bound of configured actuators. Registries are fixed-capacity;
/// heap fragmentation is a hazard on this target.
#[cfg(not(feature = "board-mini"))]
pub const MAX_ACTUATORS: usize = 16;
#[cfg(feature = "board-mini")]
pub const MAX_ACTUATORS: usize = 8;

/// Upper bound of configured sensors.
#[cfg(not(feature = "board-mini"))]
pub const MAX_SENSORS: usize = 16;
#[cfg(feature = "board-mini")]
pub const MAX_SENSORS: usize = 8;

/// Shared-bus clock frequency.
pub const I2C_FREQ_HZ: u32 = 100_000;

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// True if `pin` may be issued to a sensor or actuator owner.
pub fn is_safe_pin(pin: u8) -> bool {
    SAFE_PINS.contains(&pin)
}

/// True if `pin` is in the board reserved list.
pub fn is_reserved_pin(pin: u8) -> bool {
    RESERVED_PINS.contains(&pin)
}

/// True if `pin` cannot be driven as an output.
pub fn is_input_only(pin: u8) -> bool {
    INPUT_ONLY_PINS.contains(&pin)
}
