//! Unified error types and the structured error history.
//!
//! Every subsystem defines a small `Copy` error enum that converts into
//! the crate-wide [`Error`], keeping the main loop's handling uniform.
//! Each variant maps to a stable 16-bit code in 1000-range categories:
//! 1xxx hardware, 2xxx service, 3xxx communication, 4xxx application.
//! The controller keys alert handling off these codes, so they are wire
//! contract, not decoration.

use core::fmt;

use serde::Serialize;

// Display bodies that are pure variant→literal tables use this to keep
// the match noise down.
macro_rules! fmt_display_match {
    ($($pat:pat => $msg:expr),* $(,)?) => {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                $($pat => write!(f, $msg),)*
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Stable wire-visible error codes.
pub mod codes {
    // 1xxx — hardware
    pub const GPIO_NOT_IN_SAFE_LIST: u16 = 1001;
    pub const GPIO_CONFLICT: u16 = 1002;
    pub const GPIO_INPUT_ONLY: u16 = 1003;
    pub const GPIO_NOT_OWNED: u16 = 1004;
    pub const GPIO_WRONG_MODE: u16 = 1005;
    pub const BUS_INIT_FAILED: u16 = 1010;
    pub const BUS_STUCK: u16 = 1011;
    pub const BUS_RECOVERY_STARTED: u16 = 1012;
    pub const BUS_RECOVERY_SUCCEEDED: u16 = 1013;
    pub const BUS_RECOVERY_FAILED: u16 = 1014;
    pub const BUS_IO_TIMEOUT: u16 = 1015;
    pub const BUS_NACK: u16 = 1016;
    pub const ONEWIRE_CRC_MISMATCH: u16 = 1020;
    pub const ONEWIRE_NO_PRESENCE: u16 = 1021;
    pub const ONEWIRE_PIN_MISMATCH: u16 = 1022;
    pub const PWM_CHANNELS_EXHAUSTED: u16 = 1030;
    pub const PWM_BAD_CHANNEL: u16 = 1031;
    pub const PWM_BAD_RESOLUTION: u16 = 1032;
    pub const PWM_DUTY_RANGE: u16 = 1033;

    // 2xxx — service
    pub const STORE_READ_FAILED: u16 = 2001;
    pub const STORE_WRITE_FAILED: u16 = 2002;
    pub const CONFIG_PARSE_FAILED: u16 = 2010;
    pub const CONFIG_MISSING_FIELD: u16 = 2011;
    pub const CONFIG_TYPE_MISMATCH: u16 = 2012;
    pub const CONFIG_VALUE_RANGE: u16 = 2013;
    pub const CONFIG_VALIDATION_FAILED: u16 = 2014;
    pub const CONFIG_DUPLICATE_PIN: u16 = 2015;
    pub const CONFIG_UNKNOWN_KIND: u16 = 2016;
    pub const REGISTRY_FULL: u16 = 2017;

    // 3xxx — communication
    pub const BROKER_CONNECT_FAILED: u16 = 3001;
    pub const SUBSCRIBE_FAILED: u16 = 3002;
    pub const PUBLISH_FAILED: u16 = 3003;
    pub const QUEUE_OVERFLOW_EVICTION: u16 = 3004;

    // 4xxx — application
    pub const EMERGENCY_ACTIVE: u16 = 4001;
    pub const OUTPUTS_DISABLED: u16 = 4002;
    pub const UNKNOWN_COMMAND: u16 = 4003;
    pub const WATCHDOG_FEED_BLOCKED: u16 = 4004;
    pub const RUNTIME_PROTECTION_TRIP: u16 = 4010;
    pub const RUNTIME_PROTECTION_REFUSAL: u16 = 4011;
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

// ---------------------------------------------------------------------------
// Subsystem errors
// ---------------------------------------------------------------------------

/// GPIO ownership / mode errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioError {
    /// Pin is reserved or not in the board safe list.
    NotInSafeList,
    /// Pin already owned by a different owner or label.
    Conflict,
    /// Pin cannot be driven as an output.
    InputOnly,
    /// Operation requires ownership the caller does not hold.
    NotOwned,
    /// Level write on a pin that is not in output mode.
    WrongMode,
}

impl GpioError {
    pub const fn code(self) -> u16 {
        match self {
            Self::NotInSafeList => codes::GPIO_NOT_IN_SAFE_LIST,
            Self::Conflict => codes::GPIO_CONFLICT,
            Self::InputOnly => codes::GPIO_INPUT_ONLY,
            Self::NotOwned => codes::GPIO_NOT_OWNED,
            Self::WrongMode => codes::GPIO_WRONG_MODE,
        }
    }
}

impl fmt::Display for GpioError {
    fmt_display_match! {
        Self::NotInSafeList => "reserved or not in safe list",
        Self::Conflict => "pin owned by another component",
        Self::InputOnly => "pin is input-only",
        Self::NotOwned => "pin not owned by caller",
        Self::WrongMode => "pin not in output mode",
    }
}

/// Shared two-wire bus errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusError {
    NotInitialized,
    /// SDA held low by a wedged device.
    Stuck,
    Timeout,
    /// Address or data byte not acknowledged.
    Nack,
    /// Controller hardware fault.
    HwFault,
    /// Recovery budget exhausted; bus marked degraded.
    Degraded,
}

impl BusError {
    pub const fn code(self) -> u16 {
        match self {
            Self::NotInitialized | Self::HwFault => codes::BUS_INIT_FAILED,
            Self::Stuck => codes::BUS_STUCK,
            Self::Timeout => codes::BUS_IO_TIMEOUT,
            Self::Nack => codes::BUS_NACK,
            Self::Degraded => codes::BUS_RECOVERY_FAILED,
        }
    }

    /// True for the failure modes that call for clock-out recovery.
    pub const fn is_recoverable(self) -> bool {
        matches!(self, Self::Stuck | Self::Timeout)
    }
}

impl fmt::Display for BusError {
    fmt_display_match! {
        Self::NotInitialized => "bus not initialized",
        Self::Stuck => "bus stuck (data line held low)",
        Self::Timeout => "bus I/O timeout",
        Self::Nack => "device did not acknowledge",
        Self::HwFault => "bus controller fault",
        Self::Degraded => "bus degraded after failed recovery",
    }
}

/// One-wire bus errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneWireError {
    NotInitialized,
    /// No device answered the reset pulse.
    NoPresence,
    /// CRC-8 over a ROM or scratchpad did not match.
    CrcMismatch,
    /// begin() called with a different pin while already initialized.
    PinMismatch,
    IoFailed,
}

impl OneWireError {
    pub const fn code(self) -> u16 {
        match self {
            Self::NotInitialized | Self::IoFailed => codes::BUS_INIT_FAILED,
            Self::NoPresence => codes::ONEWIRE_NO_PRESENCE,
            Self::CrcMismatch => codes::ONEWIRE_CRC_MISMATCH,
            Self::PinMismatch => codes::ONEWIRE_PIN_MISMATCH,
        }
    }
}

impl fmt::Display for OneWireError {
    fmt_display_match! {
        Self::NotInitialized => "one-wire bus not initialized",
        Self::NoPresence => "no presence pulse",
        Self::CrcMismatch => "CRC-8 mismatch",
        Self::PinMismatch => "one-wire already bound to another pin",
        Self::IoFailed => "one-wire I/O failed",
    }
}

/// PWM channel allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PwmError {
    ChannelsExhausted,
    BadChannel,
    /// Resolution outside 1..=16 bits.
    BadResolution,
    /// Raw duty exceeds 2^bits - 1.
    DutyOutOfRange,
    Gpio(GpioError),
}

impl PwmError {
    pub const fn code(self) -> u16 {
        match self {
            Self::ChannelsExhausted => codes::PWM_CHANNELS_EXHAUSTED,
            Self::BadChannel => codes::PWM_BAD_CHANNEL,
            Self::BadResolution => codes::PWM_BAD_RESOLUTION,
            Self::DutyOutOfRange => codes::PWM_DUTY_RANGE,
            Self::Gpio(e) => e.code(),
        }
    }
}

impl fmt::Display for PwmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelsExhausted => write!(f, "no free PWM channel"),
            Self::BadChannel => write!(f, "invalid PWM channel"),
            Self::BadResolution => write!(f, "resolution must be 1-16 bits"),
            Self::DutyOutOfRange => write!(f, "duty exceeds resolution"),
            Self::Gpio(e) => write!(f, "pwm gpio: {e}"),
        }
    }
}

impl From<GpioError> for PwmError {
    fn from(e: GpioError) -> Self {
        Self::Gpio(e)
    }
}

/// Actuator driver / manager errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorError {
    /// Actuator is emergency-latched; commands rejected until cleared.
    EmergencyLatched,
    /// System is in the outputs-disabled recovery step.
    OutputsDisabled,
    /// Pump runtime protection refused the activation.
    ProtectionRefusal,
    /// No registered actuator on that pin.
    NotConfigured,
    /// Registry has no free slot.
    RegistryFull,
    /// Command verb outside the known set.
    UnknownCommand,
    /// Command value outside its permitted range.
    ValueOutOfRange,
    Gpio(GpioError),
    Pwm(PwmError),
}

impl ActuatorError {
    pub const fn code(self) -> u16 {
        match self {
            Self::EmergencyLatched => codes::EMERGENCY_ACTIVE,
            Self::OutputsDisabled => codes::OUTPUTS_DISABLED,
            Self::ProtectionRefusal => codes::RUNTIME_PROTECTION_REFUSAL,
            Self::NotConfigured => codes::CONFIG_VALIDATION_FAILED,
            Self::RegistryFull => codes::REGISTRY_FULL,
            Self::UnknownCommand => codes::UNKNOWN_COMMAND,
            Self::ValueOutOfRange => codes::CONFIG_VALUE_RANGE,
            Self::Gpio(e) => e.code(),
            Self::Pwm(e) => e.code(),
        }
    }
}

impl fmt::Display for ActuatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmergencyLatched => write!(f, "emergency stop active"),
            Self::OutputsDisabled => write!(f, "outputs disabled, resume required"),
            Self::ProtectionRefusal => write!(f, "runtime protection refused activation"),
            Self::NotConfigured => write!(f, "no actuator on pin"),
            Self::RegistryFull => write!(f, "actuator registry full"),
            Self::UnknownCommand => write!(f, "unknown command verb"),
            Self::ValueOutOfRange => write!(f, "value out of range"),
            Self::Gpio(e) => write!(f, "gpio: {e}"),
            Self::Pwm(e) => write!(f, "pwm: {e}"),
        }
    }
}

impl From<GpioError> for ActuatorError {
    fn from(e: GpioError) -> Self {
        Self::Gpio(e)
    }
}

impl From<PwmError> for ActuatorError {
    fn from(e: PwmError) -> Self {
        Self::Pwm(e)
    }
}

/// Sensor registry errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorError {
    /// Pin already held by an actuator (or bus conflict).
    Conflict(GpioError),
    /// Registry has no free slot.
    RegistryFull,
    /// `sensor_type` outside the supported set.
    UnknownKind,
}

impl SensorError {
    pub const fn code(self) -> u16 {
        match self {
            Self::Conflict(e) => e.code(),
            Self::RegistryFull => codes::REGISTRY_FULL,
            Self::UnknownKind => codes::CONFIG_UNKNOWN_KIND,
        }
    }
}

impl fmt::Display for SensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict(e) => write!(f, "pin conflict: {e}"),
            Self::RegistryFull => write!(f, "sensor registry full"),
            Self::UnknownKind => write!(f, "unknown sensor type"),
        }
    }
}

impl From<GpioError> for SensorError {
    fn from(e: GpioError) -> Self {
        Self::Conflict(e)
    }
}

/// Persistent store errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    NotFound,
    Full,
    IoFailed,
    /// Stored blob failed to decode.
    Corrupted,
}

impl StoreError {
    pub const fn code(self) -> u16 {
        match self {
            Self::NotFound | Self::Corrupted => codes::STORE_READ_FAILED,
            Self::Full | Self::IoFailed => codes::STORE_WRITE_FAILED,
        }
    }
}

impl fmt::Display for StoreError {
    fmt_display_match! {
        Self::NotFound => "key not found",
        Self::Full => "store full",
        Self::IoFailed => "store I/O failed",
        Self::Corrupted => "stored blob corrupted",
    }
}

/// Broker / transport errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    ConnectFailed,
    NotConnected,
    SubscribeFailed,
    PublishFailed,
}

impl NetError {
    pub const fn code(self) -> u16 {
        match self {
            Self::ConnectFailed => codes::BROKER_CONNECT_FAILED,
            Self::NotConnected | Self::PublishFailed => codes::PUBLISH_FAILED,
            Self::SubscribeFailed => codes::SUBSCRIBE_FAILED,
        }
    }
}

impl fmt::Display for NetError {
    fmt_display_match! {
        Self::ConnectFailed => "broker connect failed",
        Self::NotConnected => "not connected",
        Self::SubscribeFailed => "subscribe failed",
        Self::PublishFailed => "publish failed",
    }
}

// ---------------------------------------------------------------------------
// Crate-wide error
// ---------------------------------------------------------------------------

/// Every fallible operation in the firmware funnels into this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    Gpio(GpioError),
    Bus(BusError),
    OneWire(OneWireError),
    Pwm(PwmError),
    Actuator(ActuatorError),
    Store(StoreError),
    Net(NetError),
}

impl Error {
    pub const fn code(self) -> u16 {
        match self {
            Self::Gpio(e) => e.code(),
            Self::Bus(e) => e.code(),
            Self::OneWire(e) => e.code(),
            Self::Pwm(e) => e.code(),
            Self::Actuator(e) => e.code(),
            Self::Store(e) => e.code(),
            Self::Net(e) => e.code(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpio(e) => write!(f, "gpio: {e}"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::OneWire(e) => write!(f, "onewire: {e}"),
            Self::Pwm(e) => write!(f, "pwm: {e}"),
            Self::Actuator(e) => write!(f, "actuator: {e}"),
            Self::Store(e) => write!(f, "store: {e}"),
            Self::Net(e) => write!(f, "net: {e}"),
        }
    }
}

macro_rules! impl_from_error {
    ($($variant:ident($ty:ty)),* $(,)?) => {
        $(impl From<$ty> for Error {
            fn from(e: $ty) -> Self {
                Self::$variant(e)
            }
        })*
    };
}

impl_from_error!(
    Gpio(GpioError),
    Bus(BusError),
    OneWire(OneWireError),
    Pwm(PwmError),
    Actuator(ActuatorError),
    Store(StoreError),
    Net(NetError),
);

/// Firmware-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

// ---------------------------------------------------------------------------
// Error tracker
// ---------------------------------------------------------------------------

/// Bound on a tracked message.
pub const MESSAGE_CAP: usize = 96;
/// Ring capacity; 64 leaves headroom for error bursts during recovery.
pub const TRACKER_CAP: usize = 64;

/// One structured error occurrence. Duplicates (same code) compress
/// into a single entry with a bumped count.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: u16,
    pub severity: Severity,
    pub message: heapless::String<MESSAGE_CAP>,
    pub timestamp_ms: u64,
    pub count: u32,
    /// Monotonic insertion order, used for age-based eviction.
    #[serde(skip)]
    seq: u64,
    /// Whether this event has been offered to the messaging client.
    #[serde(skip)]
    offered: bool,
}

/// Fixed-capacity structured error history.
///
/// Single-threaded by construction (spec §5), so no lock. Critical
/// entries are pinned: they are never evicted until they have been
/// offered to the messaging client at least once.
pub struct ErrorTracker {
    slots: [Option<ErrorEvent>; TRACKER_CAP],
    next_seq: u64,
    /// Events dropped because every slot held an unoffered critical.
    dropped: u32,
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Record an occurrence. Duplicate codes compress into the existing
    /// entry; a previously offered critical that recurs becomes
    /// unoffered again so the new occurrence is surfaced.
    pub fn record(&mut self, code: u16, severity: Severity, message: &str, now_ms: u64) {
        if let Some(event) = self
            .slots
            .iter_mut()
            .flatten()
            .find(|e| e.code == code && e.severity == severity)
        {
            event.count = event.count.saturating_add(1);
            event.timestamp_ms = now_ms;
            if severity == Severity::Critical {
                event.offered = false;
            }
            return;
        }

        let mut msg = heapless::String::new();
        let _ = msg.push_str(&message[..message.len().min(MESSAGE_CAP - 1)]);
        let event = ErrorEvent {
            code,
            severity,
            message: msg,
            timestamp_ms: now_ms,
            count: 1,
            seq: self.next_seq,
            offered: false,
        };
        self.next_seq += 1;

        if let Some(slot) = self.slots.iter_mut().find(|s| s.is_none()) {
            *slot = Some(event);
            return;
        }

        // Full: evict the oldest entry that is not a pinned critical.
        let victim = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                s.as_ref()
                    .is_some_and(|e| e.severity != Severity::Critical || e.offered)
            })
            .min_by_key(|(_, s)| s.as_ref().map_or(u64::MAX, |e| e.seq))
            .map(|(i, _)| i);

        match victim {
            Some(i) => self.slots[i] = Some(event),
            None if severity == Severity::Critical => {
                // Every slot holds an unoffered critical; a fresh critical
                // still displaces the oldest of them.
                if let Some(i) = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.as_ref().map_or(u64::MAX, |e| e.seq))
                    .map(|(i, _)| i)
                {
                    self.slots[i] = Some(event);
                }
            }
            None => self.dropped = self.dropped.saturating_add(1),
        }
    }

    /// Shorthand: record a crate error with a context prefix.
    pub fn record_error(&mut self, err: Error, severity: Severity, context: &str, now_ms: u64) {
        let mut msg = heapless::String::<MESSAGE_CAP>::new();
        let _ = core::fmt::Write::write_fmt(&mut msg, format_args!("{context}: {err}"));
        self.record(err.code(), severity, msg.as_str(), now_ms);
    }

    /// Offer every not-yet-offered event to `f`, marking it offered.
    /// Offered criticals become evictable.
    pub fn drain_unoffered(&mut self, mut f: impl FnMut(&ErrorEvent)) {
        // Oldest first, so the controller sees history in order.
        let mut order: heapless::Vec<(u64, usize), TRACKER_CAP> = heapless::Vec::new();
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(e) = slot {
                if !e.offered {
                    let _ = order.push((e.seq, i));
                }
            }
        }
        order.sort_unstable();
        for (_, i) in order {
            if let Some(e) = self.slots[i].as_mut() {
                f(e);
                e.offered = true;
            }
        }
    }

    /// Total live entries.
    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of live entries at `severity`.
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|e| e.severity == severity)
            .count()
    }

    /// Events dropped because the ring was pinned full.
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    /// The `n` most recent entries, newest first.
    pub fn recent(&self, n: usize) -> heapless::Vec<ErrorEvent, TRACKER_CAP> {
        let mut all: heapless::Vec<ErrorEvent, TRACKER_CAP> =
            self.slots.iter().flatten().cloned().collect();
        all.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
        all.truncate(n);
        all
    }
}
