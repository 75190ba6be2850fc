//! Low-level hardware access: GPIO, LEDC PWM, delays, clock, heap.
//!
//! Every function is cfg-dualed exactly once:
//!
//! - **`target_os = "espidf"`**: raw ESP-IDF sys calls.
//! - **all other targets**: an in-memory simulation holding pin modes,
//!   output levels and injected input levels, plus an append-only journal
//!   of pin operations so tests can assert on ordering (for example that
//!   an output is driven low before its mode reverts to pull-up input).
//!
//! Higher layers never call ESP-IDF directly; the GPIO manager, PWM
//! controller and bus drivers all come through here.

#[cfg(target_os = "espidf")]
use esp_idf_svc::sys::*;

// ---------------------------------------------------------------------------
// Pin operations (journaled by the simulation)
// ---------------------------------------------------------------------------

/// One hardware-touching operation, as recorded by the host simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOp {
    ConfigOutput(u8),
    ConfigInput(u8),
    ConfigInputPullup(u8),
    Write { pin: u8, high: bool },
    LedcAttach { channel: u8, pin: u8 },
    LedcDetach { channel: u8 },
    LedcDuty { channel: u8, raw: u32 },
}

// ---------------------------------------------------------------------------
// GPIO
// ---------------------------------------------------------------------------

/// Configure `pin` as a push-pull output.
pub fn gpio_config_output(pin: u8) {
    #[cfg(target_os = "espidf")]
    // SAFETY: single-threaded main-task access; pin validity is enforced
    // by the GPIO manager before any call lands here.
    unsafe {
        gpio_set_direction(pin as i32, gpio_mode_t_GPIO_MODE_OUTPUT);
        gpio_set_pull_mode(pin as i32, gpio_pull_mode_t_GPIO_FLOATING);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.modes[pin as usize] = sim::PinMode::Output;
        s.journal.push(PinOp::ConfigOutput(pin));
    });
}

/// Configure `pin` as a floating digital input.
pub fn gpio_config_input(pin: u8) {
    #[cfg(target_os = "espidf")]
    unsafe {
        gpio_set_direction(pin as i32, gpio_mode_t_GPIO_MODE_INPUT);
        gpio_set_pull_mode(pin as i32, gpio_pull_mode_t_GPIO_FLOATING);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.modes[pin as usize] = sim::PinMode::Input;
        s.journal.push(PinOp::ConfigInput(pin));
    });
}

/// Configure `pin` as an input with the internal pull-up enabled.
/// This is the hardware-safe idle state for every releasable pin.
pub fn gpio_config_input_pullup(pin: u8) {
    #[cfg(target_os = "espidf")]
    unsafe {
        gpio_set_direction(pin as i32, gpio_mode_t_GPIO_MODE_INPUT);
        gpio_set_pull_mode(pin as i32, gpio_pull_mode_t_GPIO_PULLUP_ONLY);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.modes[pin as usize] = sim::PinMode::InputPullup;
        s.journal.push(PinOp::ConfigInputPullup(pin));
    });
}

/// Drive an output pin high or low.
pub fn gpio_write(pin: u8, high: bool) {
    #[cfg(target_os = "espidf")]
    unsafe {
        gpio_set_level(pin as i32, u32::from(high));
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.levels[pin as usize] = high;
        s.journal.push(PinOp::Write { pin, high });
    });
}

/// Read the current level of a pin.
///
/// For a simulated pull-up input the injected level defaults to high,
/// matching an unloaded line.
pub fn gpio_read(pin: u8) -> bool {
    #[cfg(target_os = "espidf")]
    // SAFETY: level reads are side-effect free.
    unsafe {
        gpio_get_level(pin as i32) != 0
    }

    #[cfg(not(target_os = "espidf"))]
    sim::query(|s| match s.modes[pin as usize] {
        sim::PinMode::Output => s.levels[pin as usize],
        _ => s.input_levels[pin as usize],
    })
}

// ---------------------------------------------------------------------------
// LEDC PWM
// ---------------------------------------------------------------------------

/// Bind a LEDC channel to a pin at the given frequency/resolution.
pub fn ledc_attach(channel: u8, pin: u8, freq_hz: u32, res_bits: u8) {
    #[cfg(target_os = "espidf")]
    unsafe {
        let timer_cfg = ledc_timer_config_t {
            speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
            duty_resolution: res_bits as u32,
            timer_num: (channel as u32) % 4,
            freq_hz,
            clk_cfg: ledc_clk_cfg_t_LEDC_AUTO_CLK,
            ..Default::default()
        };
        ledc_timer_config(&timer_cfg);

        let ch_cfg = ledc_channel_config_t {
            gpio_num: pin as i32,
            speed_mode: ledc_mode_t_LEDC_LOW_SPEED_MODE,
            channel: channel as u32,
            timer_sel: (channel as u32) % 4,
            duty: 0,
            hpoint: 0,
            ..Default::default()
        };
        ledc_channel_config(&ch_cfg);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.duties[channel as usize] = 0;
        let _ = (freq_hz, res_bits);
        s.journal.push(PinOp::LedcAttach { channel, pin });
    });
}

/// Unbind a LEDC channel (output idles low).
pub fn ledc_detach(channel: u8) {
    #[cfg(target_os = "espidf")]
    unsafe {
        ledc_stop(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel as u32, 0);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.duties[channel as usize] = 0;
        s.journal.push(PinOp::LedcDetach { channel });
    });
}

/// Reconfigure a channel's base frequency.
pub fn ledc_set_frequency(channel: u8, freq_hz: u32) {
    #[cfg(target_os = "espidf")]
    unsafe {
        ledc_set_freq(
            ledc_mode_t_LEDC_LOW_SPEED_MODE,
            (channel as u32) % 4,
            freq_hz,
        );
    }

    #[cfg(not(target_os = "espidf"))]
    {
        let _ = (channel, freq_hz);
    }
}

/// Write a raw duty value to a channel.
pub fn ledc_set_duty(channel: u8, raw: u32) {
    #[cfg(target_os = "espidf")]
    unsafe {
        esp_idf_svc::sys::ledc_set_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel as u32, raw);
        esp_idf_svc::sys::ledc_update_duty(ledc_mode_t_LEDC_LOW_SPEED_MODE, channel as u32);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| {
        s.duties[channel as usize] = raw;
        s.journal.push(PinOp::LedcDuty { channel, raw });
    });
}

// ---------------------------------------------------------------------------
// ADC
// ---------------------------------------------------------------------------

/// Raw 12-bit ADC read of an analog-capable pin. Returns 0 on a
/// conversion error; callers grade quality from context.
pub fn adc_read(pin: u8) -> u16 {
    #[cfg(target_os = "espidf")]
    // SAFETY: one-shot ADC reads from the single main task.
    unsafe {
        let mut raw: i32 = 0;
        let rc = adc1_get_raw(adc_pin_to_channel(pin));
        if rc >= 0 {
            raw = rc;
        }
        raw.max(0) as u16
    }

    #[cfg(not(target_os = "espidf"))]
    sim::query(|s| s.adc[pin as usize])
}

#[cfg(target_os = "espidf")]
fn adc_pin_to_channel(pin: u8) -> adc1_channel_t {
    // ADC1 channel map for this chip family (GPIO32-39 → CH4-CH3).
    match pin {
        32 => adc1_channel_t_ADC1_CHANNEL_4,
        33 => adc1_channel_t_ADC1_CHANNEL_5,
        34 => adc1_channel_t_ADC1_CHANNEL_6,
        35 => adc1_channel_t_ADC1_CHANNEL_7,
        36 => adc1_channel_t_ADC1_CHANNEL_0,
        39 => adc1_channel_t_ADC1_CHANNEL_3,
        _ => adc1_channel_t_ADC1_CHANNEL_0,
    }
}

// ---------------------------------------------------------------------------
// Time, delays, heap
// ---------------------------------------------------------------------------

/// Milliseconds since boot (monotonic).
pub fn now_ms() -> u64 {
    #[cfg(target_os = "espidf")]
    // SAFETY: esp_timer_get_time is safe to call from any task.
    unsafe {
        (esp_timer_get_time() / 1000) as u64
    }

    #[cfg(not(target_os = "espidf"))]
    sim::query(|s| s.now_ms)
}

/// Busy-wait for `us` microseconds. Used only inside bounded bus
/// recovery sequences.
pub fn delay_us(us: u32) {
    #[cfg(target_os = "espidf")]
    unsafe {
        ets_delay_us(us);
    }

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| s.now_ms += u64::from(us) / 1000);
}

/// Sleep for `ms` milliseconds. Permitted in-line only for the one-wire
/// conversion wait and main-loop pacing.
pub fn delay_ms(ms: u32) {
    #[cfg(target_os = "espidf")]
    std::thread::sleep(std::time::Duration::from_millis(u64::from(ms)));

    #[cfg(not(target_os = "espidf"))]
    sim::apply(|s| s.now_ms += u64::from(ms));
}

/// Bytes of free heap, for heartbeat/diagnostics.
pub fn free_heap_bytes() -> u32 {
    #[cfg(target_os = "espidf")]
    unsafe {
        esp_get_free_heap_size()
    }

    #[cfg(not(target_os = "espidf"))]
    {
        128 * 1024
    }
}

/// Minimum free heap observed since boot.
pub fn min_free_heap_bytes() -> u32 {
    #[cfg(target_os = "espidf")]
    unsafe {
        esp_get_minimum_free_heap_size()
    }

    #[cfg(not(target_os = "espidf"))]
    {
        96 * 1024
    }
}

/// Reboot the chip. On the host this panics: a reboot request in a test
/// is a test failure.
pub fn restart() -> ! {
    #[cfg(target_os = "espidf")]
    {
        unsafe { esp_restart() };
        #[allow(unreachable_code)]
        {
            unreachable!()
        }
    }

    #[cfg(not(target_os = "espidf"))]
    panic!("hal: restart requested on host");
}

// ---------------------------------------------------------------------------
// Host simulation
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "espidf"))]
pub mod sim {
    //! In-memory pin table + operation journal for host tests.
    //!
    //! Tests that touch simulated hardware must hold the guard returned
    //! by [`lock`] for their whole body, then call [`reset`]; the guard
    //! serialises tests that would otherwise race on the global table.

    use super::PinOp;
    use crate::board;
    use std::sync::{Mutex, MutexGuard, PoisonError};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PinMode {
        InputPullup,
        Input,
        Output,
    }

    pub struct SimState {
        pub modes: [PinMode; board::GPIO_COUNT],
        pub levels: [bool; board::GPIO_COUNT],
        pub input_levels: [bool; board::GPIO_COUNT],
        pub adc: [u16; board::GPIO_COUNT],
        pub duties: [u32; 16],
        pub journal: Vec<PinOp>,
        pub now_ms: u64,
    }

    impl SimState {
        const fn new() -> Self {
            Self {
                modes: [PinMode::InputPullup; board::GPIO_COUNT],
                levels: [false; board::GPIO_COUNT],
                // Pull-ups read high when nothing drives the line.
                input_levels: [true; board::GPIO_COUNT],
                adc: [0; board::GPIO_COUNT],
                duties: [0; 16],
                journal: Vec::new(),
                now_ms: 0,
            }
        }
    }

    static SIM: Mutex<SimState> = Mutex::new(SimState::new());
    static TEST_GUARD: Mutex<()> = Mutex::new(());

    /// Acquire exclusive use of the simulated hardware for one test.
    pub fn lock() -> MutexGuard<'static, ()> {
        TEST_GUARD.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reset the pin table, journal and clock to power-on state.
    pub fn reset() {
        apply(|s| *s = SimState::new());
    }

    /// Inject the level an input pin will read.
    pub fn set_input_level(pin: u8, high: bool) {
        apply(|s| s.input_levels[pin as usize] = high);
    }

    /// Advance the simulated monotonic clock.
    pub fn advance_ms(ms: u64) {
        apply(|s| s.now_ms += ms);
    }

    /// Inject a raw ADC reading for an analog pin.
    pub fn set_adc(pin: u8, raw: u16) {
        apply(|s| s.adc[pin as usize] = raw);
    }

    /// Snapshot and clear the operation journal.
    pub fn take_journal() -> Vec<PinOp> {
        apply_ret(|s| core::mem::take(&mut s.journal))
    }

    /// Current mode of a pin.
    pub fn pin_mode(pin: u8) -> PinMode {
        query(|s| s.modes[pin as usize])
    }

    /// Last driven output level of a pin.
    pub fn output_level(pin: u8) -> bool {
        query(|s| s.levels[pin as usize])
    }

    /// Current raw duty of a simulated LEDC channel.
    pub fn ledc_duty(channel: u8) -> u32 {
        query(|s| s.duties[channel as usize])
    }

    pub(super) fn apply(f: impl FnOnce(&mut SimState)) {
        let mut s = SIM.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut s);
    }

    fn apply_ret<T>(f: impl FnOnce(&mut SimState) -> T) -> T {
        let mut s = SIM.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut s)
    }

    pub(super) fn query<T>(f: impl FnOnce(&SimState) -> T) -> T {
        let s = SIM.lock().unwrap_or_else(PoisonError::into_inner);
        f(&s)
    }
}
