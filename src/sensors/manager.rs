//! Sensor registry: periodic reads, quality grading, batching.
//!
//! Each sensor ticks at its own interval. Reads that exceed the main
//! loop's per-iteration budget (the 750 ms one-wire conversion) run as
//! a two-phase non-blocking state machine — start the conversion on one
//! tick, collect the scratchpad once the latency has elapsed.

use log::{info, warn};

use crate::board;
use crate::bus::i2c::{I2cEngine, SharedBus};
use crate::bus::onewire::{OneWireBus, OneWireIo, CONVERT_LATENCY_MS};
use crate::config::packets::{BatchPayload, SamplePayload};
use crate::config::store::{self, StoragePort};
use crate::error::{ErrorTracker, GpioError, OneWireError, SensorError};
use crate::gpio::{GpioManager, Owner, PinMode};
use crate::hal;
use crate::net::{Publish, QoS};
use crate::topics::TopicBuilder;

use super::{Quality, SensorConfig, SensorKind};

/// Last values older than this many intervals grade as stale.
const STALE_INTERVALS: u64 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Idle,
    /// One-wire conversion in flight; scratchpad ready at the deadline.
    Converting { until_ms: u64 },
}

struct SensorSlot {
    cfg: SensorConfig,
    state: ReadState,
    next_due_ms: u64,
    last: Option<(i32, u64)>,
    fail_streak: u8,
    /// The in-flight read already failed once and was restarted.
    retried: bool,
}

/// Registry of configured sensors, keyed by pin.
pub struct SensorManager {
    slots: [Option<SensorSlot>; board::MAX_SENSORS],
    batch_interval_ms: u64,
    next_batch_ms: u64,
}

impl Default for SensorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorManager {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
            batch_interval_ms: 60_000,
            next_batch_ms: 0,
        }
    }

    pub fn set_batch_interval_ms(&mut self, interval_ms: u64) {
        self.batch_interval_ms = interval_ms.max(super::MIN_INTERVAL_MS);
    }

    // ── Registry ──────────────────────────────────────────────

    /// Apply a validated sensor configuration. Digital/analog sensors
    /// claim their pin; bus-addressed sensors ride the bus's system
    /// claim.
    pub fn configure<W: OneWireIo>(
        &mut self,
        cfg: SensorConfig,
        gpio: &mut GpioManager,
        onewire: &mut OneWireBus<W>,
        actuator_owns_pin: bool,
        store: &mut dyn StoragePort,
        now_ms: u64,
    ) -> Result<(), SensorError> {
        if actuator_owns_pin {
            return Err(SensorError::Conflict(GpioError::Conflict));
        }

        // Reconfiguration on the same identity replaces the slot.
        if let Some(index) = self.index_of(cfg.pin, cfg.rom) {
            self.release_slot_pins(index, gpio);
            self.slots[index] = None;
        }

        match cfg.kind {
            SensorKind::Ds18b20 => {
                // The one-wire bus owns the data pin; begin() is
                // idempotent for the already-bound pin.
                onewire
                    .begin(cfg.pin, gpio)
                    .map_err(|_| SensorError::Conflict(GpioError::Conflict))?;
            }
            SensorKind::Digital | SensorKind::Analog => {
                gpio.request_pin(cfg.pin, Owner::Sensor, cfg.name.as_str())?;
                let mode = if cfg.kind == SensorKind::Digital {
                    PinMode::SafeInput
                } else {
                    PinMode::Input
                };
                if let Err(e) = gpio.set_mode(cfg.pin, mode) {
                    let _ = gpio.release_pin(cfg.pin);
                    return Err(e.into());
                }
            }
            SensorKind::I2c { .. } => {
                // Shared-bus device: the bus pins already carry the
                // system claim; cfg.pin is identity only.
            }
        }

        if let Some(tag) = cfg.subzone.clone() {
            let _ = gpio.assign_subzone(cfg.pin, &tag);
        }

        let index = match self.slots.iter().position(Option::is_none) {
            Some(i) => i,
            None => {
                self.release_pin_for(&cfg, gpio);
                return Err(SensorError::RegistryFull);
            }
        };

        info!(
            "sensors: pin {} ({}) configured, interval {} ms",
            cfg.pin, cfg.type_name, cfg.interval_ms
        );
        self.slots[index] = Some(SensorSlot {
            cfg,
            state: ReadState::Idle,
            next_due_ms: now_ms,
            last: None,
            fail_streak: 0,
            retried: false,
        });

        self.persist(store);
        Ok(())
    }

    /// Remove the sensor identified by (pin, rom). Idempotent.
    pub fn remove(
        &mut self,
        pin: u8,
        rom: Option<u64>,
        gpio: &mut GpioManager,
        store: &mut dyn StoragePort,
    ) {
        if let Some(index) = self.index_of(pin, rom) {
            self.release_slot_pins(index, gpio);
            self.slots[index] = None;
            info!("sensors: pin {} removed", pin);
        }
        self.persist(store);
    }

    /// Full-replace the persisted sensor set.
    pub fn persist(&self, store: &mut dyn StoragePort) {
        let configs: heapless::Vec<SensorConfig, { board::MAX_SENSORS }> = self
            .slots
            .iter()
            .flatten()
            .map(|s| s.cfg.clone())
            .collect();
        if let Err(e) = store::save_blob(store, store::NS_SENSORS, &configs) {
            warn!("sensors: persist failed: {}", e);
        }
    }

    // ── Queries ───────────────────────────────────────────────

    /// Consulted by the actuator manager for GPIO ownership defense.
    pub fn has_sensor_on_gpio(&self, pin: u8) -> bool {
        self.slots
            .iter()
            .flatten()
            .any(|s| s.cfg.pin == pin)
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    // ── Periodic ──────────────────────────────────────────────

    /// Service due sensors and the batch cadence. Never blocks longer
    /// than one bus transaction.
    pub fn tick<E: I2cEngine, W: OneWireIo>(
        &mut self,
        now_ms: u64,
        gpio: &GpioManager,
        i2c: &mut SharedBus<E>,
        onewire: &mut OneWireBus<W>,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
        tracker: &mut ErrorTracker,
    ) {
        for index in 0..self.slots.len() {
            let Some(slot) = self.slots[index].as_mut() else {
                continue;
            };

            match slot.state {
                ReadState::Idle => {
                    if now_ms < slot.next_due_ms {
                        continue;
                    }
                    if slot.cfg.kind.uses_onewire() {
                        Self::start_onewire_read(slot, onewire, now_ms);
                    } else {
                        let outcome = Self::read_immediate(slot, gpio, i2c, tracker, now_ms);
                        Self::finish_read(slot, outcome, now_ms, publish, topics);
                    }
                }
                ReadState::Converting { until_ms } => {
                    if now_ms < until_ms {
                        continue;
                    }
                    let rom = slot.cfg.rom.unwrap_or_default();
                    match onewire.read_scratchpad(rom) {
                        Ok(raw) => {
                            slot.state = ReadState::Idle;
                            Self::finish_read(
                                slot,
                                Some(i32::from(raw)),
                                now_ms,
                                publish,
                                topics,
                            );
                        }
                        Err(OneWireError::CrcMismatch) if !slot.retried => {
                            // One silent retry: restart the conversion.
                            slot.retried = true;
                            Self::start_onewire_read(slot, onewire, now_ms);
                        }
                        Err(e) => {
                            warn!("sensors: pin {} read failed: {}", slot.cfg.pin, e);
                            tracker.record(
                                e.code(),
                                crate::error::Severity::Warning,
                                "sensor read failed",
                                now_ms,
                            );
                            slot.state = ReadState::Idle;
                            Self::finish_read(slot, None, now_ms, publish, topics);
                        }
                    }
                }
            }
        }

        if now_ms >= self.next_batch_ms {
            self.emit_batch(now_ms, publish, topics);
            self.next_batch_ms = now_ms + self.batch_interval_ms;
        }
    }

    // ── Internal ──────────────────────────────────────────────

    fn start_onewire_read<W: OneWireIo>(
        slot: &mut SensorSlot,
        onewire: &mut OneWireBus<W>,
        now_ms: u64,
    ) {
        let rom = slot.cfg.rom.unwrap_or_default();
        match onewire.start_conversion(rom) {
            Ok(()) => {
                slot.state = ReadState::Converting {
                    until_ms: now_ms + CONVERT_LATENCY_MS,
                };
            }
            Err(e) => {
                warn!("sensors: pin {} conversion start failed: {}", slot.cfg.pin, e);
                slot.state = ReadState::Idle;
                slot.fail_streak = slot.fail_streak.saturating_add(1);
                slot.next_due_ms = now_ms + slot.cfg.interval_ms;
                slot.retried = false;
            }
        }
    }

    /// Synchronous read for bus/digital/analog kinds. `None` = failed.
    fn read_immediate<E: I2cEngine>(
        slot: &mut SensorSlot,
        gpio: &GpioManager,
        i2c: &mut SharedBus<E>,
        tracker: &mut ErrorTracker,
        now_ms: u64,
    ) -> Option<i32> {
        match slot.cfg.kind {
            SensorKind::I2c { addr, reg, len } => {
                let mut buf = [0u8; 4];
                let n = usize::from(len).min(buf.len());
                match i2c.read_raw(addr, reg, &mut buf[..n], tracker, now_ms) {
                    Ok(()) => {
                        // Big-endian register pair, sign-extended.
                        let raw = i16::from_be_bytes([buf[0], buf[1]]);
                        Some(i32::from(raw))
                    }
                    Err(e) => {
                        tracker.record(
                            e.code(),
                            crate::error::Severity::Warning,
                            "bus sensor read failed",
                            now_ms,
                        );
                        None
                    }
                }
            }
            SensorKind::Digital => Some(i32::from(gpio.read(slot.cfg.pin))),
            SensorKind::Analog => Some(i32::from(hal::adc_read(slot.cfg.pin))),
            SensorKind::Ds18b20 => None, // handled by the two-phase path
        }
    }

    /// Grade, record and publish the outcome of one read attempt, then
    /// schedule the next one.
    fn finish_read(
        slot: &mut SensorSlot,
        outcome: Option<i32>,
        now_ms: u64,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
    ) {
        let sample = match outcome {
            Some(raw) => {
                let quality = if slot.retried {
                    Quality::Fair
                } else if slot.fail_streak > 0 {
                    Quality::Good
                } else {
                    Quality::Excellent
                };
                slot.fail_streak = 0;
                slot.last = Some((raw, now_ms));
                Some((raw, quality, now_ms))
            }
            None => {
                slot.fail_streak = slot.fail_streak.saturating_add(1);
                // Surface the last known value while it is still
                // plausibly current; silence once it goes cold.
                slot.last.and_then(|(raw, ts)| {
                    let age = now_ms.saturating_sub(ts);
                    if age <= STALE_INTERVALS * slot.cfg.interval_ms {
                        let quality = if slot.fail_streak == 1 {
                            Quality::Poor
                        } else {
                            Quality::Stale
                        };
                        Some((raw, quality, ts))
                    } else {
                        None
                    }
                })
            }
        };
        slot.retried = false;
        slot.next_due_ms = now_ms + slot.cfg.interval_ms;

        if let Some((raw, quality, ts)) = sample {
            let payload = build_sample(&slot.cfg, raw, quality, ts);
            crate::actuators::manager::emit_json(
                topics.sensor_data(slot.cfg.pin).as_str(),
                &payload,
                QoS::AtLeastOnce,
                false,
                publish,
            );
        }
    }

    fn emit_batch(&self, now_ms: u64, publish: &mut impl Publish, topics: &TopicBuilder) {
        let samples: Vec<SamplePayload> = self
            .slots
            .iter()
            .flatten()
            .filter_map(|slot| {
                slot.last.map(|(raw, ts)| {
                    let age = now_ms.saturating_sub(ts);
                    let quality = if age > STALE_INTERVALS * slot.cfg.interval_ms {
                        Quality::Stale
                    } else {
                        Quality::Good
                    };
                    build_sample(&slot.cfg, raw, quality, ts)
                })
            })
            .collect();

        if samples.is_empty() {
            return;
        }
        let batch = BatchPayload {
            samples,
            timestamp_ms: now_ms,
        };
        crate::actuators::manager::emit_json(
            topics.sensor_batch().as_str(),
            &batch,
            QoS::AtLeastOnce,
            false,
            publish,
        );
    }

    fn index_of(&self, pin: u8, rom: Option<u64>) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|slot| slot.cfg.pin == pin && slot.cfg.rom == rom)
        })
    }

    fn release_slot_pins(&mut self, index: usize, gpio: &mut GpioManager) {
        if let Some(slot) = self.slots[index].as_ref() {
            let cfg = slot.cfg.clone();
            self.release_pin_for(&cfg, gpio);
        }
    }

    fn release_pin_for(&self, cfg: &SensorConfig, gpio: &mut GpioManager) {
        if matches!(cfg.kind, SensorKind::Digital | SensorKind::Analog) {
            let _ = gpio.release_pin(cfg.pin);
        }
    }
}

fn build_sample(cfg: &SensorConfig, raw: i32, quality: Quality, ts: u64) -> SamplePayload {
    let value = if cfg.raw_only {
        None
    } else {
        let cal = cfg.calibration.unwrap_or(crate::config::packets::Calibration {
            offset: 0.0,
            scale: 1.0,
        });
        Some(raw as f32 * cal.scale + cal.offset)
    };
    SamplePayload {
        gpio: cfg.pin,
        sensor_type: cfg.type_name.clone(),
        sensor_name: cfg.name.clone(),
        raw,
        value,
        quality: quality.as_str(),
        timestamp_ms: ts,
        subzone_id: cfg.subzone.clone(),
    }
}
