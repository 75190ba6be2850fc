//! Actuator registry: fixed-capacity slot table keyed by pin, command
//! dispatch, alert/response emission.
//!
//! Every command produces exactly one response on the pin's response
//! topic, echoing the correlation id. Runtime-protection trips and
//! auto-off deadlines are evaluated in [`ActuatorManager::tick`],
//! during the same loop iteration that detects them.

use core::fmt::Write as _;

use log::{info, warn};
use serde::Serialize;

use crate::board;
use crate::config::packets::{AlertPayload, Command, CommandResponse, CommandVerb, MSG_CAP};
use crate::config::store::{self, StoragePort};
use crate::error::{ActuatorError, GpioError};
use crate::net::{Publish, QoS};
use crate::safety::CommandGate;
use crate::topics::TopicBuilder;

use super::{ActuatorConfig, ActuatorDriver, ActuatorStatus, Driver, HwParts};

struct Slot {
    driver: Driver,
    /// Deadline for a command-scheduled auto-off.
    auto_off_at_ms: Option<u64>,
}

/// Registry of configured actuators. Fixed capacity; full-replace
/// persistence on every mutation.
pub struct ActuatorManager {
    slots: [Option<Slot>; board::MAX_ACTUATORS],
}

impl Default for ActuatorManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ActuatorManager {
    pub fn new() -> Self {
        Self {
            slots: core::array::from_fn(|_| None),
        }
    }

    // ── Registry ──────────────────────────────────────────────

    /// Apply a validated configuration. Reconfiguring an occupied pin
    /// tears the old driver down first; a begin() failure frees the
    /// slot and surfaces the error.
    pub fn configure(
        &mut self,
        cfg: ActuatorConfig,
        hw: &mut HwParts<'_>,
        sensor_owns_pin: bool,
        store: &mut dyn StoragePort,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
    ) -> Result<(), ActuatorError> {
        // Defense in depth: the controller should never ask for a pin
        // the sensor set holds, but the node refuses anyway.
        if sensor_owns_pin {
            return Err(ActuatorError::Gpio(GpioError::Conflict));
        }

        let pin = cfg.pin;
        if let Some(index) = self.index_of(pin) {
            // Reconfiguration, not duplication: safe the old driver and
            // release its pins before the new one claims them.
            if let Some(slot) = self.slots[index].as_mut() {
                if slot.driver.config().kind != cfg.kind {
                    info!(
                        "actuators: pin {} kind change {} -> {}",
                        pin,
                        slot.driver.config().kind.as_str(),
                        cfg.kind.as_str()
                    );
                }
                slot.driver.end(hw);
            }
            self.slots[index] = None;
        }

        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(ActuatorError::RegistryFull)?;

        let mut driver = Driver::from_config(cfg);
        if let Err(e) = driver.begin(hw) {
            warn!("actuators: begin failed on pin {}: {}", pin, e);
            return Err(e);
        }

        if let Some(tag) = driver.config().subzone.clone() {
            let _ = hw.gpio.assign_subzone(pin, &tag);
        }

        self.slots[index] = Some(Slot {
            driver,
            auto_off_at_ms: None,
        });

        self.persist(store);
        if let Some(slot) = self.slots[index].as_ref() {
            emit_status(&slot.driver, publish, topics);
        }
        info!("actuators: pin {} configured", pin);
        Ok(())
    }

    /// Remove the actuator on `pin`. Idempotent; the persisted set is
    /// rewritten either way so store and registry never diverge.
    pub fn remove(
        &mut self,
        pin: u8,
        hw: &mut HwParts<'_>,
        store: &mut dyn StoragePort,
    ) -> Result<(), ActuatorError> {
        if let Some(index) = self.index_of(pin) {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.driver.end(hw);
            }
            self.slots[index] = None;
            info!("actuators: pin {} removed", pin);
        }
        self.persist(store);
        Ok(())
    }

    /// Write the full current config set to the store. Always the whole
    /// set, never a delta, so the persisted state is self-consistent.
    pub fn persist(&self, store: &mut dyn StoragePort) {
        let configs: heapless::Vec<ActuatorConfig, { board::MAX_ACTUATORS }> = self
            .slots
            .iter()
            .flatten()
            .map(|s| s.driver.config().clone())
            .collect();
        if let Err(e) = store::save_blob(store, store::NS_ACTUATORS, &configs) {
            warn!("actuators: persist failed: {}", e);
        }
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn has_actuator_on(&self, pin: u8) -> bool {
        self.index_of(pin).is_some()
    }

    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    /// Pins with a configured actuator, for command-topic subscriptions.
    pub fn pins(&self) -> heapless::Vec<u8, { board::MAX_ACTUATORS }> {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.driver.config().pin)
            .collect()
    }

    pub fn status_of(&self, pin: u8) -> Option<ActuatorStatus> {
        let index = self.index_of(pin)?;
        self.slots[index].as_ref().map(|s| s.driver.status())
    }

    pub fn statuses(&self) -> heapless::Vec<ActuatorStatus, { board::MAX_ACTUATORS }> {
        self.slots
            .iter()
            .flatten()
            .map(|s| s.driver.status())
            .collect()
    }

    // ── Control ───────────────────────────────────────────────

    /// Continuous control of one actuator, subject to the system gate.
    pub fn control(
        &mut self,
        pin: u8,
        value: f32,
        gate: CommandGate,
        hw: &mut HwParts<'_>,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        // Conservative: any non-zero level counts as energizing.
        check_gate(gate, value > 0.0)?;
        let slot = self.slot_mut(pin)?;
        slot.driver.set_value(value, now_ms, hw)
    }

    /// Binary control of one actuator, subject to the system gate.
    pub fn control_binary(
        &mut self,
        pin: u8,
        on: bool,
        gate: CommandGate,
        hw: &mut HwParts<'_>,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        check_gate(gate, on)?;
        let slot = self.slot_mut(pin)?;
        if !on {
            slot.auto_off_at_ms = None;
        }
        slot.driver.set_binary(on, now_ms, hw)
    }

    // ── Emergency ─────────────────────────────────────────────

    /// Latch every driver and force safe outputs. Publishes one alert
    /// and one status per actuator.
    pub fn emergency_stop_all(
        &mut self,
        reason: &str,
        hw: &mut HwParts<'_>,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
        now_ms: u64,
    ) {
        for slot in self.slots.iter_mut().flatten() {
            slot.driver.emergency_stop(reason, now_ms, hw);
            slot.auto_off_at_ms = None;
            emit_alert(&slot.driver, "emergency_stop", reason, now_ms, publish, topics);
            emit_status(&slot.driver, publish, topics);
        }
        warn!("actuators: emergency stop all ({})", reason);
    }

    /// Latch a single actuator.
    pub fn emergency_stop_pin(
        &mut self,
        pin: u8,
        reason: &str,
        hw: &mut HwParts<'_>,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        let slot = self.slot_mut(pin)?;
        slot.driver.emergency_stop(reason, now_ms, hw);
        slot.auto_off_at_ms = None;
        emit_alert(&slot.driver, "emergency_stop", reason, now_ms, publish, topics);
        emit_status(&slot.driver, publish, topics);
        Ok(())
    }

    /// Clear every per-driver latch. Outputs stay at their safe level.
    pub fn clear_emergency_all(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.driver.clear_emergency();
        }
        info!("actuators: all emergency latches cleared");
    }

    pub fn clear_emergency_pin(&mut self, pin: u8) -> Result<(), ActuatorError> {
        let slot = self.slot_mut(pin)?;
        slot.driver.clear_emergency();
        Ok(())
    }

    // ── Periodic ──────────────────────────────────────────────

    /// Per-iteration service: runtime-protection trips, auto-off
    /// deadlines, and driver-internal timing (valve motion).
    pub fn tick(
        &mut self,
        now_ms: u64,
        hw: &mut HwParts<'_>,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
    ) {
        for slot in self.slots.iter_mut().flatten() {
            let limits = slot.driver.config().limits;
            let rt = slot.driver.runtime();

            if limits.max_on_ms > 0
                && rt.running
                && rt.started_ms > 0
                && now_ms.saturating_sub(rt.started_ms) > u64::from(limits.max_on_ms)
            {
                slot.driver.emergency_stop("runtime protection", now_ms, hw);
                slot.auto_off_at_ms = None;
                emit_alert(
                    &slot.driver,
                    "runtime_protection",
                    "max continuous runtime exceeded",
                    now_ms,
                    publish,
                    topics,
                );
                emit_status(&slot.driver, publish, topics);
            }

            if let Some(deadline) = slot.auto_off_at_ms {
                if now_ms >= deadline {
                    slot.auto_off_at_ms = None;
                    if slot.driver.set_binary(false, now_ms, hw).is_ok() {
                        emit_status(&slot.driver, publish, topics);
                    }
                }
            }

            if slot.driver.tick(now_ms, hw) {
                emit_status(&slot.driver, publish, topics);
            }
        }
    }

    // ── Command dispatch ──────────────────────────────────────

    /// Execute one inbound command payload for `pin` and publish the
    /// response (and status, on success) in the same iteration.
    pub fn handle_command(
        &mut self,
        pin: u8,
        payload: &[u8],
        gate: CommandGate,
        hw: &mut HwParts<'_>,
        publish: &mut impl Publish,
        topics: &TopicBuilder,
        now_ms: u64,
    ) {
        let cmd: Command = match serde_json::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                let mut bad = Command {
                    command: heapless::String::new(),
                    value: None,
                    duration: None,
                    correlation_id: None,
                };
                let _ = bad.command.push_str("invalid");
                let mut msg = heapless::String::<MSG_CAP>::new();
                let _ = write!(msg, "malformed command: {e}");
                respond(&bad, Err(msg), pin, publish, topics);
                return;
            }
        };

        let result = self.execute(&cmd, pin, gate, hw, now_ms);

        if let Err(ActuatorError::ProtectionRefusal) = &result {
            if let Some(index) = self.index_of(pin) {
                if let Some(slot) = self.slots[index].as_ref() {
                    emit_alert(
                        &slot.driver,
                        "runtime_protection",
                        "activation refused by runtime protection",
                        now_ms,
                        publish,
                        topics,
                    );
                }
            }
        }

        let outcome = match &result {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut msg = heapless::String::<MSG_CAP>::new();
                let _ = write!(msg, "{e}");
                Err(msg)
            }
        };
        respond(&cmd, outcome, pin, publish, topics);

        if result.is_ok() {
            if let Some(status) = self.status_of(pin) {
                emit_json(
                    topics.actuator_status(pin).as_str(),
                    &status,
                    QoS::AtLeastOnce,
                    false,
                    publish,
                );
            }
        }
    }

    fn execute(
        &mut self,
        cmd: &Command,
        pin: u8,
        gate: CommandGate,
        hw: &mut HwParts<'_>,
        now_ms: u64,
    ) -> Result<(), ActuatorError> {
        let verb = CommandVerb::parse(&cmd.command).ok_or(ActuatorError::UnknownCommand)?;

        match verb {
            CommandVerb::On => {
                self.control_binary(pin, true, gate, hw, now_ms)?;
                self.arm_auto_off(pin, cmd.duration, now_ms);
            }
            CommandVerb::Off => {
                self.control_binary(pin, false, gate, hw, now_ms)?;
            }
            CommandVerb::Pwm => {
                let value = cmd.value.ok_or(ActuatorError::ValueOutOfRange)?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(ActuatorError::ValueOutOfRange);
                }
                self.control(pin, value, gate, hw, now_ms)?;
                self.arm_auto_off(pin, cmd.duration, now_ms);
            }
            CommandVerb::Toggle => {
                let on = self
                    .slot_mut(pin)?
                    .driver
                    .is_on();
                self.control_binary(pin, !on, gate, hw, now_ms)?;
                if !on {
                    self.arm_auto_off(pin, cmd.duration, now_ms);
                }
            }
        }
        Ok(())
    }

    fn arm_auto_off(&mut self, pin: u8, duration_s: Option<u32>, now_ms: u64) {
        let Some(seconds) = duration_s.filter(|d| *d > 0) else {
            return;
        };
        if let Some(index) = self.index_of(pin) {
            if let Some(slot) = self.slots[index].as_mut() {
                slot.auto_off_at_ms = Some(now_ms + u64::from(seconds) * 1000);
            }
        }
    }

    // ── Internal ──────────────────────────────────────────────

    fn index_of(&self, pin: u8) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.as_ref()
                .is_some_and(|slot| slot.driver.config().pin == pin)
        })
    }

    fn slot_mut(&mut self, pin: u8) -> Result<&mut Slot, ActuatorError> {
        let index = self.index_of(pin).ok_or(ActuatorError::NotConfigured)?;
        self.slots[index].as_mut().ok_or(ActuatorError::NotConfigured)
    }
}

/// Activation gate: "off" always passes, anything energizing needs the
/// system to be in normal operation.
fn check_gate(gate: CommandGate, energizes: bool) -> Result<(), ActuatorError> {
    if !energizes {
        return Ok(());
    }
    match gate {
        CommandGate::Open => Ok(()),
        CommandGate::Latched => Err(ActuatorError::EmergencyLatched),
        CommandGate::OutputsOff => Err(ActuatorError::OutputsDisabled),
    }
}

fn respond(
    cmd: &Command,
    outcome: Result<(), heapless::String<MSG_CAP>>,
    pin: u8,
    publish: &mut impl Publish,
    topics: &TopicBuilder,
) {
    let (success, message) = match outcome {
        Ok(()) => {
            let mut m = heapless::String::new();
            let _ = m.push_str("ok");
            (true, m)
        }
        Err(m) => (false, m),
    };
    let response = CommandResponse {
        command: cmd.command.clone(),
        value: cmd.value,
        duration: cmd.duration,
        success,
        message,
        correlation_id: cmd.correlation_id.clone(),
    };
    emit_json(
        topics.actuator_response(pin).as_str(),
        &response,
        QoS::AtLeastOnce,
        false,
        publish,
    );
}

fn emit_status(driver: &Driver, publish: &mut impl Publish, topics: &TopicBuilder) {
    let status = driver.status();
    emit_json(
        topics.actuator_status(status.pin).as_str(),
        &status,
        QoS::AtLeastOnce,
        false,
        publish,
    );
}

fn emit_alert(
    driver: &Driver,
    alert_type: &'static str,
    message: &str,
    now_ms: u64,
    publish: &mut impl Publish,
    topics: &TopicBuilder,
) {
    let pin = driver.config().pin;
    let mut msg = heapless::String::new();
    let _ = msg.push_str(&message[..message.len().min(MSG_CAP)]);
    let alert = AlertPayload {
        alert_type,
        pin,
        message: msg,
        timestamp_ms: now_ms,
    };
    emit_json(
        topics.actuator_alert(pin).as_str(),
        &alert,
        QoS::AtLeastOnce,
        driver.config().critical,
        publish,
    );
}

/// Serialize and publish one payload. Serialization of our own types
/// cannot fail; a failure here is a programming error worth a log line,
/// not a panic.
pub(crate) fn emit_json<T: Serialize>(
    topic: &str,
    payload: &T,
    qos: QoS,
    critical: bool,
    publish: &mut impl Publish,
) {
    match serde_json::to_vec(payload) {
        Ok(bytes) => publish.publish(topic, &bytes, qos, critical),
        Err(e) => warn!("emit: serialize failed for {}: {}", topic, e),
    }
}
