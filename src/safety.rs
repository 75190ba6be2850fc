//! System-wide emergency state machine.
//!
//! Recovery from a latched emergency is deliberately two-step: exiting
//! safe mode clears driver latches but leaves every output disabled, so
//! an operator can confirm the plant is safe before `resume_operation`
//! re-enables command acceptance. Nothing ever auto-restores previous
//! outputs — actuators come back OFF.

use core::fmt;

use log::{info, warn};
use serde::Serialize;

const REASON_CAP: usize = 48;

/// System emergency state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Normal,
    /// Emergency latched: all activation commands refused.
    Latched,
    /// Latches cleared, outputs still disabled pending resume.
    OutputsOff,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Latched => write!(f, "emergency_latched"),
            Self::OutputsOff => write!(f, "outputs_disabled"),
        }
    }
}

/// What the current system state permits an actuator command to do.
/// Computed once per dispatch and matched by the actuator manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandGate {
    /// Activation commands allowed.
    Open,
    /// Post-emergency, pre-resume: activations refused.
    OutputsOff,
    /// Emergency latched: activations refused.
    Latched,
}

/// The emergency state machine. Pure state: the composition root wires
/// its transitions to the actuator manager's latches.
pub struct SafetyController {
    state: SystemState,
    reason: heapless::String<REASON_CAP>,
    since_ms: u64,
}

impl Default for SafetyController {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyController {
    pub fn new() -> Self {
        Self {
            state: SystemState::Normal,
            reason: heapless::String::new(),
            since_ms: 0,
        }
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn since_ms(&self) -> u64 {
        self.since_ms
    }

    /// Gate applied to activation commands in the current state.
    pub fn gate(&self) -> CommandGate {
        match self.state {
            SystemState::Normal => CommandGate::Open,
            SystemState::Latched => CommandGate::Latched,
            SystemState::OutputsOff => CommandGate::OutputsOff,
        }
    }

    /// Enter the latched state. Idempotent; the first reason wins until
    /// cleared.
    pub fn latch(&mut self, reason: &str, now_ms: u64) {
        if self.state == SystemState::Latched {
            return;
        }
        self.state = SystemState::Latched;
        self.reason.clear();
        let _ = self
            .reason
            .push_str(&reason[..reason.len().min(REASON_CAP)]);
        self.since_ms = now_ms;
        warn!("safety: EMERGENCY LATCHED ({})", self.reason);
    }

    /// First recovery step: latched → outputs-disabled. Returns false
    /// if not latched.
    pub fn exit_safe_mode(&mut self, now_ms: u64) -> bool {
        if self.state != SystemState::Latched {
            return false;
        }
        self.state = SystemState::OutputsOff;
        self.since_ms = now_ms;
        info!("safety: latches cleared, outputs remain disabled");
        true
    }

    /// Second recovery step: outputs-disabled → normal. Returns false
    /// unless the intermediate step happened first.
    pub fn resume_operation(&mut self, now_ms: u64) -> bool {
        if self.state != SystemState::OutputsOff {
            return false;
        }
        self.state = SystemState::Normal;
        self.reason.clear();
        self.since_ms = now_ms;
        info!("safety: operation resumed, all actuators off");
        true
    }
}
