//! Topic/address construction for the message bus.
//!
//! All addresses are built from the controller and node identifiers as
//! substitution tokens; handlers never concatenate topic strings
//! themselves. The template set here is exhaustive for the core.

use core::fmt::Write as _;

/// Longest topic this node can produce.
pub const TOPIC_CAP: usize = 96;
const ID_CAP: usize = 24;

pub type Topic = heapless::String<TOPIC_CAP>;

/// Deterministic topic construction for one (controller, node) pair.
#[derive(Debug, Clone)]
pub struct TopicBuilder {
    controller: heapless::String<ID_CAP>,
    node: heapless::String<ID_CAP>,
}

impl TopicBuilder {
    pub fn new(controller: &str, node: &str) -> Self {
        let mut c = heapless::String::new();
        let _ = c.push_str(&controller[..controller.len().min(ID_CAP)]);
        let mut n = heapless::String::new();
        let _ = n.push_str(&node[..node.len().min(ID_CAP)]);
        Self {
            controller: c,
            node: n,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node
    }

    pub fn controller_id(&self) -> &str {
        &self.controller
    }

    /// Rebind the node identifier (zone config can rename the node).
    pub fn set_node_id(&mut self, node: &str) {
        self.node.clear();
        let _ = self.node.push_str(&node[..node.len().min(ID_CAP)]);
    }

    fn build(&self, tail: core::fmt::Arguments<'_>) -> Topic {
        let mut t = Topic::new();
        let _ = write!(t, "{}/{}/", self.controller, self.node);
        let _ = t.write_fmt(tail);
        t
    }

    // ── Emission topics ───────────────────────────────────────

    pub fn sensor_data(&self, pin: u8) -> Topic {
        self.build(format_args!("sensor/{pin}/data"))
    }

    pub fn sensor_batch(&self) -> Topic {
        self.build(format_args!("sensor_batch"))
    }

    pub fn heartbeat(&self) -> Topic {
        self.build(format_args!("system/heartbeat"))
    }

    pub fn status(&self) -> Topic {
        self.build(format_args!("status"))
    }

    pub fn actuator_status(&self, pin: u8) -> Topic {
        self.build(format_args!("actuator/{pin}/status"))
    }

    pub fn actuator_response(&self, pin: u8) -> Topic {
        self.build(format_args!("actuator/{pin}/response"))
    }

    pub fn actuator_alert(&self, pin: u8) -> Topic {
        self.build(format_args!("actuator/{pin}/alert"))
    }

    pub fn diagnostics(&self) -> Topic {
        self.build(format_args!("system/diagnostics"))
    }

    pub fn config_response(&self) -> Topic {
        self.build(format_args!("config"))
    }

    // ── Subscription topics ───────────────────────────────────

    pub fn system_command(&self) -> Topic {
        self.build(format_args!("system/command"))
    }

    pub fn actuator_command(&self, pin: u8) -> Topic {
        self.build(format_args!("actuator/{pin}/command"))
    }

    pub fn node_emergency(&self) -> Topic {
        self.build(format_args!("actuator/emergency"))
    }

    pub fn broadcast_emergency(&self) -> Topic {
        let mut t = Topic::new();
        let _ = write!(t, "{}/broadcast/emergency", self.controller);
        t
    }

    pub fn config(&self) -> Topic {
        self.build(format_args!("config"))
    }

    // ── Matching ──────────────────────────────────────────────

    /// Extract the pin index from an actuator command topic addressed to
    /// this node; `None` for anything else.
    pub fn match_actuator_command(&self, topic: &str) -> Option<u8> {
        let rest = topic.strip_prefix(self.controller.as_str())?;
        let rest = rest.strip_prefix('/')?;
        let rest = rest.strip_prefix(self.node.as_str())?;
        let rest = rest.strip_prefix("/actuator/")?;
        let pin_str = rest.strip_suffix("/command")?;
        pin_str.parse().ok()
    }
}
