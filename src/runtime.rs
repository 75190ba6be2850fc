//! Composition root and main loop.
//!
//! [`Node`] owns every subsystem — no module-level globals — and wires
//! them together: one iteration feeds the watchdog (subject to the
//! gate), pumps the messaging client, dispatches inbound messages,
//! ticks the sensor and actuator managers, and offers unreported
//! errors to the controller. Each step completes in bounded time.

use log::{info, warn};
use serde::Serialize;

use crate::actuators::manager::{emit_json, ActuatorManager};
use crate::actuators::HwParts;
use crate::board;
use crate::bus::i2c::{I2cEngine, SharedBus};
use crate::bus::onewire::{OneWireBus, OneWireIo};
use crate::bus::pwm::PwmController;
use crate::config::packets::SystemCommand;
use crate::config::store::StoragePort;
use crate::config::ConfigManager;
use crate::drivers::watchdog::Watchdog;
use crate::error::{codes, ErrorEvent, ErrorTracker, Severity};
use crate::gpio::{GpioManager, PinInfo};
use crate::net::client::{MessagingClient, NetSession};
use crate::net::{BrokerLink, Inbound, QoS};
use crate::safety::{SafetyController, SystemState};
use crate::sensors::manager::SensorManager;
use crate::topics::TopicBuilder;

/// Pace of the main loop. Every subsystem budget assumes an iteration
/// in the tens of milliseconds.
pub const LOOP_PERIOD_MS: u32 = 25;

/// Missed iterations tolerated before the task watchdog resets the
/// chip: 400 × 25 ms = a 10 s deadline at the standard pace.
const WATCHDOG_GRACE_ITERATIONS: u32 = 400;

/// Watchdog feed gate, as a pure function of the two link layers.
///
/// Broker loss is a degraded-but-live state: the node keeps running,
/// queueing telemetry. Loss of the underlying network interface is
/// fatal — withholding the feed lets the hardware watchdog reboot us.
pub fn watchdog_may_feed(network_up: bool, _broker_connected: bool) -> bool {
    network_up
}

// ---------------------------------------------------------------------------
// Emission payloads owned by the root
// ---------------------------------------------------------------------------

/// Periodic health snapshot.
#[derive(Debug, Serialize)]
struct HeartbeatPayload {
    uptime_s: u64,
    free_heap: u32,
    min_free_heap: u32,
    i2c: heapless::String<64>,
    onewire: heapless::String<64>,
    broker: heapless::String<64>,
    network_up: bool,
    system_state: SystemState,
    sensors_active: usize,
    actuators_active: usize,
    pins: heapless::Vec<PinInfo, { board::GPIO_COUNT }>,
}

/// Retained-style node status.
#[derive(Debug, Serialize)]
struct StatusPayload {
    system_state: SystemState,
    #[serde(skip_serializing_if = "str::is_empty")]
    reason: heapless::String<48>,
    firmware_version: &'static str,
    uptime_s: u64,
    sensors_active: usize,
    actuators_active: usize,
}

#[derive(Debug, Serialize)]
struct ErrorSummary {
    total: usize,
    warnings: usize,
    errors: usize,
    criticals: usize,
    dropped: u32,
}

/// On-demand diagnostics snapshot.
#[derive(Debug, Serialize)]
struct DiagnosticsPayload {
    uptime_s: u64,
    free_heap: u32,
    min_free_heap: u32,
    errors: ErrorSummary,
    recent: heapless::Vec<ErrorEvent, { crate::error::TRACKER_CAP }>,
    reconnects: u32,
    connect_failures: u32,
    queued_messages: usize,
    watchdog_withheld: u32,
    i2c: heapless::String<64>,
    onewire: heapless::String<64>,
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Everything the firmware owns, wired once at boot.
pub struct Node<L, S, E, W>
where
    L: BrokerLink,
    S: StoragePort,
    E: I2cEngine,
    W: OneWireIo,
{
    pub gpio: GpioManager,
    pub pwm: PwmController,
    pub i2c: SharedBus<E>,
    pub onewire: OneWireBus<W>,
    pub sensors: SensorManager,
    pub actuators: ActuatorManager,
    pub safety: SafetyController,
    pub config: ConfigManager,
    pub client: MessagingClient,
    pub link: L,
    pub store: S,
    pub topics: TopicBuilder,
    pub tracker: ErrorTracker,
    watchdog: Watchdog,
    boot_ms: u64,
    next_heartbeat_ms: u64,
    reboot_requested: bool,
}

impl<L, S, E, W> Node<L, S, E, W>
where
    L: BrokerLink,
    S: StoragePort,
    E: I2cEngine,
    W: OneWireIo,
{
    pub fn new(
        link: L,
        store: S,
        i2c_engine: E,
        onewire_io: W,
        controller_id: &str,
        node_id: &str,
    ) -> Self {
        Self {
            gpio: GpioManager::new(),
            pwm: PwmController::new(),
            i2c: SharedBus::new(
                i2c_engine,
                board::I2C_SDA_PIN,
                board::I2C_SCL_PIN,
                board::I2C_FREQ_HZ,
            ),
            onewire: OneWireBus::new(onewire_io),
            sensors: SensorManager::new(),
            actuators: ActuatorManager::new(),
            safety: SafetyController::new(),
            config: ConfigManager::new(),
            client: MessagingClient::new(),
            link,
            store,
            topics: TopicBuilder::new(controller_id, node_id),
            tracker: ErrorTracker::new(),
            watchdog: Watchdog::arm(LOOP_PERIOD_MS * WATCHDOG_GRACE_ITERATIONS),
            boot_ms: 0,
            next_heartbeat_ms: 0,
            reboot_requested: false,
        }
    }

    /// Boot sequence: safe-mode first, then persisted configuration,
    /// then hardware buses, then the last known sensor/actuator sets.
    /// The broker connection happens on the first loop iteration, which
    /// also drains anything queued during boot.
    pub fn boot(&mut self, now_ms: u64) {
        self.boot_ms = now_ms;
        info!(
            "fieldnode v{} booting (node '{}')",
            env!("CARGO_PKG_VERSION"),
            self.topics.node_id()
        );

        self.gpio.initialize_to_safe_mode();

        if let Err(e) = self.i2c.init(&mut self.gpio) {
            self.tracker
                .record_error(e.into(), Severity::Critical, "i2c bring-up", now_ms);
        }

        let mut hw = HwParts {
            gpio: &mut self.gpio,
            pwm: &mut self.pwm,
        };
        let mut session = NetSession {
            client: &mut self.client,
            link: &mut self.link,
        };
        self.config.warm_boot(
            &mut self.sensors,
            &mut self.actuators,
            &mut hw,
            &mut self.onewire,
            &mut self.store,
            &mut session,
            &mut self.topics,
            &mut self.tracker,
            now_ms,
        );

        self.sensors.set_batch_interval_ms(
            u64::from(self.config.settings().sensor_batch_interval_seconds) * 1000,
        );
        self.next_heartbeat_ms = now_ms + self.heartbeat_interval_ms();

        self.publish_status(now_ms);
    }

    pub fn reboot_requested(&self) -> bool {
        self.reboot_requested
    }

    /// Cooperative shutdown: next iteration disconnects cleanly.
    pub fn request_stop(&mut self) {
        self.client.request_stop();
    }

    fn heartbeat_interval_ms(&self) -> u64 {
        u64::from(self.config.settings().heartbeat_interval_seconds) * 1000
    }

    // ── Main loop ─────────────────────────────────────────────

    /// One cooperative iteration. The caller owns pacing.
    pub fn run_iteration(&mut self, now_ms: u64) {
        // (a) Watchdog, gated by the pure feed policy.
        let may_feed = watchdog_may_feed(self.link.network_up(), self.client.is_connected());
        if !self.watchdog.service(may_feed) {
            self.tracker.record(
                codes::WATCHDOG_FEED_BLOCKED,
                Severity::Critical,
                "network down: withholding watchdog feed",
                now_ms,
            );
        }

        // (b) Pump the messaging client.
        let pins = self.actuators.pins();
        let outcome = self
            .client
            .service(&mut self.link, &self.topics, &pins, now_ms);

        if outcome.subscribe_exhausted {
            self.enter_emergency("subscription failure", now_ms);
        }
        if outcome.reconnected {
            self.publish_status(now_ms);
        }

        for msg in outcome.inbound {
            self.dispatch(&msg, now_ms);
        }

        // (c) Sensors.
        {
            let mut session = NetSession {
                client: &mut self.client,
                link: &mut self.link,
            };
            self.sensors.tick(
                now_ms,
                &self.gpio,
                &mut self.i2c,
                &mut self.onewire,
                &mut session,
                &self.topics,
                &mut self.tracker,
            );
        }

        // (d) Actuators: protection trips, auto-off, valve motion.
        {
            let mut hw = HwParts {
                gpio: &mut self.gpio,
                pwm: &mut self.pwm,
            };
            let mut session = NetSession {
                client: &mut self.client,
                link: &mut self.link,
            };
            self.actuators
                .tick(now_ms, &mut hw, &mut session, &self.topics);
        }

        // (e) Heartbeat and error offering.
        if now_ms >= self.next_heartbeat_ms {
            self.next_heartbeat_ms = now_ms + self.heartbeat_interval_ms();
            self.publish_heartbeat(now_ms);
        }
        self.offer_errors();
    }

    // ── Inbound dispatch ──────────────────────────────────────

    fn dispatch(&mut self, msg: &Inbound, now_ms: u64) {
        let topic = msg.topic.as_str();

        if topic == self.topics.system_command().as_str() {
            self.handle_system_command(&msg.payload, now_ms);
        } else if topic == self.topics.config().as_str() {
            self.handle_config(&msg.payload, now_ms);
        } else if topic == self.topics.node_emergency().as_str() {
            self.enter_emergency("node emergency topic", now_ms);
        } else if topic == self.topics.broadcast_emergency().as_str() {
            self.enter_emergency("broadcast", now_ms);
        } else if let Some(pin) = self.topics.match_actuator_command(topic) {
            let gate = self.safety.gate();
            let mut hw = HwParts {
                gpio: &mut self.gpio,
                pwm: &mut self.pwm,
            };
            let mut session = NetSession {
                client: &mut self.client,
                link: &mut self.link,
            };
            self.actuators.handle_command(
                pin,
                &msg.payload,
                gate,
                &mut hw,
                &mut session,
                &self.topics,
                now_ms,
            );
        } else {
            warn!("dispatch: unmatched topic {}", topic);
        }
    }

    fn handle_config(&mut self, payload: &[u8], now_ms: u64) {
        {
            let mut hw = HwParts {
                gpio: &mut self.gpio,
                pwm: &mut self.pwm,
            };
            let mut session = NetSession {
                client: &mut self.client,
                link: &mut self.link,
            };
            self.config.handle_packet(
                payload,
                &mut self.sensors,
                &mut self.actuators,
                &mut hw,
                &mut self.onewire,
                &mut self.store,
                &mut session,
                &mut self.topics,
                &mut self.tracker,
                now_ms,
            );
        }

        // Newly configured actuators need their command topics live.
        self.sensors.set_batch_interval_ms(
            u64::from(self.config.settings().sensor_batch_interval_seconds) * 1000,
        );
        for pin in self.actuators.pins() {
            let _ = self
                .client
                .subscribe_actuator(&mut self.link, &self.topics, pin);
        }
    }

    fn handle_system_command(&mut self, payload: &[u8], now_ms: u64) {
        let cmd: SystemCommand = match serde_json::from_slice(payload) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("system command parse failed: {}", e);
                self.tracker.record(
                    codes::CONFIG_PARSE_FAILED,
                    Severity::Error,
                    "system command parse failed",
                    now_ms,
                );
                return;
            }
        };

        match cmd.command.as_str() {
            "emergency_stop" => self.enter_emergency("operator command", now_ms),
            "exit_safe_mode" => {
                if self.safety.exit_safe_mode(now_ms) {
                    // Latches release; outputs stay at their safe level
                    // until resume_operation.
                    self.actuators.clear_emergency_all();
                    self.publish_status(now_ms);
                }
            }
            "resume_operation" => {
                if self.safety.resume_operation(now_ms) {
                    self.publish_status(now_ms);
                }
            }
            "get_status" => self.publish_status(now_ms),
            "get_diagnostics" => self.publish_diagnostics(now_ms),
            "reboot" => {
                info!("system: reboot requested");
                self.reboot_requested = true;
            }
            other => {
                warn!("system: unknown command '{}'", other);
                self.tracker.record(
                    codes::UNKNOWN_COMMAND,
                    Severity::Warning,
                    "unknown system command",
                    now_ms,
                );
                self.publish_status(now_ms);
            }
        }
    }

    // ── Emergency ─────────────────────────────────────────────

    fn enter_emergency(&mut self, reason: &str, now_ms: u64) {
        self.safety.latch(reason, now_ms);
        let mut hw = HwParts {
            gpio: &mut self.gpio,
            pwm: &mut self.pwm,
        };
        let mut session = NetSession {
            client: &mut self.client,
            link: &mut self.link,
        };
        self.actuators
            .emergency_stop_all(reason, &mut hw, &mut session, &self.topics, now_ms);
        self.publish_status(now_ms);
    }

    // ── Emission ──────────────────────────────────────────────

    fn publish_status(&mut self, now_ms: u64) {
        let mut reason = heapless::String::new();
        let _ = reason.push_str(self.safety.reason());
        let payload = StatusPayload {
            system_state: self.safety.state(),
            reason,
            firmware_version: env!("CARGO_PKG_VERSION"),
            uptime_s: now_ms.saturating_sub(self.boot_ms) / 1000,
            sensors_active: self.sensors.count(),
            actuators_active: self.actuators.count(),
        };
        let mut session = NetSession {
            client: &mut self.client,
            link: &mut self.link,
        };
        emit_json(
            self.topics.status().as_str(),
            &payload,
            QoS::AtLeastOnce,
            false,
            &mut session,
        );
    }

    fn publish_heartbeat(&mut self, now_ms: u64) {
        let payload = HeartbeatPayload {
            uptime_s: now_ms.saturating_sub(self.boot_ms) / 1000,
            free_heap: crate::hal::free_heap_bytes(),
            min_free_heap: crate::hal::min_free_heap_bytes(),
            i2c: self.i2c.status_string(),
            onewire: self.onewire.status_string(),
            broker: self.client.status_string(),
            network_up: self.link.network_up(),
            system_state: self.safety.state(),
            sensors_active: self.sensors.count(),
            actuators_active: self.actuators.count(),
            pins: self.gpio.snapshot(),
        };
        let mut session = NetSession {
            client: &mut self.client,
            link: &mut self.link,
        };
        // At-most-once: a missed heartbeat is tolerated, never queued.
        emit_json(
            self.topics.heartbeat().as_str(),
            &payload,
            QoS::AtMostOnce,
            false,
            &mut session,
        );
    }

    fn publish_diagnostics(&mut self, now_ms: u64) {
        let payload = DiagnosticsPayload {
            uptime_s: now_ms.saturating_sub(self.boot_ms) / 1000,
            free_heap: crate::hal::free_heap_bytes(),
            min_free_heap: crate::hal::min_free_heap_bytes(),
            errors: ErrorSummary {
                total: self.tracker.len(),
                warnings: self.tracker.count_by_severity(Severity::Warning),
                errors: self.tracker.count_by_severity(Severity::Error),
                criticals: self.tracker.count_by_severity(Severity::Critical),
                dropped: self.tracker.dropped(),
            },
            recent: self.tracker.recent(8),
            reconnects: self.client.reconnects(),
            connect_failures: self.client.connect_failures(),
            queued_messages: self.client.queued(),
            watchdog_withheld: self.watchdog.withheld(),
            i2c: self.i2c.status_string(),
            onewire: self.onewire.status_string(),
        };
        let mut session = NetSession {
            client: &mut self.client,
            link: &mut self.link,
        };
        emit_json(
            self.topics.diagnostics().as_str(),
            &payload,
            QoS::AtLeastOnce,
            false,
            &mut session,
        );
    }

    /// Offer every unreported error event to the controller over the
    /// at-least-once diagnostics channel. Queued counts as offered —
    /// criticals bypass queue eviction, so nothing critical is lost
    /// silently.
    fn offer_errors(&mut self) {
        let topic = self.topics.diagnostics();
        let client = &mut self.client;
        let link = &mut self.link;
        self.tracker.drain_unoffered(|event| {
            let critical = event.severity == Severity::Critical;
            if let Ok(bytes) = serde_json::to_vec(event) {
                client.publish(link, topic.as_str(), &bytes, QoS::AtLeastOnce, critical);
            }
        });
    }
}
