//! Connection-resilient messaging client.
//!
//! One logical broker connection with exponential-backoff reconnection
//! and a single circuit breaker — the breaker is modeled here and only
//! here; the watchdog feed gate derives from (network, broker) state as
//! a pure function in the runtime.
//!
//! ```text
//!        ┌──────── dwell elapsed ────────┐
//!        │                               ▼
//!   [BACKOFF] ◀── loss/failure ── [CONNECTED] ◀── ok ── attempt
//!        │                                                ▲
//!        └── breaker OPEN? wait cooldown ── HALF_OPEN ────┘
//!                                          (bypasses the dwell gate)
//! ```
//!
//! There is no attempt ceiling anywhere in this module: a node that
//! stops reconnecting is a dead node. The breaker pauses, it never
//! gives up.

use log::{info, warn};

use crate::net::queue::{OfflineQueue, QueuedMessage};
use crate::net::{BrokerLink, Inbound, Publish, QoS};
use crate::topics::TopicBuilder;

/// First reconnect dwell after a loss.
pub const BACKOFF_INITIAL_MS: u64 = 1_000;
/// Dwell ceiling.
pub const BACKOFF_CAP_MS: u64 = 60_000;
/// Consecutive connect failures before the breaker opens. Set one past
/// the dwell ladder (1,2,4,8,16,32 s) so the breaker takes over exactly
/// where the cap would have.
pub const BREAKER_THRESHOLD: u8 = 7;
/// Open-state cooldown before a half-open probe.
pub const BREAKER_COOLDOWN_MS: u64 = 60_000;
/// Attempts per subscription topic before giving up on the session.
pub const SUBSCRIBE_RETRIES: u8 = 3;
/// Inbound messages drained per service call.
const POLL_BUDGET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Disconnected,
    Backoff { until_ms: u64 },
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Breaker {
    Closed { failures: u8 },
    Open { until_ms: u64 },
    HalfOpen,
}

/// What one service pass observed.
#[derive(Debug, Default)]
pub struct ServiceOutcome {
    pub inbound: heapless::Vec<Inbound, POLL_BUDGET>,
    /// A subscription exhausted its retries; the node must enter
    /// system-wide emergency.
    pub subscribe_exhausted: bool,
    /// This pass completed a reconnect (queue drained, subscriptions
    /// restored).
    pub reconnected: bool,
}

pub struct MessagingClient {
    conn: ConnState,
    backoff_ms: u64,
    breaker: Breaker,
    queue: OfflineQueue,
    reconnects: u32,
    connect_failures: u32,
    stop: bool,
}

impl Default for MessagingClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MessagingClient {
    pub fn new() -> Self {
        Self {
            conn: ConnState::Disconnected,
            backoff_ms: BACKOFF_INITIAL_MS,
            breaker: Breaker::Closed { failures: 0 },
            queue: OfflineQueue::new(),
            reconnects: 0,
            connect_failures: 0,
            stop: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn == ConnState::Connected
    }

    pub fn breaker_state(&self) -> BreakerState {
        match self.breaker {
            Breaker::Closed { .. } => BreakerState::Closed,
            Breaker::Open { .. } => BreakerState::Open,
            Breaker::HalfOpen => BreakerState::HalfOpen,
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn reconnects(&self) -> u32 {
        self.reconnects
    }

    pub fn connect_failures(&self) -> u32 {
        self.connect_failures
    }

    /// Cooperative shutdown: the next service pass disconnects cleanly.
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    /// One-line health summary for heartbeat payloads.
    pub fn status_string(&self) -> heapless::String<64> {
        let mut s = heapless::String::new();
        let state = match self.conn {
            ConnState::Connected => "connected",
            ConnState::Backoff { .. } => "backoff",
            ConnState::Disconnected => "disconnected",
        };
        let _ = core::fmt::Write::write_fmt(
            &mut s,
            format_args!("{} ({} reconnects, {} queued)", state, self.reconnects, self.queue.len()),
        );
        s
    }

    // ── Service ───────────────────────────────────────────────

    /// Pump the connection once. Called every main-loop iteration;
    /// bounded work only.
    pub fn service(
        &mut self,
        link: &mut impl BrokerLink,
        topics: &TopicBuilder,
        actuator_pins: &[u8],
        now_ms: u64,
    ) -> ServiceOutcome {
        let mut outcome = ServiceOutcome::default();

        if self.stop {
            if link.is_connected() {
                link.disconnect();
            }
            self.conn = ConnState::Disconnected;
            return outcome;
        }

        // Detect session loss.
        if self.conn == ConnState::Connected && !link.is_connected() {
            warn!("net: broker connection lost");
            self.backoff_ms = BACKOFF_INITIAL_MS;
            self.conn = ConnState::Backoff {
                until_ms: now_ms + self.backoff_ms,
            };
        }

        // Breaker cooldown expiry → half-open probe window.
        if let Breaker::Open { until_ms } = self.breaker {
            if now_ms >= until_ms {
                self.breaker = Breaker::HalfOpen;
                info!("net: breaker half-open, probing");
            }
        }

        let attempt_due = match self.conn {
            ConnState::Connected => false,
            // The half-open probe must not wait out the dwell gate,
            // or the probe window expires and the breaker oscillates.
            _ if self.breaker == Breaker::HalfOpen => true,
            ConnState::Disconnected => !matches!(self.breaker, Breaker::Open { .. }),
            ConnState::Backoff { until_ms } => {
                now_ms >= until_ms && !matches!(self.breaker, Breaker::Open { .. })
            }
        };

        if attempt_due {
            match self.attempt_connect(link, topics, actuator_pins, now_ms) {
                Ok(subscribe_exhausted) => {
                    outcome.reconnected = true;
                    outcome.subscribe_exhausted = subscribe_exhausted;
                }
                Err(()) => {}
            }
        }

        if self.conn == ConnState::Connected {
            // Residual queue drains before any new publish.
            self.drain_queue(link);

            for _ in 0..POLL_BUDGET {
                match link.poll() {
                    Some(msg) => {
                        let _ = outcome.inbound.push(msg);
                    }
                    None => break,
                }
            }
        }

        outcome
    }

    fn attempt_connect(
        &mut self,
        link: &mut impl BrokerLink,
        topics: &TopicBuilder,
        actuator_pins: &[u8],
        now_ms: u64,
    ) -> Result<bool, ()> {
        match link.connect() {
            Ok(()) => {
                info!("net: connected to broker");
                self.conn = ConnState::Connected;
                self.backoff_ms = BACKOFF_INITIAL_MS;
                self.breaker = Breaker::Closed { failures: 0 };
                self.reconnects += 1;

                let subscribe_exhausted = !self.resubscribe(link, topics, actuator_pins);
                self.drain_queue(link);
                Ok(subscribe_exhausted)
            }
            Err(_) => {
                self.connect_failures += 1;

                self.breaker = match self.breaker {
                    Breaker::Closed { failures } => {
                        let failures = failures + 1;
                        if failures >= BREAKER_THRESHOLD {
                            warn!("net: breaker OPEN after {} failures", failures);
                            Breaker::Open {
                                until_ms: now_ms + BREAKER_COOLDOWN_MS,
                            }
                        } else {
                            Breaker::Closed { failures }
                        }
                    }
                    // Probe failed: back to a full cooldown.
                    Breaker::HalfOpen => {
                        warn!("net: half-open probe failed, breaker re-opens");
                        Breaker::Open {
                            until_ms: now_ms + BREAKER_COOLDOWN_MS,
                        }
                    }
                    open => open,
                };

                self.conn = ConnState::Backoff {
                    until_ms: now_ms + self.backoff_ms,
                };
                self.backoff_ms = (self.backoff_ms * 2).min(BACKOFF_CAP_MS);
                Err(())
            }
        }
    }

    /// Restore the full subscription set. Each topic gets
    /// [`SUBSCRIBE_RETRIES`] attempts; false means a topic exhausted
    /// them.
    fn resubscribe(
        &mut self,
        link: &mut impl BrokerLink,
        topics: &TopicBuilder,
        actuator_pins: &[u8],
    ) -> bool {
        let mut ok = true;
        let fixed = [
            topics.system_command(),
            topics.config(),
            topics.node_emergency(),
            topics.broadcast_emergency(),
        ];
        for topic in &fixed {
            ok &= subscribe_with_retry(link, topic.as_str());
        }
        for &pin in actuator_pins {
            ok &= subscribe_with_retry(link, topics.actuator_command(pin).as_str());
        }
        ok
    }

    /// Subscribe one more actuator command topic (new actuator
    /// configured while connected).
    pub fn subscribe_actuator(
        &mut self,
        link: &mut impl BrokerLink,
        topics: &TopicBuilder,
        pin: u8,
    ) -> bool {
        if self.conn != ConnState::Connected {
            return true; // reconnect will pick it up
        }
        subscribe_with_retry(link, topics.actuator_command(pin).as_str())
    }

    // ── Publish path ──────────────────────────────────────────

    /// Publish or enqueue. Queue order is strict FIFO: while anything
    /// is queued, fresh messages go behind it even when connected.
    pub fn publish(
        &mut self,
        link: &mut impl BrokerLink,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        critical: bool,
    ) {
        if self.conn == ConnState::Connected && self.queue.is_empty() {
            if link.publish(topic, payload, qos).is_ok() {
                return;
            }
            warn!("net: publish failed, queueing {}", topic);
        }

        // Heartbeats are at-most-once: never worth queue space.
        if qos == QoS::AtMostOnce {
            return;
        }

        let mut t = heapless::String::new();
        let _ = t.push_str(&topic[..topic.len().min(t.capacity())]);
        let _ = self.queue.push(QueuedMessage {
            topic: t,
            payload: payload.to_vec(),
            qos,
            critical,
        });
    }

    fn drain_queue(&mut self, link: &mut impl BrokerLink) {
        while let Some(msg) = self.queue.pop() {
            if link.publish(&msg.topic, &msg.payload, msg.qos).is_err() {
                // Connection is going again; restore and retry later.
                let _ = self.queue.push_front(msg);
                break;
            }
        }
    }
}

fn subscribe_with_retry(link: &mut impl BrokerLink, topic: &str) -> bool {
    for _ in 0..SUBSCRIBE_RETRIES {
        if link.subscribe(topic, QoS::AtLeastOnce).is_ok() {
            return true;
        }
    }
    warn!("net: subscribe exhausted retries for {}", topic);
    false
}

/// Borrow bundle implementing [`Publish`] for manager calls: publishes
/// go through the client so offline behaviour is uniform.
pub struct NetSession<'a, L: BrokerLink> {
    pub client: &'a mut MessagingClient,
    pub link: &'a mut L,
}

impl<L: BrokerLink> Publish for NetSession<'_, L> {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, critical: bool) {
        self.client.publish(self.link, topic, payload, qos, critical);
    }
}
