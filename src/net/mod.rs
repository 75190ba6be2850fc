//! Broker connectivity: link abstraction, offline queue, resilient
//! client.
//!
//! The transport is a narrow trait so the connection state machine can
//! be exercised on the host against a scripted broker. The ESP build
//! implements [`BrokerLink`] over the ESP-IDF MQTT client.

pub mod client;
pub mod queue;

use crate::error::NetError;
use crate::topics::TOPIC_CAP;

/// Delivery guarantee requested for one message. No exactly-once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    /// Fire and forget (heartbeat).
    AtMostOnce,
    /// Everything else.
    AtLeastOnce,
}

/// One message delivered by the broker.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub topic: heapless::String<TOPIC_CAP>,
    pub payload: Vec<u8>,
}

/// Byte-level broker connection. `poll` must return promptly — the main
/// loop calls it once per iteration.
pub trait BrokerLink {
    fn connect(&mut self) -> Result<(), NetError>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    /// Underlying network interface state (wire/IP, not broker session).
    fn network_up(&self) -> bool;
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), NetError>;
    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), NetError>;
    /// Next pending inbound message, if any.
    fn poll(&mut self) -> Option<Inbound>;
}

/// Outbound publish surface handed to managers. Implementations absorb
/// failures into the offline queue, so emission sites never branch on
/// connectivity.
pub trait Publish {
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, critical: bool);
}

// ---------------------------------------------------------------------------
// ESP-IDF MQTT link
// ---------------------------------------------------------------------------

/// Broker link over the ESP-IDF MQTT client. The event callback runs
/// on the MQTT task; it only touches the shared connected flag and the
/// inbound queue, both behind their own locks.
#[cfg(target_os = "espidf")]
pub struct EspMqttLink {
    broker_url: String,
    client_id: String,
    client: Option<esp_idf_svc::mqtt::client::EspMqttClient<'static>>,
    connected: std::sync::Arc<core::sync::atomic::AtomicBool>,
    inbound: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Inbound>>>,
}

#[cfg(target_os = "espidf")]
impl EspMqttLink {
    pub fn new(broker_url: &str, client_id: &str) -> Self {
        Self {
            broker_url: broker_url.to_string(),
            client_id: client_id.to_string(),
            client: None,
            connected: std::sync::Arc::new(core::sync::atomic::AtomicBool::new(false)),
            inbound: std::sync::Arc::new(std::sync::Mutex::new(
                std::collections::VecDeque::new(),
            )),
        }
    }

    fn map_qos(qos: QoS) -> esp_idf_svc::mqtt::client::QoS {
        match qos {
            QoS::AtMostOnce => esp_idf_svc::mqtt::client::QoS::AtMostOnce,
            QoS::AtLeastOnce => esp_idf_svc::mqtt::client::QoS::AtLeastOnce,
        }
    }
}

#[cfg(target_os = "espidf")]
impl BrokerLink for EspMqttLink {
    fn connect(&mut self) -> Result<(), NetError> {
        use core::sync::atomic::Ordering;
        use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration};

        let conf = MqttClientConfiguration {
            client_id: Some(&self.client_id),
            ..Default::default()
        };

        let connected = self.connected.clone();
        let inbound = self.inbound.clone();
        let client = EspMqttClient::new_cb(&self.broker_url, &conf, move |event| {
            match event.payload() {
                EventPayload::Connected(_) => connected.store(true, Ordering::Release),
                EventPayload::Disconnected => connected.store(false, Ordering::Release),
                EventPayload::Received { topic, data, .. } => {
                    if let Some(topic) = topic {
                        let mut t = heapless::String::new();
                        let _ = t.push_str(topic);
                        if let Ok(mut q) = inbound.lock() {
                            q.push_back(Inbound {
                                topic: t,
                                payload: data.to_vec(),
                            });
                        }
                    }
                }
                _ => {}
            }
        })
        .map_err(|_| NetError::ConnectFailed)?;

        self.client = Some(client);

        // The session handshake completes on the MQTT task; give it a
        // bounded moment before reporting failure to the backoff logic.
        for _ in 0..50 {
            if self.connected.load(Ordering::Acquire) {
                return Ok(());
            }
            crate::hal::delay_ms(10);
        }
        self.client = None;
        Err(NetError::ConnectFailed)
    }

    fn disconnect(&mut self) {
        self.client = None;
        self.connected
            .store(false, core::sync::atomic::Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(core::sync::atomic::Ordering::Acquire)
    }

    fn network_up(&self) -> bool {
        // SAFETY: read-only query of the default netif.
        unsafe {
            let netif = esp_idf_svc::sys::esp_netif_get_default_netif();
            !netif.is_null() && esp_idf_svc::sys::esp_netif_is_netif_up(netif)
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), NetError> {
        let client = self.client.as_mut().ok_or(NetError::NotConnected)?;
        client
            .publish(topic, Self::map_qos(qos), false, payload)
            .map(|_| ())
            .map_err(|_| NetError::PublishFailed)
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), NetError> {
        let client = self.client.as_mut().ok_or(NetError::NotConnected)?;
        client
            .subscribe(topic, Self::map_qos(qos))
            .map(|_| ())
            .map_err(|_| NetError::SubscribeFailed)
    }

    fn poll(&mut self) -> Option<Inbound> {
        self.inbound.lock().ok()?.pop_front()
    }
}

// ---------------------------------------------------------------------------
// Host broker simulation
// ---------------------------------------------------------------------------

/// Scripted broker for host tests: connectivity toggles, failure
/// injection, captured publishes, and an inbound injection queue.
#[cfg(not(target_os = "espidf"))]
pub struct SimBroker {
    /// Whether connect() attempts succeed.
    pub reachable: bool,
    /// Underlying network interface state.
    pub network: bool,
    connected: bool,
    /// Remaining subscribe calls to fail.
    pub fail_subscribes: u32,
    pub published: Vec<(String, Vec<u8>, QoS)>,
    pub subscriptions: Vec<String>,
    inbound: std::collections::VecDeque<Inbound>,
    pub connect_attempts: u32,
}

#[cfg(not(target_os = "espidf"))]
impl Default for SimBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_os = "espidf"))]
impl SimBroker {
    pub fn new() -> Self {
        Self {
            reachable: true,
            network: true,
            connected: false,
            fail_subscribes: 0,
            published: Vec::new(),
            subscriptions: Vec::new(),
            inbound: std::collections::VecDeque::new(),
            connect_attempts: 0,
        }
    }

    /// Drop the session as if the broker went away.
    pub fn drop_connection(&mut self) {
        self.connected = false;
    }

    /// Queue an inbound message for the client to poll.
    pub fn inject(&mut self, topic: &str, payload: &[u8]) {
        let mut t = heapless::String::new();
        let _ = t.push_str(topic);
        self.inbound.push_back(Inbound {
            topic: t,
            payload: payload.to_vec(),
        });
    }

    /// Topics of captured publishes, in order.
    pub fn published_topics(&self) -> Vec<&str> {
        self.published.iter().map(|(t, _, _)| t.as_str()).collect()
    }

    /// Payloads captured for one topic, in order.
    pub fn payloads_for(&self, topic: &str) -> Vec<&[u8]> {
        self.published
            .iter()
            .filter(|(t, _, _)| t == topic)
            .map(|(_, p, _)| p.as_slice())
            .collect()
    }
}

#[cfg(not(target_os = "espidf"))]
impl BrokerLink for SimBroker {
    fn connect(&mut self) -> Result<(), NetError> {
        self.connect_attempts += 1;
        if self.reachable && self.network {
            self.connected = true;
            Ok(())
        } else {
            Err(NetError::ConnectFailed)
        }
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn network_up(&self) -> bool {
        self.network
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), NetError> {
        if !self.connected {
            return Err(NetError::NotConnected);
        }
        self.published
            .push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), NetError> {
        let _ = qos;
        if !self.connected {
            return Err(NetError::NotConnected);
        }
        if self.fail_subscribes > 0 {
            self.fail_subscribes -= 1;
            return Err(NetError::SubscribeFailed);
        }
        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        Ok(())
    }

    fn poll(&mut self) -> Option<Inbound> {
        if !self.connected {
            return None;
        }
        self.inbound.pop_front()
    }
}
