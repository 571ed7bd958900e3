//! Pub/sub transport adapter.
//!
//! Jobs talk to the broker only through [`Transport`]. A connection's last
//! will is part of [`ConnectOptions`], so it is registered with the broker
//! during the handshake, before anything can be published on it. A clean
//! [`Transport::disconnect`] disarms the will; any other way of losing the
//! connection makes the broker publish it. A connection that comes back
//! after such a drop says so on [`Connection::reconnects`].
//!
//! Two connectors exist: [`mqtt::MqttConnector`] (rumqttc) for real brokers
//! and [`memory::MemoryBroker`] for tests and single-process runs.

pub mod memory;
pub mod mqtt;

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::BusError;

/// Default capacity of a connection's inbound queue.
pub const INBOX_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Message {
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// A zero-length retained payload means "attribute cleared".
    pub fn is_clear(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Message the broker publishes on our behalf if the connection drops
/// without a clean disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// Per-connection options. Broker address and credentials belong to the
/// [`Connector`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub last_will: Option<LastWill>,
    pub inbox_capacity: usize,
}

impl ConnectOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            last_will: None,
            inbox_capacity: INBOX_CAPACITY,
        }
    }

    pub fn with_last_will(mut self, will: LastWill) -> Self {
        self.last_will = Some(will);
        self
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Transport: Send + Sync {
    fn client_id(&self) -> &str;

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: Qos,
    ) -> Result<(), BusError>;

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), BusError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError>;

    /// Clean disconnect. The broker discards the last will.
    async fn disconnect(&self) -> Result<(), BusError>;

    /// Retained, QoS 1 publish of a UTF-8 payload.
    async fn publish_retained(&self, topic: &str, payload: &str) -> Result<(), BusError> {
        self.publish(topic, payload.as_bytes().to_vec(), true, Qos::AtLeastOnce)
            .await
    }

    /// Zero-length retained publish, clearing whatever the broker holds.
    async fn clear(&self, topic: &str) -> Result<(), BusError> {
        self.publish(topic, Vec::new(), true, Qos::AtLeastOnce).await
    }
}

pub type SharedTransport = Arc<dyn Transport>;

/// An open connection: the transport plus the queue its receive loop fills.
pub struct Connection {
    pub transport: SharedTransport,
    pub inbox: mpsc::Receiver<Message>,
    /// Bumped each time the session comes back after a drop. By then the
    /// broker has published the will, so whoever owns the connection has to
    /// announce itself again.
    pub reconnects: watch::Receiver<u64>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, opts: ConnectOptions) -> Result<Connection, BusError>;
}

pub type SharedConnector = Arc<dyn Connector>;

// ---------------------------------------------------------------------------
// Reconnect backoff
// ---------------------------------------------------------------------------

/// Capped exponential backoff used by the MQTT receive loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the next one up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        d
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
