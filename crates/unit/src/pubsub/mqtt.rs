//! rumqttc-backed connector.
//!
//! Each connection gets one receive-loop task that polls the rumqttc event
//! loop, forwards inbound publishes into the connection's inbox with
//! `try_send` (the loop never waits on a slow consumer), re-subscribes after
//! every CONNACK, and reconnects with capped exponential backoff. A CONNACK
//! after the first is also reported on the connection's `reconnects`.
//!
//! Requests go through rumqttc's bounded queue, which is only drained while
//! the loop is connected, so publishes give up after [`PUBLISH_TIMEOUT`]
//! instead of stalling the caller through a long outage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use super::{Backoff, ConnectOptions, Connection, Connector, Credentials, Message, Qos, Transport};
use crate::error::BusError;

/// Capacity of rumqttc's outgoing request queue.
const REQUEST_CAPACITY: usize = 64;

/// Longest a publish may wait for room in the request queue.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

fn to_rumqttc(q: Qos) -> QoS {
    match q {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MqttConnector {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
}

impl MqttConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
        }
    }

    fn options(&self, opts: &ConnectOptions) -> MqttOptions {
        let mut mqttoptions = MqttOptions::new(opts.client_id.clone(), self.host.clone(), self.port);
        mqttoptions.set_keep_alive(self.keep_alive);
        mqttoptions.set_clean_session(true);
        if let Some(c) = &self.credentials {
            mqttoptions.set_credentials(c.username.clone(), c.password.clone());
        }
        if let Some(w) = &opts.last_will {
            mqttoptions.set_last_will(rumqttc::LastWill::new(
                w.topic.clone(),
                w.payload.clone(),
                to_rumqttc(w.qos),
                w.retain,
            ));
        }
        mqttoptions
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, opts: ConnectOptions) -> Result<Connection, BusError> {
        let (client, eventloop) = AsyncClient::new(self.options(&opts), REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(opts.inbox_capacity.max(1));
        let (ready_tx, ready_rx) = oneshot::channel();
        let (reconnects_tx, reconnects) = watch::channel(0);

        let shared = Arc::new(SessionState::default());
        let task = tokio::spawn(receive_loop(
            opts.client_id.clone(),
            client.clone(),
            eventloop,
            tx,
            Arc::clone(&shared),
            Signals {
                ready: Some(ready_tx),
                reconnects: reconnects_tx,
            },
            Backoff::new(self.reconnect_initial, self.reconnect_max),
        ));

        match tokio::time::timeout(self.connect_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            _ => {
                task.abort();
                return Err(BusError::ConnectTimeout(self.connect_timeout));
            }
        }

        info!(client = %opts.client_id, host = %self.host, port = self.port, "mqtt connected");

        Ok(Connection {
            transport: Arc::new(MqttTransport {
                client_id: opts.client_id,
                client,
                shared,
            }),
            inbox: rx,
            reconnects,
        })
    }
}

// ---------------------------------------------------------------------------
// Receive loop
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SessionState {
    /// Filters to restore after a reconnect (clean sessions forget them).
    filters: Mutex<Vec<(String, QoS)>>,
    closing: AtomicBool,
}

impl SessionState {
    fn filters(&self) -> Vec<(String, QoS)> {
        self.filters
            .lock()
            .map(|f| f.clone())
            .unwrap_or_default()
    }
}

/// Session events the receive loop reports to the connection's owner.
struct Signals {
    /// First CONNACK.
    ready: Option<oneshot::Sender<()>>,
    /// Every later one.
    reconnects: watch::Sender<u64>,
}

async fn receive_loop(
    client_id: String,
    client: AsyncClient,
    mut eventloop: EventLoop,
    tx: mpsc::Sender<Message>,
    shared: Arc<SessionState>,
    mut signals: Signals,
    mut backoff: Backoff,
) {

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let msg = Message {
                    topic: p.topic.clone(),
                    payload: p.payload.to_vec(),
                    retain: p.retain,
                };
                match tx.try_send(msg) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(m)) => {
                        warn!(client = %client_id, topic = %m.topic, "inbox full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!(client = %client_id, "inbox closed, stopping receive loop");
                        break;
                    }
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                if let Some(r) = signals.ready.take() {
                    let _ = r.send(());
                } else {
                    info!(client = %client_id, "mqtt reconnected");
                    signals.reconnects.send_modify(|n| *n += 1);
                }
                // try_subscribe: awaiting the request queue from inside the
                // loop that drains it could deadlock.
                for (filter, qos) in shared.filters() {
                    if let Err(e) = client.try_subscribe(filter.clone(), qos) {
                        error!(client = %client_id, %filter, "resubscribe failed: {e}");
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client = %client_id, "clean disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if shared.closing.load(Ordering::SeqCst) {
                    break;
                }
                let delay = backoff.next_delay();
                warn!(
                    client = %client_id,
                    retry_in_ms = delay.as_millis() as u64,
                    "mqtt connection lost: {e}. reconnecting..."
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct MqttTransport {
    client_id: String,
    client: AsyncClient,
    shared: Arc<SessionState>,
}

#[async_trait]
impl Transport for MqttTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: Qos,
    ) -> Result<(), BusError> {
        let request = self.client.publish(topic, to_rumqttc(qos), retain, payload);
        match tokio::time::timeout(PUBLISH_TIMEOUT, request).await {
            Ok(r) => r.map_err(|e| BusError::Client(e.to_string())),
            Err(_) => Err(BusError::ConnectionLost(format!(
                "publish to {topic} not accepted within {PUBLISH_TIMEOUT:?}"
            ))),
        }
    }

    async fn subscribe(&self, filter: &str, qos: Qos) -> Result<(), BusError> {
        let q = to_rumqttc(qos);
        if let Ok(mut f) = self.shared.filters.lock() {
            if !f.iter().any(|(existing, _)| existing == filter) {
                f.push((filter.to_string(), q));
            }
        }
        self.client
            .subscribe(filter, q)
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        if let Ok(mut f) = self.shared.filters.lock() {
            f.retain(|(existing, _)| existing != filter);
        }
        self.client
            .unsubscribe(filter)
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        self.shared.closing.store(true, Ordering::SeqCst);
        self.client
            .disconnect()
            .await
            .map_err(|e| BusError::Client(e.to_string()))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
