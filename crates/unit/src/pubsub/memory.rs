//! In-process broker with retained messages, wildcard routing and last wills.
//!
//! Behaves like a small MQTT broker: retained topics are replayed on
//! subscribe, an empty retained payload deletes the retained entry, a clean
//! disconnect discards the will and [`MemoryBroker::kill`] (an unclean drop)
//! publishes it. A second connect with a client id that is still connected
//! takes the session over and fires the old session's will, as brokers do.
//! [`MemoryBroker::drop_and_reconnect`] plays a network blip: the will goes
//! out and the client is back before anyone notices locally.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use super::{ConnectOptions, Connection, Connector, LastWill, Message, Qos, Transport};
use crate::error::BusError;
use crate::topic::filter_matches;

/// Published messages kept for inspection; older half is dropped when full.
const HISTORY_LIMIT: usize = 50_000;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Vec<u8>>,
    clients: HashMap<String, ClientSlot>,
    history: Vec<Message>,
    next_session: u64,
}

struct ClientSlot {
    session: u64,
    filters: Vec<String>,
    tx: mpsc::Sender<Message>,
    will: Option<LastWill>,
    reconnects: watch::Sender<u64>,
}

impl BrokerState {
    fn is_live(&self, client_id: &str, session: u64) -> bool {
        self.clients
            .get(client_id)
            .is_some_and(|c| c.session == session)
    }

    fn route(&mut self, msg: Message) {
        if msg.retain {
            if msg.payload.is_empty() {
                self.retained.remove(&msg.topic);
            } else {
                self.retained.insert(msg.topic.clone(), msg.payload.clone());
            }
        }
        for (id, client) in &self.clients {
            if client.filters.iter().any(|f| filter_matches(f, &msg.topic)) {
                // Delivery to live subscribers is never flagged retained.
                let delivered = Message {
                    retain: false,
                    ..msg.clone()
                };
                if client.tx.try_send(delivered).is_err() {
                    warn!(client = %id, topic = %msg.topic, "memory broker: inbox full or closed, dropping");
                }
            }
        }
        if self.history.len() >= HISTORY_LIMIT {
            self.history.drain(..HISTORY_LIMIT / 2);
        }
        self.history.push(msg);
    }

    fn fire_will(&mut self, slot: ClientSlot) {
        self.publish_will(slot.will);
    }

    fn publish_will(&mut self, will: Option<LastWill>) {
        if let Some(w) = will {
            self.route(Message {
                topic: w.topic,
                payload: w.payload,
                retain: w.retain,
            });
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock only happens in a failing test; the
        // state itself is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop a client without a clean disconnect. The broker publishes its
    /// last will, exactly as it would on a keep-alive timeout.
    pub fn kill(&self, client_id: &str) -> bool {
        let mut st = self.lock();
        match st.clients.remove(client_id) {
            Some(slot) => {
                st.fire_will(slot);
                true
            }
            None => false,
        }
    }

    /// Drop a client's network connection and let it reconnect with the
    /// same id, will and subscriptions. The will is published as on
    /// [`MemoryBroker::kill`]; the client then sees a reconnect.
    pub fn drop_and_reconnect(&self, client_id: &str) -> bool {
        let mut st = self.lock();
        let Some(slot) = st.clients.get(client_id) else {
            return false;
        };
        let will = slot.will.clone();
        slot.reconnects.send_modify(|n| *n += 1);
        st.publish_will(will);
        true
    }

    /// Publish from outside any client session (tests, leader tooling).
    pub fn inject(&self, topic: &str, payload: &[u8], retain: bool) {
        self.lock().route(Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            retain,
        });
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.lock().retained.get(topic).cloned()
    }

    pub fn retained_str(&self, topic: &str) -> Option<String> {
        self.retained(topic)
            .map(|p| String::from_utf8_lossy(&p).into_owned())
    }

    /// Every message published to exactly `topic`, oldest first.
    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.lock()
            .history
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn history(&self) -> Vec<Message> {
        self.lock().history.clone()
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.lock().clients.contains_key(client_id)
    }

    pub fn has_will(&self, client_id: &str) -> bool {
        self.lock()
            .clients
            .get(client_id)
            .is_some_and(|c| c.will.is_some())
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, opts: ConnectOptions) -> Result<Connection, BusError> {
        let (tx, rx) = mpsc::channel(opts.inbox_capacity.max(1));
        let (reconnects_tx, reconnects) = watch::channel(0);
        let mut st = self.lock();
        st.next_session += 1;
        let session = st.next_session;
        if let Some(old) = st.clients.remove(&opts.client_id) {
            st.fire_will(old);
        }
        st.clients.insert(
            opts.client_id.clone(),
            ClientSlot {
                session,
                filters: Vec::new(),
                tx,
                will: opts.last_will,
                reconnects: reconnects_tx,
            },
        );
        drop(st);

        Ok(Connection {
            transport: Arc::new(MemoryTransport {
                broker: self.clone(),
                client_id: opts.client_id,
                session,
            }),
            inbox: rx,
            reconnects,
        })
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
    session: u64,
}

impl MemoryTransport {
    fn with_slot<T>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> T,
    ) -> Result<T, BusError> {
        let mut st = self.broker.lock();
        if !st.is_live(&self.client_id, self.session) {
            return Err(BusError::Closed);
        }
        Ok(f(&mut *st))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        _qos: Qos,
    ) -> Result<(), BusError> {
        self.with_slot(|st| {
            st.route(Message {
                topic: topic.to_string(),
                payload,
                retain,
            })
        })
    }

    async fn subscribe(&self, filter: &str, _qos: Qos) -> Result<(), BusError> {
        let id = self.client_id.clone();
        self.with_slot(|st| {
            let replay: Vec<Message> = st
                .retained
                .iter()
                .filter(|(t, _)| filter_matches(filter, t))
                .map(|(t, p)| Message {
                    topic: t.clone(),
                    payload: p.clone(),
                    retain: true,
                })
                .collect();
            if let Some(client) = st.clients.get_mut(&id) {
                client.filters.push(filter.to_string());
                for m in replay {
                    if client.tx.try_send(m).is_err() {
                        warn!(client = %id, "memory broker: inbox full during retained replay");
                    }
                }
            }
        })
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), BusError> {
        let id = self.client_id.clone();
        self.with_slot(|st| {
            if let Some(client) = st.clients.get_mut(&id) {
                client.filters.retain(|f| f != filter);
            }
        })
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let mut st = self.broker.lock();
        if !st.is_live(&self.client_id, self.session) {
            return Err(BusError::Closed);
        }
        st.clients.remove(&self.client_id);
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn will(topic: &str) -> LastWill {
        LastWill {
            topic: topic.into(),
            payload: b"lost".to_vec(),
            qos: Qos::AtLeastOnce,
            retain: true,
        }
    }

    #[tokio::test]
    async fn retained_is_replayed_on_subscribe() {
        let broker = MemoryBroker::new();
        let a = broker.connect(ConnectOptions::new("a")).await.unwrap();
        a.transport
            .publish_retained("u1/e1/stirring/duty_cycle", "30")
            .await
            .unwrap();

        let mut b = broker.connect(ConnectOptions::new("b")).await.unwrap();
        b.transport
            .subscribe("u1/+/stirring/#", Qos::AtLeastOnce)
            .await
            .unwrap();
        let m = b.inbox.recv().await.unwrap();
        assert_eq!(m.topic, "u1/e1/stirring/duty_cycle");
        assert_eq!(m.payload_str(), "30");
        assert!(m.retain);
    }

    #[tokio::test]
    async fn empty_retained_payload_clears() {
        let broker = MemoryBroker::new();
        let a = broker.connect(ConnectOptions::new("a")).await.unwrap();
        a.transport.publish_retained("t/x", "1").await.unwrap();
        a.transport.clear("t/x").await.unwrap();
        assert!(broker.retained("t/x").is_none());
    }

    #[tokio::test]
    async fn kill_publishes_will_but_clean_disconnect_does_not() {
        let broker = MemoryBroker::new();
        let dirty = broker
            .connect(ConnectOptions::new("dirty").with_last_will(will("u1/e1/a/$state")))
            .await
            .unwrap();
        let clean = broker
            .connect(ConnectOptions::new("clean").with_last_will(will("u1/e1/b/$state")))
            .await
            .unwrap();
        drop(dirty);

        assert!(broker.kill("dirty"));
        clean.transport.disconnect().await.unwrap();

        assert_eq!(broker.retained_str("u1/e1/a/$state").as_deref(), Some("lost"));
        assert!(broker.retained("u1/e1/b/$state").is_none());
    }

    #[tokio::test]
    async fn closed_transport_rejects_publish() {
        let broker = MemoryBroker::new();
        let c = broker.connect(ConnectOptions::new("c")).await.unwrap();
        c.transport.disconnect().await.unwrap();
        let err = c.transport.publish_retained("t", "1").await.unwrap_err();
        assert!(matches!(err, BusError::Closed));
    }

    #[tokio::test]
    async fn session_takeover_fires_old_will() {
        let broker = MemoryBroker::new();
        let old = broker
            .connect(ConnectOptions::new("job").with_last_will(will("u1/e1/job/$state")))
            .await
            .unwrap();
        let _new = broker.connect(ConnectOptions::new("job")).await.unwrap();
        assert_eq!(broker.retained_str("u1/e1/job/$state").as_deref(), Some("lost"));
        assert!(old.transport.publish_retained("t", "1").await.is_err());
    }

    #[tokio::test]
    async fn dropped_connection_comes_back_after_its_will() {
        let broker = MemoryBroker::new();
        let mut job = broker
            .connect(ConnectOptions::new("job").with_last_will(will("u1/e1/job/$state")))
            .await
            .unwrap();
        job.transport
            .subscribe("u1/e1/job/+/set", Qos::AtLeastOnce)
            .await
            .unwrap();
        job.transport.publish_retained("u1/e1/job/$state", "ready").await.unwrap();

        assert!(broker.drop_and_reconnect("job"));
        assert!(!broker.drop_and_reconnect("nobody"));
        assert_eq!(broker.retained_str("u1/e1/job/$state").as_deref(), Some("lost"));
        assert!(job.reconnects.has_changed().unwrap());
        assert_eq!(*job.reconnects.borrow_and_update(), 1);

        // same session: still subscribed, still publishing, will still armed
        broker.inject("u1/e1/job/$state/set", b"sleeping", false);
        assert_eq!(job.inbox.recv().await.unwrap().topic, "u1/e1/job/$state/set");
        job.transport.publish_retained("u1/e1/job/$state", "ready").await.unwrap();
        assert!(broker.has_will("job"));
        assert!(broker.kill("job"));
        assert_eq!(broker.retained_str("u1/e1/job/$state").as_deref(), Some("lost"));
    }

    #[tokio::test]
    async fn wildcard_routing_skips_non_matching() {
        let broker = MemoryBroker::new();
        let mut sub = broker.connect(ConnectOptions::new("sub")).await.unwrap();
        sub.transport
            .subscribe("u1/+/+/$state", Qos::AtLeastOnce)
            .await
            .unwrap();
        broker.inject("u2/e1/stirring/$state", b"ready", false);
        broker.inject("u1/e1/stirring/$state", b"ready", false);
        let m = sub.inbox.recv().await.unwrap();
        assert_eq!(m.topic, "u1/e1/stirring/$state");
        assert!(sub.inbox.try_recv().is_err());
    }
}
