//! Receiver-side view of the leader's cluster topics.
//!
//! The leader publishes retained documents under `_cluster/`. Every job
//! connection keeps a [`ClusterView`] current from them and consults it when a
//! message addressed with `$broadcast` or `$experiment` is delivered, so the
//! tokens are always resolved against the state at delivery time.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::pubsub::{ConnectOptions, Connector, Message, Qos};
use crate::topic::{
    config_target, unit_config_topic, BROADCAST, CONFIG_SHARED, EXPERIMENT, INVENTORY,
    LATEST_EXPERIMENT,
};

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub units: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn is_active(&self, unit: &str) -> bool {
        self.units.iter().any(|u| u.name == unit && u.active)
    }

    pub fn active_units(&self) -> impl Iterator<Item = &str> {
        self.units.iter().filter(|u| u.active).map(|u| u.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestExperiment {
    pub experiment: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ClusterState {
    inventory: Option<Inventory>,
    latest: Option<LatestExperiment>,
    shared_config: Option<toml::Value>,
    unit_config: Option<toml::Value>,
}

/// Cheaply cloneable; clones share state.
#[derive(Debug, Clone)]
pub struct ClusterView {
    unit: String,
    inner: Arc<RwLock<ClusterState>>,
}

impl ClusterView {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            inner: Arc::default(),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    fn read(&self) -> RwLockReadGuard<'_, ClusterState> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClusterState> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Filters a connection subscribes to in order to keep the view current.
    pub fn filters(&self) -> Vec<String> {
        vec![
            CONFIG_SHARED.to_string(),
            unit_config_topic(&self.unit),
            INVENTORY.to_string(),
            LATEST_EXPERIMENT.to_string(),
        ]
    }

    pub fn inventory(&self) -> Option<Inventory> {
        self.read().inventory.clone()
    }

    pub fn latest_experiment(&self) -> Option<String> {
        self.read().latest.as_ref().map(|l| l.experiment.clone())
    }

    pub fn set_inventory(&self, inv: Inventory) {
        self.write().inventory = Some(inv);
    }

    pub fn set_latest_experiment(&self, latest: LatestExperiment) {
        self.write().latest = Some(latest);
    }

    /// Whether this unit counts as active. Before any inventory has been
    /// seen (a unit running standalone) every unit is active.
    pub fn is_active(&self) -> bool {
        self.read()
            .inventory
            .as_ref()
            .map_or(true, |inv| inv.is_active(&self.unit))
    }

    /// Resolve a delivered topic's unit and experiment tokens against the
    /// current cluster state. `experiment` is the receiving job's own.
    ///
    /// `$broadcast` reaches this unit only while it is active in the
    /// inventory; `$experiment` matches only while `experiment` is the latest
    /// one. With no experiment document yet, `$experiment` matches.
    pub fn addressed_to(&self, unit_token: &str, experiment_token: &str, experiment: &str) -> bool {
        let unit_ok = if unit_token == BROADCAST {
            self.is_active()
        } else {
            unit_token == self.unit
        };
        if !unit_ok {
            return false;
        }
        if experiment_token == EXPERIMENT {
            self.read()
                .latest
                .as_ref()
                .map_or(true, |l| l.experiment == experiment)
        } else {
            experiment_token == experiment
        }
    }

    /// Fold a `_cluster/...` message into the view. Returns false for topics
    /// that are not cluster documents. Malformed documents are logged and
    /// leave the previous value in place; a cleared retained topic removes it.
    pub fn apply(&self, msg: &Message) -> bool {
        if msg.topic == INVENTORY {
            if msg.is_clear() {
                self.write().inventory = None;
            } else {
                match serde_json::from_slice::<Inventory>(&msg.payload) {
                    Ok(inv) => self.set_inventory(inv),
                    Err(e) => warn!(topic = %msg.topic, "ignoring malformed inventory: {e}"),
                }
            }
            return true;
        }
        if msg.topic == LATEST_EXPERIMENT {
            if msg.is_clear() {
                self.write().latest = None;
            } else {
                match serde_json::from_slice::<LatestExperiment>(&msg.payload) {
                    Ok(l) => {
                        debug!(experiment = %l.experiment, "latest experiment");
                        self.set_latest_experiment(l);
                    }
                    Err(e) => warn!(topic = %msg.topic, "ignoring malformed experiment: {e}"),
                }
            }
            return true;
        }
        match config_target(&msg.topic) {
            Some(target) if target == BROADCAST || target == self.unit => {
                let layer = if msg.is_clear() {
                    None
                } else {
                    match toml::from_str::<toml::Value>(&msg.payload_str()) {
                        Ok(v) => Some(v),
                        Err(e) => {
                            warn!(topic = %msg.topic, "ignoring malformed config layer: {e}");
                            return true;
                        }
                    }
                };
                let mut st = self.write();
                if target == BROADCAST {
                    st.shared_config = layer;
                } else {
                    st.unit_config = layer;
                }
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Config layers received from the leader: (shared, unit override).
    pub fn config_layers(&self) -> (Option<toml::Value>, Option<toml::Value>) {
        let st = self.read();
        (st.shared_config.clone(), st.unit_config.clone())
    }
}

/// Collect the retained cluster documents for `unit` on a short-lived
/// connection. Retained messages arrive straight after the subscribe, so
/// `settle` only needs to cover one broker round trip.
pub async fn fetch(
    connector: &dyn Connector,
    unit: &str,
    settle: Duration,
) -> Result<ClusterView, BusError> {
    let view = ClusterView::new(unit);
    let client_id = format!("{unit}-cluster-{}", std::process::id());
    let mut conn = connector.connect(ConnectOptions::new(client_id)).await?;
    for filter in view.filters() {
        conn.transport.subscribe(&filter, Qos::AtLeastOnce).await?;
    }

    let deadline = tokio::time::Instant::now() + settle;
    while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, conn.inbox.recv()).await {
        view.apply(&msg);
    }
    conn.transport.disconnect().await?;
    Ok(view)
}

// ===========================================================================
// Tests
// ===========================================================================
