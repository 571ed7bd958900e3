use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use vessel_unit::cluster::{Inventory, LatestExperiment};
use vessel_unit::state::JobState;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<ClusterState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct ClusterState {
    pub started_at: Instant,
    pub bus_connected: bool,
    pub latest_experiment: Option<LatestExperiment>,
    pub units: BTreeMap<String, UnitState>,
    pub events: VecDeque<ClusterEvent>,
}

#[derive(Clone, Default, Serialize)]
pub struct UnitState {
    /// Listed in the inventory and active. Units never listed but seen on
    /// the bus show up with `active = false`.
    pub active: bool,
    /// Keyed `<experiment>/<job>`.
    pub jobs: BTreeMap<String, JobStatus>,
}

#[derive(Clone, Serialize)]
pub struct JobStatus {
    pub experiment: String,
    pub job: String,
    pub state: JobState,
    #[serde(with = "time::serde::rfc3339")]
    pub since: OffsetDateTime,
}

#[derive(Clone, Serialize)]
pub struct ClusterEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    State,
    Log,
    Experiment,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub bus_connected: bool,
    pub latest_experiment: Option<String>,
    pub units: BTreeMap<String, UnitState>,
    pub events: Vec<ClusterEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl ClusterState {
    pub fn new(inventory: &Inventory) -> Self {
        let mut st = Self {
            started_at: Instant::now(),
            bus_connected: false,
            latest_experiment: None,
            units: BTreeMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        };
        st.set_inventory(inventory);
        st
    }

    pub fn set_inventory(&mut self, inventory: &Inventory) {
        for u in self.units.values_mut() {
            u.active = false;
        }
        for entry in &inventory.units {
            self.units.entry(entry.name.clone()).or_default().active = entry.active;
        }
    }

    /// Record a job's published `$state`. A cleared state means the job
    /// identity is gone and is dropped from the snapshot.
    pub fn record_state(&mut self, unit: &str, experiment: &str, job: &str, state: Option<JobState>) {
        let key = format!("{experiment}/{job}");
        let jobs = &mut self.units.entry(unit.to_string()).or_default().jobs;
        let Some(state) = state else {
            jobs.remove(&key);
            return;
        };
        if jobs.get(&key).is_some_and(|j| j.state == state) {
            return;
        }
        jobs.insert(
            key,
            JobStatus {
                experiment: experiment.to_string(),
                job: job.to_string(),
                state,
                since: OffsetDateTime::now_utc(),
            },
        );
        let kind = if state == JobState::Lost {
            EventKind::Error
        } else {
            EventKind::State
        };
        self.push_event(kind, format!("{unit}/{experiment}/{job} is {state}"));
    }

    pub fn record_log(&mut self, unit: &str, level: &str, message: &str) {
        self.push_event(EventKind::Log, format!("{unit} {level}: {message}"));
    }

    pub fn record_experiment(&mut self, latest: LatestExperiment) {
        self.push_event(
            EventKind::Experiment,
            format!("experiment {} started", latest.experiment),
        );
        self.latest_experiment = Some(latest);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            bus_connected: self.bus_connected,
            latest_experiment: self.latest_experiment.as_ref().map(|l| l.experiment.clone()),
            units: self.units.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(ClusterEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
