use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use vessel_unit::pubsub::{Message, Qos, SharedTransport};
use vessel_unit::state::JobState;
use vessel_unit::topic::{TopicPath, EXPERIMENT_SET, STATE};

use crate::experiments::Experiments;
use crate::state::SharedState;

/// What the leader listens to: every job's state, warnings and errors from
/// unit logs, and requests for a new experiment.
pub const SUBSCRIPTIONS: [&str; 3] = ["+/+/+/$state", "+/+/logs/+/+", EXPERIMENT_SET];

/// Log levels that make it into the event ring.
const RECORDED_LEVELS: [&str; 4] = ["NOTICE", "WARNING", "ERROR", "CRITICAL"];

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct LogMsg {
    pub(crate) message: String,
}

#[derive(Debug, Deserialize)]
struct ExperimentMsg {
    experiment: String,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Inbound<'a> {
    State {
        unit: &'a str,
        experiment: &'a str,
        job: &'a str,
        /// `None` when the retained state was cleared.
        state: Option<JobState>,
    },
    Log {
        unit: &'a str,
        level: &'a str,
        message: String,
    },
    NewExperiment(String),
    Ignored,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Accept a bare name or `{"experiment": "<name>"}`.
pub(crate) fn parse_experiment_request(payload: &[u8]) -> Result<String, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    if s.starts_with('{') {
        return serde_json::from_str::<ExperimentMsg>(s)
            .map(|m| m.experiment)
            .map_err(|e| format!("bad experiment request: {e}"));
    }
    if s.is_empty() {
        return Err("empty experiment request".into());
    }
    Ok(s.trim_matches('"').to_string())
}

pub(crate) fn classify(msg: &Message) -> Result<Inbound<'_>, String> {
    if msg.topic == EXPERIMENT_SET {
        return parse_experiment_request(&msg.payload).map(Inbound::NewExperiment);
    }
    let Some(path) = TopicPath::parse(&msg.topic) else {
        return Ok(Inbound::Ignored);
    };
    if path.attribute == STATE && !path.set {
        let state = if msg.is_clear() {
            None
        } else {
            Some(
                msg.payload_str()
                    .parse::<JobState>()
                    .map_err(|_| format!("bad state '{}' on {}", msg.payload_str(), msg.topic))?,
            )
        };
        return Ok(Inbound::State {
            unit: path.unit,
            experiment: path.experiment,
            job: path.job,
            state,
        });
    }
    if path.job == "logs" {
        // attribute is `<task>/<level>`
        let level = msg.topic.rsplit('/').next().unwrap_or_default();
        if !RECORDED_LEVELS.contains(&level) || msg.retain {
            return Ok(Inbound::Ignored);
        }
        let log: LogMsg = serde_json::from_slice(&msg.payload)
            .map_err(|e| format!("bad log record on {}: {e}", msg.topic))?;
        return Ok(Inbound::Log {
            unit: path.unit,
            level,
            message: log.message,
        });
    }
    Ok(Inbound::Ignored)
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

pub struct Leader {
    pub transport: SharedTransport,
    pub experiments: Experiments,
    pub state: SharedState,
}

impl Leader {
    pub async fn subscribe(&self) -> anyhow::Result<()> {
        for filter in SUBSCRIPTIONS {
            self.transport.subscribe(filter, Qos::AtLeastOnce).await?;
        }
        info!("leader subscribed to {}", SUBSCRIPTIONS.join(", "));
        Ok(())
    }

    pub async fn handle(&mut self, msg: &Message) {
        let inbound = match classify(msg) {
            Ok(i) => i,
            Err(e) => {
                warn!("{e}");
                self.state.write().await.record_error(e);
                return;
            }
        };
        match inbound {
            Inbound::State {
                unit,
                experiment,
                job,
                state,
            } => {
                debug!(%unit, %experiment, %job, ?state, "job state");
                self.state
                    .write()
                    .await
                    .record_state(unit, experiment, job, state);
            }
            Inbound::Log {
                unit,
                level,
                message,
            } => {
                self.state.write().await.record_log(unit, level, &message);
            }
            Inbound::NewExperiment(_) if msg.retain => {
                debug!("ignoring retained experiment request");
            }
            Inbound::NewExperiment(name) => match self.experiments.create(&name).await {
                Ok(latest) => {
                    if let Err(e) = self.experiments.publish(self.transport.as_ref()).await {
                        warn!("failed to publish latest experiment: {e:#}");
                    }
                    self.state.write().await.record_experiment(latest);
                }
                Err(e) => {
                    warn!("experiment request refused: {e:#}");
                    self.state.write().await.record_error(format!("{e:#}"));
                }
            },
            Inbound::Ignored => {}
        }
    }

    /// Handle messages until the connection's inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Message>) {
        self.state.write().await.bus_connected = true;
        while let Some(msg) = inbox.recv().await {
            self.handle(&msg).await;
        }
        let mut st = self.state.write().await;
        st.bus_connected = false;
        st.record_error("bus connection closed".to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::RwLock;
    use vessel_unit::cache::Cache;
    use vessel_unit::cluster::{Inventory, InventoryEntry, LatestExperiment};
    use vessel_unit::pubsub::memory::MemoryBroker;
    use vessel_unit::pubsub::{ConnectOptions, Connector, LastWill};
    use vessel_unit::topic::LATEST_EXPERIMENT;

    use crate::state::{ClusterState, EventKind};

    fn msg(topic: &str, payload: &str) -> Message {
        Message {
            topic: topic.into(),
            payload: payload.as_bytes().to_vec(),
            retain: false,
        }
    }

    // -- parse_experiment_request -------------------------------------------

    #[test]
    fn experiment_request_plain_name() {
        assert_eq!(parse_experiment_request(b" exp2\n").unwrap(), "exp2");
    }

    #[test]
    fn experiment_request_json() {
        assert_eq!(
            parse_experiment_request(br#"{"experiment": "exp3"}"#).unwrap(),
            "exp3"
        );
    }

    #[test]
    fn experiment_request_empty_or_malformed() {
        assert!(parse_experiment_request(b"").is_err());
        assert!(parse_experiment_request(b"{\"name\": 1}").is_err());
    }

    // -- classify -----------------------------------------------------------

    #[test]
    fn classify_state() {
        let m = msg("unit1/exp1/stirring/$state", "lost");
        assert_eq!(
            classify(&m).unwrap(),
            Inbound::State {
                unit: "unit1",
                experiment: "exp1",
                job: "stirring",
                state: Some(JobState::Lost)
            }
        );
    }

    #[test]
    fn classify_cleared_state() {
        let m = msg("unit1/exp1/stirring/$state", "");
        assert!(matches!(classify(&m).unwrap(), Inbound::State { state: None, .. }));
    }

    #[test]
    fn classify_bad_state() {
        assert!(classify(&msg("unit1/exp1/stirring/$state", "spinning")).is_err());
    }

    #[test]
    fn classify_logs_by_level() {
        let payload = r#"{"message":"pump stalled","task":"dosing_automation","level":"ERROR","timestamp":"t"}"#;
        let m = msg("unit1/exp1/logs/dosing_automation/ERROR", payload);
        assert_eq!(
            classify(&m).unwrap(),
            Inbound::Log {
                unit: "unit1",
                level: "ERROR",
                message: "pump stalled".into()
            }
        );
        let m = msg("unit1/exp1/logs/dosing_automation/INFO", payload);
        assert_eq!(classify(&m).unwrap(), Inbound::Ignored);
    }

    #[test]
    fn classify_other_topics_ignored() {
        assert_eq!(classify(&msg("unit1/exp1/stirring/duty_cycle", "40")).unwrap(), Inbound::Ignored);
        assert_eq!(classify(&msg("_cluster/inventory", "{}")).unwrap(), Inbound::Ignored);
    }

    // -- Leader -------------------------------------------------------------

    async fn leader(broker: &MemoryBroker) -> (Leader, mpsc::Receiver<Message>) {
        let conn = broker.connect(ConnectOptions::new("leader")).await.unwrap();
        let inv = Inventory {
            units: vec![InventoryEntry { name: "unit1".into(), active: true }],
        };
        let leader = Leader {
            transport: conn.transport,
            experiments: Experiments::open(Cache::in_memory().await.unwrap()).await.unwrap(),
            state: Arc::new(RwLock::new(ClusterState::new(&inv))),
        };
        leader.subscribe().await.unwrap();
        (leader, conn.inbox)
    }

    #[tokio::test]
    async fn experiment_request_publishes_latest() {
        let broker = MemoryBroker::new();
        let (mut leader, _inbox) = leader(&broker).await;
        leader.handle(&msg(EXPERIMENT_SET, "exp2")).await;
        let doc: LatestExperiment =
            serde_json::from_str(&broker.retained_str(LATEST_EXPERIMENT).unwrap()).unwrap();
        assert_eq!(doc.experiment, "exp2");
        assert_eq!(
            leader.state.read().await.latest_experiment.as_ref().unwrap().experiment,
            "exp2"
        );

        leader.handle(&msg(EXPERIMENT_SET, "exp2")).await;
        let st = leader.state.read().await;
        assert_eq!(st.events.back().unwrap().kind, EventKind::Error);
    }

    #[tokio::test]
    async fn last_will_shows_up_as_lost() {
        let broker = MemoryBroker::new();
        let (leader, inbox) = leader(&broker).await;
        let state = leader.state.clone();
        tokio::spawn(leader.run(inbox));

        let job = broker
            .connect(ConnectOptions::new("unit1_stirring_exp1").with_last_will(LastWill {
                topic: "unit1/exp1/stirring/$state".into(),
                payload: b"lost".to_vec(),
                retain: true,
                qos: Qos::AtLeastOnce,
            }))
            .await
            .unwrap();
        job.transport
            .publish_retained("unit1/exp1/stirring/$state", "ready")
            .await
            .unwrap();
        broker.kill("unit1_stirring_exp1");

        for _ in 0..200 {
            let seen = state
                .read()
                .await
                .units
                .get("unit1")
                .and_then(|u| u.jobs.get("exp1/stirring"))
                .map(|j| j.state);
            if seen == Some(JobState::Lost) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("leader never saw the job as lost");
    }
}
