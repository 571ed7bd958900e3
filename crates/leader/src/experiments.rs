//! Experiments, in creation order. The most recent one is active: it is what
//! `$experiment` resolves to and where newly started jobs publish.

use anyhow::{bail, Result};
use time::OffsetDateTime;
use tracing::info;

use vessel_unit::cache::Cache;
use vessel_unit::cluster::LatestExperiment;
use vessel_unit::pubsub::Transport;
use vessel_unit::topic::{CLUSTER, EXPERIMENT, LATEST_EXPERIMENT};

const CACHE_KEY: &str = "leader/experiments";

pub struct Experiments {
    cache: Cache,
    list: Vec<LatestExperiment>,
}

impl Experiments {
    /// Restore from the leader's persistent cache.
    pub async fn open(cache: Cache) -> Result<Self> {
        let list = cache.get_json(CACHE_KEY).await?.unwrap_or_default();
        Ok(Self { cache, list })
    }

    pub fn latest(&self) -> Option<&LatestExperiment> {
        self.list.last()
    }

    pub fn all(&self) -> &[LatestExperiment] {
        &self.list
    }

    /// Append a new experiment, which becomes the active one. Names are
    /// unique for the life of the cluster.
    pub async fn create(&mut self, name: &str) -> Result<LatestExperiment> {
        let name = name.trim();
        if name.is_empty() {
            bail!("experiment name is empty");
        }
        if name.contains(['/', '+', '#']) || name == EXPERIMENT || name == CLUSTER {
            bail!("experiment name '{name}' is not usable as a topic level");
        }
        if self.list.iter().any(|e| e.experiment == name) {
            bail!("experiment '{name}' already exists");
        }
        let exp = LatestExperiment {
            experiment: name.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        self.list.push(exp.clone());
        self.cache.set_json(CACHE_KEY, &self.list).await?;
        info!(experiment = %name, "new experiment");
        Ok(exp)
    }

    /// Retained `_cluster/experiment/latest`, cleared when there is none.
    pub async fn publish(&self, transport: &dyn Transport) -> Result<()> {
        match self.latest() {
            Some(latest) => {
                transport
                    .publish_retained(LATEST_EXPERIMENT, &serde_json::to_string(latest)?)
                    .await?
            }
            None => transport.clear(LATEST_EXPERIMENT).await?,
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use vessel_unit::pubsub::memory::MemoryBroker;
    use vessel_unit::pubsub::{ConnectOptions, Connector};

    #[tokio::test]
    async fn latest_is_the_most_recent() {
        let mut exps = Experiments::open(Cache::in_memory().await.unwrap()).await.unwrap();
        assert!(exps.latest().is_none());
        exps.create("first").await.unwrap();
        exps.create("second").await.unwrap();
        assert_eq!(exps.latest().unwrap().experiment, "second");
        let names: Vec<_> = exps.all().iter().map(|e| e.experiment.as_str()).collect();
        assert_eq!(names, ["first", "second"]);
    }

    #[tokio::test]
    async fn names_are_unique_and_topic_safe() {
        let mut exps = Experiments::open(Cache::in_memory().await.unwrap()).await.unwrap();
        exps.create("a").await.unwrap();
        assert!(exps.create("a").await.is_err());
        assert!(exps.create("  ").await.is_err());
        assert!(exps.create("x/y").await.is_err());
        assert!(exps.create("$experiment").await.is_err());
        assert_eq!(exps.all().len(), 1);
    }

    #[tokio::test]
    async fn survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leader.sqlite");
        {
            let mut exps = Experiments::open(Cache::open(&path).await.unwrap()).await.unwrap();
            exps.create("first").await.unwrap();
            exps.create("second").await.unwrap();
        }
        let exps = Experiments::open(Cache::open(&path).await.unwrap()).await.unwrap();
        assert_eq!(exps.latest().unwrap().experiment, "second");
        assert_eq!(exps.all().len(), 2);
    }

    #[tokio::test]
    async fn publishes_latest_retained() {
        let broker = MemoryBroker::new();
        let conn = broker.connect(ConnectOptions::new("leader")).await.unwrap();
        let mut exps = Experiments::open(Cache::in_memory().await.unwrap()).await.unwrap();
        exps.publish(conn.transport.as_ref()).await.unwrap();
        assert!(broker.retained_str(LATEST_EXPERIMENT).is_none());

        exps.create("exp1").await.unwrap();
        exps.publish(conn.transport.as_ref()).await.unwrap();
        let doc: LatestExperiment =
            serde_json::from_str(&broker.retained_str(LATEST_EXPERIMENT).unwrap()).unwrap();
        assert_eq!(doc.experiment, "exp1");
    }
}
