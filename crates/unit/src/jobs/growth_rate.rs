//! Growth-rate estimation from OD batches.
//!
//! The first readings of an experiment fix a per-channel baseline (their
//! mean), persisted so a restarted job normalises the same way. Normalised
//! readings feed a Kalman filter over OD, growth rate and acceleration;
//! dosing events open a window in which a step change in OD is expected.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::json;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::config::KalmanConfig;
use crate::error::Result;
use crate::estimators::kalman::{GrowthRateFilter, KalmanParams};
use crate::job::{Job, JobContext};
use crate::jobs::od_reading::{OdBatch, OdReading};
use crate::pubsub::Message;
use crate::settings::{Datatype, SettingSpec};
use crate::topic::JobIdentity;

static GROWTH_RATE_SETTINGS: [SettingSpec; 3] = [
    SettingSpec::new("growth_rate", Datatype::Float).with_unit("h⁻¹"),
    SettingSpec::new("od_filtered", Datatype::Float),
    SettingSpec::new("kalman_filter_outputs", Datatype::Json),
];

pub const DOSING_EVENTS: &str = "dosing_events";

fn baseline_key(identity: &JobIdentity) -> String {
    format!("od_baseline/{}/{}", identity.unit, identity.experiment)
}

pub struct GrowthRateCalculating {
    params: KalmanParams,
    samples_needed: usize,
    baseline: Option<BTreeMap<String, f64>>,
    collecting: BTreeMap<String, Vec<f64>>,
    filter: Option<GrowthRateFilter>,
    last_timestamp: Option<OffsetDateTime>,
}

impl GrowthRateCalculating {
    pub fn new(config: &KalmanConfig) -> Self {
        Self {
            params: KalmanParams::from(config),
            samples_needed: config.samples_for_od_statistics.max(1),
            baseline: None,
            collecting: BTreeMap::new(),
            filter: None,
            last_timestamp: None,
        }
    }

    /// Collect a batch toward the baseline. Returns the baseline once every
    /// channel has enough readings.
    fn collect(&mut self, batch: &OdBatch) -> Option<BTreeMap<String, f64>> {
        for (channel, sample) in &batch.ods {
            self.collecting
                .entry(channel.clone())
                .or_default()
                .push(sample.od);
        }
        if self.collecting.values().any(|v| v.len() < self.samples_needed) {
            return None;
        }
        let baseline = std::mem::take(&mut self.collecting)
            .into_iter()
            .map(|(ch, v)| {
                let mean = v.iter().sum::<f64>() / v.len() as f64;
                (ch, mean)
            })
            .collect();
        Some(baseline)
    }

    fn normalise(baseline: &BTreeMap<String, f64>, batch: &OdBatch) -> Vec<f64> {
        batch
            .ods
            .iter()
            .filter_map(|(ch, s)| {
                let base = *baseline.get(ch)?;
                (base > 0.0).then(|| s.od / base)
            })
            .collect()
    }

    async fn on_batch(&mut self, ctx: &mut JobContext, batch: OdBatch) -> Result<()> {
        if let Some(last) = self.last_timestamp {
            if batch.timestamp <= last {
                warn!(timestamp = %batch.timestamp, "out-of-order od batch ignored");
                return Ok(());
            }
        }
        let dt_hours = self
            .last_timestamp
            .map(|last| (batch.timestamp - last).as_seconds_f64() / 3600.0);
        self.last_timestamp = Some(batch.timestamp);

        if self.baseline.is_none() {
            let Some(baseline) = self.collect(&batch) else {
                return Ok(());
            };
            ctx.caches
                .persistent
                .set_json(&baseline_key(&ctx.identity), &baseline)
                .await?;
            info!(?baseline, "od baseline set");
            self.baseline = Some(baseline);
        }
        let Some(baseline) = self.baseline.as_ref() else {
            return Ok(());
        };

        let observations = Self::normalise(baseline, &batch);
        if observations.is_empty() {
            warn!("od batch has no channel with a baseline");
            return Ok(());
        }
        let state = match self.filter.as_mut() {
            Some(f) => f.update(&observations, dt_hours.unwrap_or(0.0)),
            None => {
                let initial = observations.iter().sum::<f64>() / observations.len() as f64;
                let f = self.filter.insert(GrowthRateFilter::new(self.params, initial));
                f.state()
            }
        };

        ctx.settings.set("growth_rate", state.growth_rate)?;
        ctx.settings.set("od_filtered", state.od_filtered)?;
        let covariance = self.filter.as_ref().map(|f| f.covariance());
        ctx.settings.set(
            "kalman_filter_outputs",
            json!({
                "state": [state.od_filtered, state.growth_rate, state.acceleration],
                "covariance": covariance,
                "timestamp": batch.timestamp.unix_timestamp(),
            }),
        )?;
        Ok(())
    }
}

#[async_trait]
impl Job for GrowthRateCalculating {
    const NAME: &'static str = "growth_rate_calculating";

    fn settings() -> &'static [SettingSpec] {
        &GROWTH_RATE_SETTINGS
    }

    fn subscriptions(&self, identity: &JobIdentity) -> Vec<String> {
        vec![
            identity.sibling(OdReading::NAME).topic("ods"),
            format!("{}/{}/{DOSING_EVENTS}", identity.unit, identity.experiment),
        ]
    }

    fn clear_on_disconnect(&self) -> bool {
        true
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.baseline = ctx
            .caches
            .persistent
            .get_json(&baseline_key(&ctx.identity))
            .await?;
        if let Some(b) = &self.baseline {
            info!(baseline = ?b, "reusing od baseline");
        }
        Ok(())
    }

    async fn on_message(&mut self, ctx: &mut JobContext, msg: &Message) -> Result<()> {
        if msg.topic.ends_with(DOSING_EVENTS) {
            if let Some(f) = self.filter.as_mut() {
                debug!("dosing event, widening od noise");
                f.dosing_event();
            }
            return Ok(());
        }
        // A retained batch predates this job.
        if msg.retain || msg.is_clear() {
            return Ok(());
        }
        let batch: OdBatch = serde_json::from_slice(&msg.payload)?;
        self.on_batch(ctx, batch).await
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache::Caches;
    use crate::cluster::ClusterView;
    use crate::config::Config;
    use crate::hardware::NullHardware;
    use crate::job::JobEnv;
    use crate::jobs::od_reading::OdSample;
    use crate::pubsub::memory::MemoryBroker;

    const ODS: &str = "unit1/exp1/od_reading/ods";

    async fn env(broker: &MemoryBroker, caches: Caches) -> JobEnv {
        JobEnv {
            unit: "unit1".into(),
            experiment: "exp1".into(),
            connector: Arc::new(broker.clone()),
            caches,
            config: Arc::new(Config::default()),
            cluster: ClusterView::new("unit1"),
            hardware: Arc::new(NullHardware),
        }
    }

    fn batch(secs: i64, od: f64) -> Vec<u8> {
        let ts = OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(1_700_000_000 + secs);
        let b = OdBatch {
            ods: [(
                "2".to_string(),
                OdSample {
                    od,
                    angle: "90".into(),
                    channel: 2,
                    timestamp: ts,
                },
            )]
            .into(),
            timestamp: ts,
        };
        serde_json::to_vec(&b).unwrap()
    }

    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_for_timestamp(broker: &MemoryBroker, ts: i64) {
        for _ in 0..200 {
            let latest = broker
                .retained_str("unit1/exp1/growth_rate_calculating/kalman_filter_outputs")
                .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
                .and_then(|v| v["timestamp"].as_i64());
            if latest == Some(ts) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("no filter output for {ts}");
    }

    fn config(samples: usize) -> KalmanConfig {
        KalmanConfig {
            samples_for_od_statistics: samples,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn estimates_exponential_growth() {
        let broker = MemoryBroker::new();
        let env = env(&broker, Caches::in_memory().await.unwrap()).await;
        let handle = env.start(GrowthRateCalculating::new(&config(5))).await.unwrap();

        // 0.3 per hour, one batch every 5 s for 2 h
        for i in 0..1440 {
            let t = i as f64 * 5.0 / 3600.0;
            broker.inject(ODS, &batch(i * 5, 0.1 * (0.3 * t).exp()), false);
            if i % 10 == 0 {
                settle().await;
            }
        }
        wait_for_timestamp(&broker, 1_700_000_000 + 1439 * 5).await;

        let rate: f64 = broker
            .retained_str("unit1/exp1/growth_rate_calculating/growth_rate")
            .unwrap()
            .parse()
            .unwrap();
        assert!((rate - 0.3).abs() < 0.05, "growth rate {rate}");
        let outputs: serde_json::Value = serde_json::from_str(
            &broker
                .retained_str("unit1/exp1/growth_rate_calculating/kalman_filter_outputs")
                .unwrap(),
        )
        .unwrap();
        assert_eq!(outputs["state"].as_array().unwrap().len(), 3);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn baseline_survives_a_restart() {
        let broker = MemoryBroker::new();
        let caches = Caches::in_memory().await.unwrap();
        let env = env(&broker, caches.clone()).await;
        let handle = env.start(GrowthRateCalculating::new(&config(3))).await.unwrap();
        for (i, od) in [0.2, 0.2, 0.2].into_iter().enumerate() {
            broker.inject(ODS, &batch(i as i64 * 5, od), false);
        }
        wait_for_timestamp(&broker, 1_700_000_010).await;
        let stored: BTreeMap<String, f64> = caches
            .persistent
            .get_json("od_baseline/unit1/exp1")
            .await
            .unwrap()
            .unwrap();
        assert!((stored["2"] - 0.2).abs() < 1e-12);
        handle.disconnect().await.unwrap();

        // no collection phase the second time: the first batch is filtered
        let handle = env.start(GrowthRateCalculating::new(&config(3))).await.unwrap();
        broker.inject(ODS, &batch(100, 0.4), false);
        wait_for_timestamp(&broker, 1_700_000_100).await;
        let od: f64 = broker
            .retained_str("unit1/exp1/growth_rate_calculating/od_filtered")
            .unwrap()
            .parse()
            .unwrap();
        assert!((od - 2.0).abs() < 1e-9, "normalised od {od}");
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn stale_and_retained_batches_are_ignored() {
        let broker = MemoryBroker::new();
        let env = env(&broker, Caches::in_memory().await.unwrap()).await;
        // replayed on subscribe, from before this job started
        broker.inject(ODS, &batch(20, 5.0), true);
        let handle = env.start(GrowthRateCalculating::new(&config(1))).await.unwrap();
        broker.inject(ODS, &batch(10, 0.5), false);
        broker.inject(ODS, &batch(5, 5.0), false);
        wait_for_timestamp(&broker, 1_700_000_010).await;
        settle().await;
        let od: f64 = broker
            .retained_str("unit1/exp1/growth_rate_calculating/od_filtered")
            .unwrap()
            .parse()
            .unwrap();
        assert!((od - 1.0).abs() < 1e-9);
        handle.disconnect().await.unwrap();
        // cleared on disconnect
        assert!(broker
            .retained_str("unit1/exp1/growth_rate_calculating/od_filtered")
            .is_none());
    }
}
