//! Dosing automation: runs a dosing strategy against the vial and carries
//! out its dilutions on the media, alt-media and waste pumps.
//!
//! Every pump run is checked against a copy of the planner before the pump
//! starts and committed only after it stops, so the ledger never records
//! volume that was not moved. The ledger, vial volume and alt-media
//! fraction are persisted per experiment and survive a restart.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::cache::holder_tag;
use crate::calibration::{self, Calibration};
use crate::config::{Config, DosingConfig};
use crate::error::{JobError, Result, SetError};
use crate::estimators::dosing::{ul_to_ml, DosingEvent, DosingPlanner, IoAction, Ledger, Pump};
use crate::job::{Job, JobContext};
use crate::jobs::automation::{
    build_dosing, Automation, AutomationEvent, AutomationSpec, Input, Inputs,
};
use crate::jobs::controller::{Controller, ControllerKind};
use crate::jobs::growth_rate::{GrowthRateCalculating, DOSING_EVENTS};
use crate::jobs::od_reading::{OdBatch, OdReading};
use crate::pubsub::Message;
use crate::settings::{Datatype, SettingSpec};
use crate::topic::JobIdentity;

static DOSING_SETTINGS: [SettingSpec; 12] = [
    SettingSpec::new("automation_name", Datatype::String),
    SettingSpec::new("automation_settings", Datatype::Json),
    SettingSpec::new("latest_event", Datatype::Json),
    SettingSpec::new("alt_media_fraction", Datatype::Float),
    SettingSpec::new("vial_volume", Datatype::Float).with_unit("mL"),
    SettingSpec::new("media_throughput", Datatype::Float).with_unit("mL"),
    SettingSpec::new("alt_media_throughput", Datatype::Float).with_unit("mL"),
    SettingSpec::new("waste_throughput", Datatype::Float).with_unit("mL"),
    SettingSpec::new("target_alt_media_fraction", Datatype::Float).settable(),
    SettingSpec::new("target_od", Datatype::Float).settable(),
    SettingSpec::new("volume", Datatype::Float)
        .settable()
        .with_unit("mL"),
    SettingSpec::new("manual_dose", Datatype::Json).settable(),
];

/// Persisted between runs of the same experiment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DosingState {
    pub ledger: Ledger,
    pub vial_volume_ml: f64,
    pub alt_media_fraction: f64,
    pub target_alt_media_fraction: f64,
}

impl DosingState {
    fn of(planner: &DosingPlanner) -> Self {
        Self {
            ledger: planner.ledger(),
            vial_volume_ml: planner.vial_volume_ml(),
            alt_media_fraction: planner.alt_media_fraction(),
            target_alt_media_fraction: planner.target_alt_fraction(),
        }
    }
}

fn state_key(identity: &JobIdentity) -> String {
    format!("dosing/{}/{}", identity.unit, identity.experiment)
}

/// Payload of a `manual_dose` set.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManualDose {
    event: String,
    volume: f64,
}

pub struct DosingAutomation {
    automation: Box<dyn Automation>,
    config: DosingConfig,
    max_volume_ml: f64,
    planner: DosingPlanner,
    calibrations: HashMap<Pump, Calibration>,
    inputs: Inputs,
    last_run: Option<Instant>,
}

impl DosingAutomation {
    pub fn from_spec(spec: &AutomationSpec, config: &Config) -> Result<Self> {
        let automation = build_dosing(spec)?;
        let b = &config.bioreactor;
        let planner = DosingPlanner::new(
            b.initial_alt_media_fraction,
            config.dosing_automation.max_subdose_ml,
            b.max_volume_ml,
            b.initial_volume_ml,
            b.initial_alt_media_fraction,
        )?;
        Ok(Self {
            automation,
            config: config.dosing_automation.clone(),
            max_volume_ml: b.max_volume_ml,
            planner,
            calibrations: HashMap::new(),
            inputs: Inputs::default(),
            last_run: None,
        })
    }

    fn publish_planner(&self, ctx: &mut JobContext) -> Result<()> {
        let p = &self.planner;
        let ledger = p.ledger();
        ctx.settings.set("alt_media_fraction", p.alt_media_fraction())?;
        ctx.settings.set("vial_volume", p.vial_volume_ml())?;
        ctx.settings.set("media_throughput", ul_to_ml(ledger.media_ul))?;
        ctx.settings
            .set("alt_media_throughput", ul_to_ml(ledger.alt_media_ul))?;
        ctx.settings.set("waste_throughput", ul_to_ml(ledger.waste_ul))?;
        ctx.settings
            .set("target_alt_media_fraction", p.target_alt_fraction())?;
        Ok(())
    }

    fn publish_automation(&self, ctx: &mut JobContext) -> Result<()> {
        let settings = self.automation.settings();
        for name in ["target_od", "volume"] {
            if let Some(v) = settings.get(name) {
                ctx.settings.set(name, v.clone())?;
            }
        }
        ctx.settings.set("automation_name", self.automation.name())?;
        ctx.settings.set("automation_settings", settings)?;
        Ok(())
    }

    async fn calibration(&mut self, ctx: &JobContext, pump: Pump) -> Result<Calibration> {
        if let Some(c) = self.calibrations.get(&pump) {
            return Ok(c.clone());
        }
        let c = calibration::require_active(&ctx.caches.persistent, pump.device()).await?;
        self.calibrations.insert(pump, c.clone());
        Ok(c)
    }

    /// Run `actions` in order. Stops at the first failure; everything before
    /// it stays recorded. A pause or stop requested meanwhile ends the run
    /// after the sub-dose in progress, once its waste is removed.
    async fn run_actions(
        &mut self,
        ctx: &mut JobContext,
        actions: Vec<IoAction>,
        source: &str,
    ) -> Result<()> {
        let mut actions = actions.into_iter().peekable();
        while let Some(action) = actions.next() {
            let mut next = self.planner.clone();
            next.apply(&action)?;

            let cal = self.calibration(ctx, action.pump).await?;
            let mut secs = cal.ml_to_duration(action.volume_ml())?;
            if action.pump == Pump::Waste {
                secs *= self.config.waste_pump_overdrive;
            }
            let device = action.pump.device();
            let lock = ctx
                .caches
                .intermittent
                .try_lock(&format!("pump/{device}"), &holder_tag(Self::NAME))
                .await?;
            let mut pump = ctx.hardware.pump(action.pump)?;
            pump.start()?;
            tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            let stopped = pump.stop();
            lock.release().await?;
            stopped?;

            self.planner = next;
            info!(pump = device, volume_ml = action.volume_ml(), source, "dosed");
            ctx.publish_event(DOSING_EVENTS, &DosingEvent::from_action(&action, source))
                .await?;
            ctx.caches
                .persistent
                .set_json(&state_key(&ctx.identity), &DosingState::of(&self.planner))
                .await?;
            self.publish_planner(ctx)?;

            if action.pump == Pump::Waste && actions.peek().is_some() {
                if let Some(requested) = ctx.interruption() {
                    let left: f64 = actions.map(|a| a.volume_ml()).sum();
                    info!(%requested, left_ml = left, source, "dosing run cut short");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn manual_dose(&mut self, ctx: &mut JobContext, value: Value) -> Result<()> {
        let dose: ManualDose = serde_json::from_value(value).map_err(|e| SetError::OutOfRange {
            name: "manual_dose".into(),
            reason: e.to_string(),
        })?;
        let actions = match dose.event.as_str() {
            "add_media" => self.planner.plan_exchange(dose.volume)?,
            "add_alt_media" => self.planner.plan_single(Pump::AltMedia, dose.volume)?,
            "remove_waste" => self.planner.plan_single(Pump::Waste, dose.volume)?,
            other => {
                return Err(JobError::InvalidArgument(format!(
                    "unknown dosing event '{other}'"
                )))
            }
        };
        self.run_actions(ctx, actions, "manually").await
    }

    fn record_input(&mut self, msg: &Message) -> Result<()> {
        let now = Instant::now();
        if msg.topic.ends_with("/ods") {
            let batch: OdBatch = serde_json::from_slice(&msg.payload)?;
            if let Some(od) = batch.mean_od() {
                self.inputs.set(Input::Od, od, now);
            }
        } else if let Ok(rate) = msg.payload_str().parse::<f64>() {
            self.inputs.set(Input::GrowthRate, rate, now);
        }
        Ok(())
    }
}

#[async_trait]
impl Job for DosingAutomation {
    const NAME: &'static str = "dosing_automation";

    fn settings() -> &'static [SettingSpec] {
        &DOSING_SETTINGS
    }

    fn period(&self) -> Option<Duration> {
        Some(self.automation.period())
    }

    /// Pumping takes as long as it takes.
    fn tick_budget(&self) -> Option<Duration> {
        None
    }

    fn subscriptions(&self, identity: &JobIdentity) -> Vec<String> {
        vec![
            identity.sibling(OdReading::NAME).topic("ods"),
            identity
                .sibling(GrowthRateCalculating::NAME)
                .topic("growth_rate"),
        ]
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        let stored: Option<DosingState> = ctx
            .caches
            .persistent
            .get_json(&state_key(&ctx.identity))
            .await?;
        if let Some(s) = stored {
            info!(
                vial_volume_ml = s.vial_volume_ml,
                alt_media_fraction = s.alt_media_fraction,
                "resuming dosing state"
            );
            self.planner = DosingPlanner::new(
                s.target_alt_media_fraction,
                self.config.max_subdose_ml,
                self.max_volume_ml,
                s.vial_volume_ml,
                s.alt_media_fraction,
            )?
            .with_ledger(s.ledger);
        }
        if self.automation.name() != "silent" {
            for pump in [Pump::Media, Pump::AltMedia, Pump::Waste] {
                self.calibration(ctx, pump).await?;
            }
        }
        self.publish_planner(ctx)?;
        self.publish_automation(ctx)
    }

    async fn tick(&mut self, ctx: &mut JobContext) -> Result<()> {
        let now = Instant::now();
        let max_age = Duration::from_secs_f64(self.config.stale_input_secs);
        if let Some(input) = self
            .inputs
            .stale(self.automation.required_inputs(), now, max_age)
        {
            warn!(input = input.as_str(), "input missing or stale, skipping run");
            return Ok(());
        }
        self.inputs.dt_secs = self
            .last_run
            .map_or(0.0, |t| now.saturating_duration_since(t).as_secs_f64());
        self.last_run = Some(now);

        let event = self.automation.execute(&self.inputs)?;
        if let AutomationEvent::Dilution { volume_ml, reason } = &event {
            info!(volume_ml, reason = %reason, "dilution");
            let actions = self.planner.plan_exchange(*volume_ml)?;
            self.run_actions(ctx, actions, self.automation.name()).await?;
        }
        ctx.settings.set("latest_event", event.to_json())?;
        Ok(())
    }

    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        match name {
            "manual_dose" => self.manual_dose(ctx, value).await,
            "target_alt_media_fraction" => {
                let target = value
                    .as_f64()
                    .filter(|t| (0.0..=1.0).contains(t))
                    .ok_or_else(|| SetError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected 0-1, got {value}"),
                    })?;
                self.planner.set_target_alt_fraction(target);
                ctx.caches
                    .persistent
                    .set_json(&state_key(&ctx.identity), &DosingState::of(&self.planner))
                    .await?;
                self.publish_planner(ctx)
            }
            _ => {
                self.automation.update(name, &value)?;
                self.publish_automation(ctx)
            }
        }
    }

    async fn on_message(&mut self, _ctx: &mut JobContext, msg: &Message) -> Result<()> {
        if msg.retain || msg.is_clear() {
            return Ok(());
        }
        self.record_input(msg)
    }
}

pub struct Dosing;

impl ControllerKind for Dosing {
    const NAME: &'static str = "dosing_control";
    type Automation = DosingAutomation;

    fn build(spec: &AutomationSpec, config: &Config) -> Result<DosingAutomation> {
        DosingAutomation::from_spec(spec, config)
    }
}

pub type DosingControl = Controller<Dosing>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, feature = "sim"))]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::cache::Cache;
    use crate::calibration::Polynomial;
    use crate::jobs::od_reading::OdSample;
    use crate::jobs::testing::{settle, sim_env};
    use crate::pubsub::memory::MemoryBroker;
    use crate::state::JobState;

    const EVENTS: &str = "unit1/exp1/dosing_events";

    /// Linear pumps at the simulator's 0.1 mL/s.
    async fn calibrate_pumps(cache: &Cache) {
        for pump in [Pump::Media, Pump::AltMedia, Pump::Waste] {
            let cal = Calibration::new(
                "linear",
                pump.device(),
                Polynomial::new(vec![0.0, 0.1]),
                "s",
                "mL",
            );
            calibration::save(cache, &cal).await.unwrap();
            calibration::set_active(cache, pump.device(), "linear")
                .await
                .unwrap();
        }
    }

    fn retained_f64(broker: &MemoryBroker, attr: &str) -> f64 {
        broker
            .retained_str(&format!("unit1/exp1/dosing_automation/{attr}"))
            .unwrap()
            .parse()
            .unwrap()
    }

    fn events(broker: &MemoryBroker) -> Vec<DosingEvent> {
        broker
            .published_to(EVENTS)
            .iter()
            .map(|m| serde_json::from_slice(&m.payload).unwrap())
            .collect()
    }

    fn od_batch(od: f64) -> Vec<u8> {
        let timestamp = OffsetDateTime::now_utc();
        serde_json::to_vec(&OdBatch {
            ods: [(
                "2".to_string(),
                OdSample {
                    od,
                    angle: "90".into(),
                    channel: 2,
                    timestamp,
                },
            )]
            .into(),
            timestamp,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn silent_needs_no_calibration() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let spec = AutomationSpec::new("silent");
        let handle = env
            .start(DosingAutomation::from_spec(&spec, &env.config).unwrap())
            .await
            .unwrap();
        assert_eq!(retained_f64(&broker, "vial_volume"), 14.0);

        // a manual dose still needs the pump calibrated
        broker.inject(
            "unit1/exp1/dosing_automation/manual_dose/set",
            br#"{"event":"add_media","volume":0.5}"#,
            false,
        );
        settle().await;
        assert!(events(&broker).is_empty());
        assert_eq!(handle.state(), JobState::Ready);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn chemostat_requires_pump_calibrations() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let spec = AutomationSpec::new("chemostat")
            .with_arg("volume", 0.5)
            .with_arg("duration", 20);
        let r = env
            .start(DosingAutomation::from_spec(&spec, &env.config).unwrap())
            .await;
        assert!(matches!(r, Err(JobError::CalibrationMissing(d)) if d == "media_pump"));
    }

    #[tokio::test]
    async fn manual_exchange_is_split_into_subdoses() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        calibrate_pumps(&env.caches.persistent).await;
        let handle = env
            .start(DosingAutomation::from_spec(&AutomationSpec::new("silent"), &env.config).unwrap())
            .await
            .unwrap();

        handle
            .set("manual_dose", r#"{"event":"add_media","volume":1.0}"#)
            .await
            .unwrap();

        let events = events(&broker);
        let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            names,
            ["add_media", "remove_waste", "add_media", "remove_waste"]
        );
        assert!(events.iter().all(|e| e.volume_change <= 0.75));
        assert!((retained_f64(&broker, "media_throughput") - 1.0).abs() < 1e-9);
        assert!((retained_f64(&broker, "waste_throughput") - 1.0).abs() < 1e-9);
        assert!((retained_f64(&broker, "vial_volume") - 14.0).abs() < 1e-9);
        // the waste pump overdrives, so the vial never ends above its volume
        assert!(sim.volume_ml() <= 14.0 + 1e-6, "sim volume {}", sim.volume_ml());
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn pause_stops_an_exchange_between_subdoses() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        calibrate_pumps(&env.caches.persistent).await;
        let handle = env
            .start(DosingAutomation::from_spec(&AutomationSpec::new("silent"), &env.config).unwrap())
            .await
            .unwrap();

        // four sub-doses requested, the pause queued right behind them
        broker.inject(
            "unit1/exp1/dosing_automation/manual_dose/set",
            br#"{"event":"add_media","volume":3.0}"#,
            false,
        );
        broker.inject("unit1/exp1/dosing_automation/$state/set", b"sleeping", false);
        handle
            .watch_state()
            .wait_for(|s| *s == JobState::Sleeping)
            .await
            .unwrap();

        let names: Vec<String> = events(&broker).into_iter().map(|e| e.event).collect();
        assert_eq!(names, ["add_media", "remove_waste"]);
        assert!((retained_f64(&broker, "media_throughput") - 0.75).abs() < 1e-9);
        assert!((retained_f64(&broker, "waste_throughput") - 0.75).abs() < 1e-9);
        assert!((retained_f64(&broker, "vial_volume") - 14.0).abs() < 1e-9);
        assert!(sim.volume_ml() <= 14.0 + 1e-6, "sim volume {}", sim.volume_ml());

        // a stop waits for the sub-dose too
        handle.set_state(JobState::Ready).await.unwrap();
        broker.inject(
            "unit1/exp1/dosing_automation/manual_dose/set",
            br#"{"event":"add_media","volume":3.0}"#,
            false,
        );
        broker.inject("unit1/exp1/dosing_automation/$state/set", b"disconnected", false);
        assert_eq!(handle.wait().await, JobState::Disconnected);
        assert_eq!(events(&broker).len(), 4);
    }

    #[tokio::test]
    async fn turbidostat_dilutes_above_target() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        calibrate_pumps(&env.caches.persistent).await;
        let spec = AutomationSpec::new("turbidostat")
            .with_arg("target_od", 1.0)
            .with_arg("volume", 0.5);
        let handle = env
            .start(DosingAutomation::from_spec(&spec, &env.config).unwrap())
            .await
            .unwrap();
        assert_eq!(retained_f64(&broker, "target_od"), 1.0);

        broker.inject("unit1/exp1/od_reading/ods", &od_batch(1.3), false);
        settle().await;
        // first run at start had no OD yet; the next is 30 s later
        for _ in 0..120 {
            if events(&broker).len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let events = events(&broker);
        assert!(events.len() >= 2, "{events:?}");
        assert_eq!(events[0].event, "add_media");
        assert_eq!(events[0].source_of_event, "turbidostat");
        assert!((events[0].volume_change - 0.5).abs() < 1e-9);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn ledger_survives_a_restart() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        calibrate_pumps(&env.caches.persistent).await;
        let start = || async {
            env.start(DosingAutomation::from_spec(&AutomationSpec::new("silent"), &env.config).unwrap())
                .await
                .unwrap()
        };

        let handle = start().await;
        handle
            .set("manual_dose", r#"{"event":"add_alt_media","volume":0.5}"#)
            .await
            .unwrap();
        handle.disconnect().await.unwrap();

        let handle = start().await;
        assert!((retained_f64(&broker, "alt_media_throughput") - 0.5).abs() < 1e-9);
        let fraction = retained_f64(&broker, "alt_media_fraction");
        assert!((fraction - 0.5 / 14.5).abs() < 1e-9, "fraction {fraction}");
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn alt_media_target_is_bounded() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env
            .start(DosingAutomation::from_spec(&AutomationSpec::new("silent"), &env.config).unwrap())
            .await
            .unwrap();
        assert!(handle.set("target_alt_media_fraction", "1.5").await.is_err());
        handle.set("target_alt_media_fraction", "0.25").await.unwrap();
        assert_eq!(retained_f64(&broker, "target_alt_media_fraction"), 0.25);
        handle.disconnect().await.unwrap();
    }
}
