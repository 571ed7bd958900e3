//! Temperature automation: reads the vial probe every period and drives the
//! heater from the running strategy. Above `max_temperature_c` the heater is
//! forced off whatever the strategy asks for.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{error, warn};

use crate::config::{Config, TemperatureConfig};
use crate::error::{Result, SetError};
use crate::hardware::{ClaimedPwm, Thermometer};
use crate::job::{Job, JobContext};
use crate::jobs::automation::{
    build_temperature, Automation, AutomationEvent, AutomationSpec, Input, Inputs,
};
use crate::jobs::controller::{Controller, ControllerKind};
use crate::settings::{Datatype, SettingSpec};

static TEMPERATURE_SETTINGS: [SettingSpec; 6] = [
    SettingSpec::new("automation_name", Datatype::String),
    SettingSpec::new("automation_settings", Datatype::Json),
    SettingSpec::new("latest_event", Datatype::Json),
    SettingSpec::new("temperature", Datatype::Float).with_unit("°C"),
    SettingSpec::new("heater_duty_cycle", Datatype::Float).with_unit("%"),
    SettingSpec::new("target_temperature", Datatype::Float)
        .settable()
        .with_unit("°C"),
];

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct TemperatureAutomation {
    automation: Box<dyn Automation>,
    config: TemperatureConfig,
    heater: Option<ClaimedPwm>,
    probe: Option<Box<dyn Thermometer>>,
    inputs: Inputs,
    last_run: Option<Instant>,
}

impl TemperatureAutomation {
    pub fn from_spec(spec: &AutomationSpec, config: &Config) -> Result<Self> {
        Ok(Self {
            automation: build_temperature(spec, &config.temperature_automation)?,
            config: config.temperature_automation.clone(),
            heater: None,
            probe: None,
            inputs: Inputs::default(),
            last_run: None,
        })
    }

    fn heat(&mut self, ctx: &mut JobContext, duty: f64) -> Result<()> {
        let duty = duty.clamp(0.0, self.config.max_heater_duty);
        if let Some(h) = self.heater.as_mut() {
            h.output.set_duty_cycle(duty)?;
        }
        ctx.settings.set("heater_duty_cycle", round2(duty))?;
        Ok(())
    }

    fn publish_automation(&self, ctx: &mut JobContext) -> Result<()> {
        let settings = self.automation.settings();
        if let Some(t) = settings.get("target_temperature") {
            ctx.settings.set("target_temperature", t.clone())?;
        }
        ctx.settings.set("automation_name", self.automation.name())?;
        ctx.settings.set("automation_settings", settings)?;
        Ok(())
    }
}

#[async_trait]
impl Job for TemperatureAutomation {
    const NAME: &'static str = "temperature_automation";

    fn settings() -> &'static [SettingSpec] {
        &TEMPERATURE_SETTINGS
    }

    fn period(&self) -> Option<Duration> {
        Some(self.automation.period())
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.probe = Some(ctx.hardware.thermometer()?);
        self.heater = Some(
            ClaimedPwm::claim(
                &ctx.caches,
                ctx.hardware.as_ref(),
                self.config.heater_pwm_channel,
                Self::NAME,
            )
            .await?,
        );
        self.publish_automation(ctx)
    }

    async fn on_sleeping(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.heat(ctx, 0.0)
    }

    async fn on_disconnected(&mut self, _ctx: &mut JobContext) -> Result<()> {
        if let Some(h) = self.heater.take() {
            h.release().await?;
        }
        Ok(())
    }

    async fn tick(&mut self, ctx: &mut JobContext) -> Result<()> {
        let Some(probe) = self.probe.as_mut() else {
            return Ok(());
        };
        let t = probe.read_celsius()?;
        let now = Instant::now();
        ctx.settings.set("temperature", round2(t))?;
        self.inputs.set(Input::Temperature, t, now);

        if t > self.config.max_temperature_c {
            error!(
                temperature = t,
                limit = self.config.max_temperature_c,
                "over temperature, heater off"
            );
            self.heat(ctx, 0.0)?;
            ctx.settings.set(
                "latest_event",
                json!({ "event_name": "SafetyCutoff", "temperature": t }),
            )?;
            return Ok(());
        }

        self.inputs.dt_secs = self
            .last_run
            .map_or(0.0, |l| now.saturating_duration_since(l).as_secs_f64());
        self.last_run = Some(now);
        let event = self.automation.execute(&self.inputs)?;
        match &event {
            AutomationEvent::HeaterDuty(d) => self.heat(ctx, *d)?,
            AutomationEvent::NoEvent => {}
            other => warn!(?other, "ignoring event a temperature automation cannot act on"),
        }
        ctx.settings.set("latest_event", event.to_json())?;
        Ok(())
    }

    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        if name == "target_temperature" {
            let max = self.config.max_temperature_c;
            if value.as_f64().map_or(true, |t| t >= max) {
                return Err(SetError::OutOfRange {
                    name: name.to_string(),
                    reason: format!("must be below {max} °C, got {value}"),
                }
                .into());
            }
        }
        self.automation.update(name, &value)?;
        self.publish_automation(ctx)
    }
}

pub struct Temperature;

impl ControllerKind for Temperature {
    const NAME: &'static str = "temperature_control";
    type Automation = TemperatureAutomation;

    fn build(spec: &AutomationSpec, config: &Config) -> Result<TemperatureAutomation> {
        TemperatureAutomation::from_spec(spec, config)
    }
}

pub type TemperatureControl = Controller<Temperature>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::jobs::testing::{sim_env, sim_env_with};
    use crate::pubsub::memory::MemoryBroker;
    use crate::state::JobState;

    fn thermostat(target: f64) -> AutomationSpec {
        AutomationSpec::new("thermostat").with_arg("target_temperature", target)
    }

    fn retained(broker: &MemoryBroker, attr: &str) -> Option<String> {
        broker.retained_str(&format!("unit1/exp1/temperature_automation/{attr}"))
    }

    #[tokio::test]
    async fn thermostat_warms_the_vial() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env
            .start(TemperatureAutomation::from_spec(&thermostat(30.0), &env.config).unwrap())
            .await
            .unwrap();
        assert_eq!(retained(&broker, "target_temperature").as_deref(), Some("30.0"));

        tokio::time::sleep(Duration::from_secs(1800)).await;
        assert!(sim.temperature_c() > 24.0, "temperature {}", sim.temperature_c());
        assert!(sim.heater_duty() <= 60.0);
        assert!(retained(&broker, "temperature").is_some());
        handle.disconnect().await.unwrap();
        assert_eq!(sim.heater_duty(), 0.0);
    }

    #[tokio::test]
    async fn recording_only_keeps_the_heater_off() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let spec = AutomationSpec::new("only_record_temperature");
        let handle = env
            .start(TemperatureAutomation::from_spec(&spec, &env.config).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(sim.heater_duty(), 0.0);
        assert_eq!(retained(&broker, "heater_duty_cycle").as_deref(), Some("0.0"));
        let t: f64 = retained(&broker, "temperature").unwrap().parse().unwrap();
        assert!((t - 22.0).abs() < 0.5);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn unsafe_targets_are_refused() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        assert!(TemperatureAutomation::from_spec(&thermostat(55.0), &env.config).is_err());

        let handle = env
            .start(TemperatureAutomation::from_spec(&thermostat(30.0), &env.config).unwrap())
            .await
            .unwrap();
        assert!(handle.set("target_temperature", "50").await.is_err());
        handle.set("target_temperature", "35").await.unwrap();
        assert_eq!(retained(&broker, "target_temperature").as_deref(), Some("35.0"));
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn over_temperature_cuts_the_heater() {
        let broker = MemoryBroker::new();
        let mut config = Config::default();
        // ambient is 22 °C in the simulator
        config.temperature_automation.max_temperature_c = 21.0;
        let (env, sim) = sim_env_with(&broker, config).await;
        tokio::time::pause();
        let handle = env
            .start(TemperatureAutomation::from_spec(&thermostat(20.0), &env.config).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        let event: Value = serde_json::from_str(&retained(&broker, "latest_event").unwrap()).unwrap();
        assert_eq!(event["event_name"], "SafetyCutoff");
        assert_eq!(sim.heater_duty(), 0.0);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn sleeping_turns_the_heater_off() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env
            .start(TemperatureAutomation::from_spec(&thermostat(40.0), &env.config).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(sim.heater_duty() > 0.0);
        handle.set_state(JobState::Sleeping).await.unwrap();
        assert_eq!(sim.heater_duty(), 0.0);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(sim.heater_duty(), 0.0);
        handle.disconnect().await.unwrap();
    }
}
