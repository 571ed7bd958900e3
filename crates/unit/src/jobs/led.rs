//! LED automation: owns the growth-light PWM channels, named `A`, `B`, ...
//! in configuration order, and sets them from the running strategy.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{JobError, Result};
use crate::hardware::ClaimedPwm;
use crate::job::{Job, JobContext};
use crate::jobs::automation::{
    build_led, Automation, AutomationEvent, AutomationSpec, Inputs,
};
use crate::jobs::controller::{Controller, ControllerKind};
use crate::settings::{Datatype, SettingSpec};

static LED_SETTINGS: [SettingSpec; 5] = [
    SettingSpec::new("automation_name", Datatype::String),
    SettingSpec::new("automation_settings", Datatype::Json),
    SettingSpec::new("latest_event", Datatype::Json),
    SettingSpec::new("intensities", Datatype::Json),
    SettingSpec::new("light_intensity", Datatype::Float)
        .settable()
        .with_unit("%"),
];

/// `A` for the first channel, `B` for the second, ...
fn channel_name(index: usize) -> String {
    char::from(b'A' + (index % 26) as u8).to_string()
}

pub struct LedAutomation {
    automation: Box<dyn Automation>,
    channels: Vec<(String, u8)>,
    outputs: BTreeMap<String, ClaimedPwm>,
    /// Last intensity asked for per channel, restored on resume.
    intensities: BTreeMap<String, f64>,
    inputs: Inputs,
    last_run: Option<Instant>,
}

impl LedAutomation {
    pub fn from_spec(spec: &AutomationSpec, config: &Config) -> Result<Self> {
        let led = &config.led_automation;
        let channels: Vec<(String, u8)> = led
            .pwm_channels
            .iter()
            .enumerate()
            .map(|(i, ch)| (channel_name(i), *ch))
            .collect();
        let names = channels.iter().map(|(n, _)| n.clone()).collect();
        let automation = build_led(spec, names, Duration::from_secs_f64(led.period_secs))?;
        Ok(Self {
            intensities: channels.iter().map(|(n, _)| (n.clone(), 0.0)).collect(),
            automation,
            channels,
            outputs: BTreeMap::new(),
            inputs: Inputs::default(),
            last_run: None,
        })
    }

    /// Drive every channel at `levels`, or at 0 when `levels` is `None`.
    fn drive(&mut self, levels: Option<&BTreeMap<String, f64>>) -> Result<()> {
        for (name, out) in self.outputs.iter_mut() {
            let level = levels.and_then(|l| l.get(name)).copied().unwrap_or(0.0);
            out.output.set_duty_cycle(level)?;
        }
        Ok(())
    }

    fn publish_automation(&self, ctx: &mut JobContext) -> Result<()> {
        let settings = self.automation.settings();
        if let Some(v) = settings.get("light_intensity") {
            ctx.settings.set("light_intensity", v.clone())?;
        }
        ctx.settings.set("automation_name", self.automation.name())?;
        ctx.settings.set("automation_settings", settings)?;
        Ok(())
    }
}

#[async_trait]
impl Job for LedAutomation {
    const NAME: &'static str = "led_automation";

    fn settings() -> &'static [SettingSpec] {
        &LED_SETTINGS
    }

    fn period(&self) -> Option<Duration> {
        Some(self.automation.period())
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        for (name, channel) in &self.channels {
            let pwm =
                ClaimedPwm::claim(&ctx.caches, ctx.hardware.as_ref(), *channel, Self::NAME)
                    .await?;
            self.outputs.insert(name.clone(), pwm);
        }
        self.publish_automation(ctx)
    }

    async fn on_ready(&mut self, ctx: &mut JobContext) -> Result<()> {
        let levels = self.intensities.clone();
        self.drive(Some(&levels))?;
        ctx.settings
            .set("intensities", serde_json::to_value(&self.intensities)?)?;
        Ok(())
    }

    /// Lights off; `intensities` keeps what to restore.
    async fn on_sleeping(&mut self, _ctx: &mut JobContext) -> Result<()> {
        self.drive(None)
    }

    async fn on_disconnected(&mut self, _ctx: &mut JobContext) -> Result<()> {
        let mut first_err = None;
        for (name, pwm) in std::mem::take(&mut self.outputs) {
            if let Err(e) = pwm.release().await {
                warn!(channel = %name, "failed to release led: {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn tick(&mut self, ctx: &mut JobContext) -> Result<()> {
        let now = Instant::now();
        self.inputs.dt_secs = self
            .last_run
            .map_or(0.0, |l| now.saturating_duration_since(l).as_secs_f64());
        self.last_run = Some(now);

        let event = self.automation.execute(&self.inputs)?;
        match &event {
            AutomationEvent::Lights(levels) => {
                for (name, level) in levels {
                    if !self.intensities.contains_key(name) {
                        return Err(JobError::tick(format!("no led channel named {name}")));
                    }
                    self.intensities.insert(name.clone(), *level);
                }
                let levels = self.intensities.clone();
                self.drive(Some(&levels))?;
                info!(intensities = ?self.intensities, "leds changed");
                ctx.settings
                    .set("intensities", serde_json::to_value(&self.intensities)?)?;
            }
            AutomationEvent::NoEvent => {}
            other => warn!(?other, "ignoring event an led automation cannot act on"),
        }
        ctx.settings.set("latest_event", event.to_json())?;
        Ok(())
    }

    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        self.automation.update(name, &value)?;
        self.publish_automation(ctx)
    }
}

pub struct Led;

impl ControllerKind for Led {
    const NAME: &'static str = "led_control";
    type Automation = LedAutomation;

    fn build(spec: &AutomationSpec, config: &Config) -> Result<LedAutomation> {
        LedAutomation::from_spec(spec, config)
    }
}

pub type LedControl = Controller<Led>;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::jobs::testing::sim_env;
    use crate::pubsub::memory::MemoryBroker;
    use crate::state::JobState;

    fn cycle() -> AutomationSpec {
        AutomationSpec::new("light_dark_cycle")
            .with_arg("light_intensity", 50.0)
            .with_arg("light_duration_hours", 1.0)
            .with_arg("dark_duration_hours", 1.0)
    }

    fn intensities(broker: &MemoryBroker) -> BTreeMap<String, f64> {
        let raw = broker
            .retained_str("unit1/exp1/led_automation/intensities")
            .unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn channels_are_lettered() {
        assert_eq!(channel_name(0), "A");
        assert_eq!(channel_name(2), "C");
    }

    #[tokio::test]
    async fn light_dark_cycle_switches_channels() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env
            .start(LedAutomation::from_spec(&cycle(), &env.config).unwrap())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(intensities(&broker)["A"], 50.0);
        assert_eq!(intensities(&broker)["B"], 50.0);

        tokio::time::sleep(Duration::from_secs(90 * 60)).await;
        assert_eq!(intensities(&broker)["A"], 0.0);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn intensity_can_be_changed_while_running() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env
            .start(LedAutomation::from_spec(&cycle(), &env.config).unwrap())
            .await
            .unwrap();
        assert!(handle.set("light_intensity", "120").await.is_err());
        handle.set("light_intensity", "80").await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(intensities(&broker)["A"], 80.0);
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn silent_leaves_lights_off_and_channels_are_exclusive() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env
            .start(LedAutomation::from_spec(&AutomationSpec::new("silent"), &env.config).unwrap())
            .await
            .unwrap();
        assert_eq!(intensities(&broker)["A"], 0.0);

        let other = crate::job::JobEnv {
            experiment: "exp2".into(),
            ..env.clone()
        };
        let r = other
            .start(LedAutomation::from_spec(&cycle(), &env.config).unwrap())
            .await;
        assert!(matches!(r, Err(JobError::ResourceBusy { .. })));

        handle.set_state(JobState::Sleeping).await.unwrap();
        handle.set_state(JobState::Ready).await.unwrap();
        assert_eq!(handle.state(), JobState::Ready);
        handle.disconnect().await.unwrap();
    }
}
