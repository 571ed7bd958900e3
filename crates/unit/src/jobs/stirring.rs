//! Stirring: drives the stir-bar PWM channel, closing the loop on the hall
//! sensor RPM when one is fitted, and slows down while OD samples are taken.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::StirringConfig;
use crate::error::{Result, SetError};
use crate::estimators::pid::{Pid, Tunings};
use crate::hardware::{ClaimedPwm, RpmSensor};
use crate::job::{Job, JobContext};
use crate::settings::{Datatype, SettingSpec};
use crate::state::JobState;

static STIRRING_SETTINGS: [SettingSpec; 3] = [
    SettingSpec::new("duty_cycle", Datatype::Float)
        .settable()
        .with_unit("%"),
    SettingSpec::new("target_rpm", Datatype::Float)
        .settable()
        .with_unit("RPM"),
    SettingSpec::new("measured_rpm", Datatype::Float).with_unit("RPM"),
];

/// Largest duty-cycle correction per RPM check.
const MAX_STEP: f64 = 5.0;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub struct Stirring {
    config: StirringConfig,
    /// Last duty cycle asked for, by a remote set or the RPM loop. It is what
    /// the motor returns to after a pause or a dodge.
    duty: f64,
    pwm: Option<ClaimedPwm>,
    rpm: Option<Box<dyn RpmSensor>>,
    pid: Pid,
    dodging: bool,
}

impl Stirring {
    pub fn new(config: &StirringConfig) -> Result<Self> {
        let tunings = Tunings {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
        };
        Ok(Self {
            config: config.clone(),
            duty: config.initial_duty_cycle,
            pwm: None,
            rpm: None,
            pid: Pid::new(tunings, config.target_rpm, (-MAX_STEP, MAX_STEP))?,
            dodging: false,
        })
    }

    pub fn with_duty_cycle(mut self, duty: f64) -> Self {
        self.duty = duty.clamp(0.0, 100.0);
        self
    }

    pub fn with_target_rpm(mut self, rpm: f64) -> Self {
        self.pid.set_setpoint(rpm.max(0.0));
        self
    }

    fn drive(&mut self, duty: f64) -> Result<()> {
        if let Some(pwm) = self.pwm.as_mut() {
            pwm.output.set_duty_cycle(duty)?;
        }
        Ok(())
    }

    /// Apply `self.duty`, scaled down if a dodge is in progress.
    fn apply(&mut self) -> Result<()> {
        let duty = if self.dodging {
            self.duty * self.config.dodge_duty_fraction
        } else {
            self.duty
        };
        self.drive(duty)
    }
}

#[async_trait]
impl Job for Stirring {
    const NAME: &'static str = "stirring";

    fn settings() -> &'static [SettingSpec] {
        &STIRRING_SETTINGS
    }

    fn period(&self) -> Option<Duration> {
        self.rpm
            .as_ref()
            .map(|_| Duration::from_secs_f64(self.config.rpm_check_secs))
    }

    fn dodge_target(&self) -> Option<&'static str> {
        (self.config.dodge_duty_fraction < 1.0).then_some("od_reading")
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.pwm = Some(
            ClaimedPwm::claim(
                &ctx.caches,
                ctx.hardware.as_ref(),
                self.config.pwm_channel,
                Self::NAME,
            )
            .await?,
        );
        if self.config.use_rpm {
            match ctx.hardware.rpm_sensor() {
                Ok(sensor) => self.rpm = Some(sensor),
                Err(e) => warn!("running open-loop on duty cycle: {e}"),
            }
        }
        ctx.settings.set("target_rpm", self.pid.setpoint())?;
        Ok(())
    }

    async fn on_ready(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.dodging = false;
        self.pid.reset();
        self.apply()?;
        ctx.settings.set("duty_cycle", round2(self.duty))?;
        Ok(())
    }

    /// Motor off; the published duty cycle stays as the value to resume at.
    async fn on_sleeping(&mut self, _ctx: &mut JobContext) -> Result<()> {
        self.drive(0.0)
    }

    async fn on_disconnected(&mut self, _ctx: &mut JobContext) -> Result<()> {
        if let Some(pwm) = self.pwm.take() {
            pwm.release().await?;
        }
        Ok(())
    }

    async fn tick(&mut self, ctx: &mut JobContext) -> Result<()> {
        if self.dodging {
            return Ok(());
        }
        let Some(sensor) = self.rpm.as_mut() else {
            return Ok(());
        };
        let rpm = sensor.read_rpm()?;
        ctx.settings.set("measured_rpm", round2(rpm))?;

        let step = self.pid.update(rpm, self.config.rpm_check_secs);
        self.duty = (self.duty + step).clamp(0.0, 100.0);
        self.apply()?;
        ctx.settings.set("duty_cycle", round2(self.duty))?;
        Ok(())
    }

    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        match name {
            "duty_cycle" => {
                let duty = value
                    .as_f64()
                    .filter(|d| (0.0..=100.0).contains(d))
                    .ok_or_else(|| SetError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected 0-100, got {value}"),
                    })?;
                self.duty = duty;
                if ctx.state() == JobState::Ready {
                    self.apply()?;
                }
                ctx.settings.set(name, duty)?;
            }
            "target_rpm" => {
                let rpm = value
                    .as_f64()
                    .filter(|r| *r >= 0.0)
                    .ok_or_else(|| SetError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected a non-negative rpm, got {value}"),
                    })?;
                self.pid.set_setpoint(rpm);
                ctx.settings.set(name, rpm)?;
            }
            _ => {
                ctx.settings.set(name, value)?;
            }
        }
        Ok(())
    }

    async fn before_dodge(&mut self, _ctx: &mut JobContext) -> Result<()> {
        debug!("slowing for od sample");
        self.dodging = true;
        self.apply()
    }

    async fn after_dodge(&mut self, _ctx: &mut JobContext) -> Result<()> {
        self.dodging = false;
        self.apply()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, feature = "sim"))]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::jobs::testing::{settle, sim_env};
    use crate::kernel::{now_unix_ms, DodgeSchedule};
    use crate::pubsub::memory::MemoryBroker;

    fn open_loop() -> StirringConfig {
        StirringConfig {
            use_rpm: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn starts_at_configured_duty_cycle() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env.start(Stirring::new(&open_loop()).unwrap()).await.unwrap();
        assert_eq!(
            broker.retained_str("unit1/exp1/stirring/duty_cycle").as_deref(),
            Some("30.0")
        );
        assert_eq!(sim.stirrer_duty(), 30.0);
        handle.disconnect().await.unwrap();
        assert_eq!(sim.stirrer_duty(), 0.0);
    }

    #[tokio::test]
    async fn second_stirrer_cannot_claim_the_channel() {
        let broker = MemoryBroker::new();
        let (env, _sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env.start(Stirring::new(&open_loop()).unwrap()).await.unwrap();
        let other = crate::job::JobEnv {
            experiment: "exp2".into(),
            ..env.clone()
        };
        assert!(matches!(
            other.start(Stirring::new(&open_loop()).unwrap()).await,
            Err(JobError::ResourceBusy { .. })
        ));
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn remote_duty_cycle_is_bounded() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let handle = env.start(Stirring::new(&open_loop()).unwrap()).await.unwrap();

        broker.inject("unit1/exp1/stirring/duty_cycle/set", b"140", false);
        broker.inject("unit1/exp1/stirring/duty_cycle/set", b"45", false);
        settle().await;
        assert_eq!(sim.stirrer_duty(), 45.0);
        assert_eq!(
            broker.retained_str("unit1/exp1/stirring/duty_cycle").as_deref(),
            Some("45.0")
        );
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn closed_loop_moves_toward_target() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let cfg = StirringConfig {
            kp: 0.01,
            ..Default::default()
        };
        let handle = env
            .start(Stirring::new(&cfg).unwrap().with_target_rpm(640.0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        // 16 rpm per percent in the simulator
        assert!(sim.stirrer_duty() > 32.0, "duty {}", sim.stirrer_duty());
        assert!(broker.retained_str("unit1/exp1/stirring/measured_rpm").is_some());
        handle.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn dodges_an_announced_sample() {
        let broker = MemoryBroker::new();
        let (env, sim) = sim_env(&broker).await;
        tokio::time::pause();
        let schedule = DodgeSchedule {
            anchor_unix_ms: now_unix_ms() + 60_000,
            interval_ms: 10_000,
            pre_ms: 1_000,
            post_ms: 1_000,
        };
        schedule
            .store(&env.caches.intermittent, "unit1", "od_reading")
            .await
            .unwrap();
        let handle = env.start(Stirring::new(&open_loop()).unwrap()).await.unwrap();

        // quiet window from ~59 s to ~120 s on the paused clock
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sim.stirrer_duty(), 30.0);
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(sim.stirrer_duty(), 15.0);
        tokio::time::sleep(Duration::from_secs(70)).await;
        assert_eq!(sim.stirrer_duty(), 30.0);
        handle.disconnect().await.unwrap();
    }
}
