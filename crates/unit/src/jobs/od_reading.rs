//! Optical density reading.
//!
//! The IR LED is on while the job is ready. Each sample reads a batch of
//! conversions per photodiode channel and fits out mains hum. The reference photodiode, when configured, tracks LED drift and
//! every signal channel is corrected by its smoothed ratio to the first
//! reading. The job publishes its sampling times so stirring can step aside.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use crate::cache::{holder_tag, LockGuard};
use crate::calibration::{self, Calibration};
use crate::config::{OdChannel, OdReadingConfig};
use crate::error::{JobError, Result, SetError};
use crate::estimators::ac::AcHumEstimator;
use crate::estimators::ema::Ema;
use crate::hardware::{AdcReader, PwmOutput};
use crate::job::{Job, JobContext};
use crate::kernel::{now_unix_ms, DodgeSchedule};
use crate::settings::{Datatype, SettingSpec};
use crate::state::JobState;

static OD_SETTINGS: [SettingSpec; 4] = [
    SettingSpec::new("ods", Datatype::Json),
    SettingSpec::new("ir_led_intensity", Datatype::Float)
        .settable()
        .with_unit("%"),
    SettingSpec::new("interval", Datatype::Float).with_unit("s"),
    SettingSpec::new("line_frequency", Datatype::Float).with_unit("Hz"),
];

/// Lock held on the ADC (and with it the IR LED) for the job's lifetime.
pub const ADC_LOCK: &str = "adc";

/// Calibration device for the OD signal channels.
pub const OD_DEVICE: &str = "od";

/// One channel's reading, as published on `od/<channel>` and inside `ods`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdSample {
    pub od: f64,
    pub angle: String,
    pub channel: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Payload of `ods`: every signal channel from one sampling instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdBatch {
    pub ods: BTreeMap<String, OdSample>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl OdBatch {
    pub fn mean_od(&self) -> Option<f64> {
        if self.ods.is_empty() {
            return None;
        }
        Some(self.ods.values().map(|s| s.od).sum::<f64>() / self.ods.len() as f64)
    }
}

struct ChannelReader {
    channel: OdChannel,
    hum: AcHumEstimator,
    blank: f64,
}

pub struct OdReading {
    config: OdReadingConfig,
    adc: Option<Box<dyn AdcReader>>,
    ir_led: Option<Box<dyn PwmOutput>>,
    lock: Option<LockGuard>,
    signals: Vec<ChannelReader>,
    reference: Option<ChannelReader>,
    reference_ema: Ema,
    reference_initial: Option<f64>,
    calibration: Option<Calibration>,
    intensity: f64,
}

impl OdReading {
    pub fn new(config: &OdReadingConfig) -> Self {
        Self {
            config: config.clone(),
            adc: None,
            ir_led: None,
            lock: None,
            signals: Vec::new(),
            reference: None,
            reference_ema: Ema::new(config.smoothing),
            reference_initial: None,
            calibration: None,
            intensity: config.ir_led_intensity,
        }
    }

    fn set_led(&mut self, intensity: f64) -> Result<()> {
        if let Some(led) = self.ir_led.as_mut() {
            led.set_duty_cycle(intensity)?;
        }
        Ok(())
    }

    /// Hum-free level of one channel, blank subtracted.
    fn read_level(adc: &mut dyn AdcReader, reader: &mut ChannelReader, n: usize) -> Result<f64> {
        let (times, volts) = adc.read_batch(reader.channel.channel, n)?;
        Ok(reader.hum.estimate(&times, &volts) - reader.blank)
    }

    /// Read every channel with the IR LED off; that level is subtracted
    /// from all later readings.
    fn measure_blanks(&mut self) -> Result<()> {
        let n = self.config.oversampling;
        let Some(adc) = self.adc.as_mut() else {
            return Ok(());
        };
        for reader in self.signals.iter_mut().chain(self.reference.iter_mut()) {
            let mut estimator = AcHumEstimator::new(self.config.smoothing);
            let (times, volts) = adc.read_batch(reader.channel.channel, n)?;
            let blank = estimator.estimate(&times, &volts);
            reader.blank = if blank.is_finite() { blank } else { 0.0 };
            debug!(channel = reader.channel.channel, blank = reader.blank, "blank measured");
        }
        Ok(())
    }

    fn sample(&mut self) -> Result<Vec<(OdChannel, f64)>> {
        let n = self.config.oversampling;
        let Some(adc) = self.adc.as_deref_mut() else {
            return Ok(Vec::new());
        };

        let mut correction = 1.0;
        if let Some(reference) = self.reference.as_mut() {
            let level = Self::read_level(adc, reference, n)?;
            if level.is_finite() && level > 0.0 {
                if let Some(smoothed) = self.reference_ema.update(level) {
                    let initial = *self.reference_initial.get_or_insert(smoothed);
                    correction = initial / smoothed;
                }
            } else {
                warn!(level, "reference photodiode reads nothing; skipping LED drift correction");
            }
        }

        let mut out = Vec::with_capacity(self.signals.len());
        for reader in &mut self.signals {
            let level = Self::read_level(adc, reader, n)? * correction;
            let od = match &self.calibration {
                Some(cal) => cal.predict(level),
                None => level,
            };
            out.push((reader.channel.clone(), od));
        }
        Ok(out)
    }

    async fn announce_schedule(config: &OdReadingConfig, ctx: &JobContext) -> Result<()> {
        let schedule = DodgeSchedule {
            anchor_unix_ms: now_unix_ms(),
            interval_ms: config.period().as_millis() as u64,
            pre_ms: config.dodge_pre_ms,
            post_ms: config.dodge_post_ms,
        };
        if !schedule.is_usable() {
            warn!(
                pre_ms = schedule.pre_ms,
                post_ms = schedule.post_ms,
                "quiet windows cover the whole interval; other jobs will not dodge"
            );
        }
        schedule
            .store(&ctx.caches.intermittent, &ctx.identity.unit, Self::NAME)
            .await?;
        Ok(())
    }

    async fn withdraw_schedule(ctx: &JobContext) {
        if let Err(e) = DodgeSchedule::remove(&ctx.caches.intermittent, &ctx.identity.unit, Self::NAME).await {
            warn!("failed to remove dodge schedule: {e}");
        }
    }
}

#[async_trait]
impl Job for OdReading {
    const NAME: &'static str = "od_reading";

    fn settings() -> &'static [SettingSpec] {
        &OD_SETTINGS
    }

    fn period(&self) -> Option<Duration> {
        Some(self.config.period())
    }

    async fn on_init(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.lock = Some(
            ctx.caches
                .intermittent
                .try_lock(ADC_LOCK, &holder_tag(Self::NAME))
                .await?,
        );
        self.adc = Some(ctx.hardware.adc()?);
        self.ir_led = Some(ctx.hardware.ir_led()?);
        if self.config.use_calibration {
            let cal = calibration::require_active(&ctx.caches.persistent, OD_DEVICE).await?;
            info!(calibration = %cal.name, "using od calibration");
            self.calibration = Some(cal);
        }

        for c in &self.config.channels {
            let reader = ChannelReader {
                channel: c.clone(),
                hum: AcHumEstimator::new(self.config.smoothing),
                blank: 0.0,
            };
            if c.is_reference() {
                self.reference = Some(reader);
            } else {
                self.signals.push(reader);
            }
        }
        self.set_led(0.0)?;
        self.measure_blanks()?;

        ctx.settings.set("interval", self.config.period().as_secs_f64())?;
        Ok(())
    }

    async fn on_ready(&mut self, ctx: &mut JobContext) -> Result<()> {
        self.set_led(self.intensity)?;
        ctx.settings.set("ir_led_intensity", self.intensity)?;
        Self::announce_schedule(&self.config, ctx).await
    }

    async fn on_sleeping(&mut self, ctx: &mut JobContext) -> Result<()> {
        Self::withdraw_schedule(ctx).await;
        self.set_led(0.0)
    }

    async fn on_disconnected(&mut self, ctx: &mut JobContext) -> Result<()> {
        Self::withdraw_schedule(ctx).await;
        let off = self.set_led(0.0);
        self.ir_led = None;
        self.adc = None;
        if let Some(lock) = self.lock.take() {
            lock.release().await?;
        }
        off
    }

    async fn tick(&mut self, ctx: &mut JobContext) -> Result<()> {
        let readings = self.sample()?;
        let timestamp = OffsetDateTime::now_utc();
        let mut batch = OdBatch {
            ods: BTreeMap::new(),
            timestamp,
        };
        for (channel, od) in readings {
            if !od.is_finite() {
                warn!(channel = channel.channel, "non-finite reading dropped");
                continue;
            }
            let sample = OdSample {
                od,
                angle: channel.angle.clone(),
                channel: channel.channel,
                timestamp,
            };
            ctx.publish(
                &format!("od/{}", channel.channel),
                serde_json::to_string(&sample)?,
            )
            .await?;
            batch.ods.insert(channel.channel.to_string(), sample);
        }
        if batch.ods.is_empty() {
            return Err(JobError::tick("no usable od reading"));
        }
        ctx.settings.set("ods", serde_json::to_value(&batch)?)?;
        if let Some(hz) = self
            .signals
            .first()
            .and_then(|r| r.hum.line_frequency())
        {
            ctx.settings.set("line_frequency", hz)?;
        }
        Ok(())
    }

    async fn on_set(&mut self, ctx: &mut JobContext, name: &str, value: Value) -> Result<()> {
        match name {
            "ir_led_intensity" => {
                let v = value
                    .as_f64()
                    .filter(|v| (0.0..=100.0).contains(v))
                    .ok_or_else(|| SetError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected 0-100, got {value}"),
                    })?;
                self.intensity = v;
                // the reference ratio restarts from the new level
                self.reference_ema.reset();
                self.reference_initial = None;
                if ctx.state() == JobState::Ready {
                    self.set_led(v)?;
                }
                ctx.settings.set(name, v)?;
            }
            _ => {
                ctx.settings.set(name, value)?;
            }
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
