//! Layered TOML configuration.
//!
//! A unit's effective config is the deep merge of several TOML layers, later
//! layers winning key by key:
//!
//! 1. the shared file every unit receives (`CONFIG_PATH`),
//! 2. the leader's retained `_cluster/config/$broadcast` layer,
//! 3. the unit's own file (`UNIT_CONFIG_PATH`),
//! 4. the leader's retained `_cluster/config/<unit>` layer.
//!
//! The merged value is deserialised into [`Config`] (every section has
//! defaults) and validated; validation reports every violation at once.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterView;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub cluster: ClusterConfig,
    pub storage: StorageConfig,
    pub stirring: StirringConfig,
    pub od_reading: OdReadingConfig,
    pub growth_rate_kalman: KalmanConfig,
    pub dosing_automation: DosingConfig,
    pub temperature_automation: TemperatureConfig,
    pub led_automation: LedConfig,
    pub pwm: PwmConfig,
    pub bioreactor: BioreactorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// How long to wait for the leader's retained documents at startup.
    pub settle_ms: u64,
    /// Experiment used when the leader has not published one.
    pub default_experiment: String,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            settle_ms: 500,
            default_experiment: "_testing".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub persistent: PathBuf,
    /// Cleared on reboot.
    pub intermittent: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            persistent: PathBuf::from("/var/lib/vessel/persistent.sqlite"),
            intermittent: PathBuf::from("/tmp/vessel/intermittent.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StirringConfig {
    pub pwm_channel: u8,
    pub initial_duty_cycle: f64,
    pub target_rpm: f64,
    /// Close the loop on measured RPM; otherwise run open-loop on duty cycle.
    pub use_rpm: bool,
    pub rpm_check_secs: f64,
    /// Duty cycle multiplier applied while OD samples are taken.
    pub dodge_duty_fraction: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for StirringConfig {
    fn default() -> Self {
        Self {
            pwm_channel: 1,
            initial_duty_cycle: 30.0,
            target_rpm: 500.0,
            use_rpm: true,
            rpm_check_secs: 5.0,
            dodge_duty_fraction: 0.5,
            kp: 0.005,
            ki: 0.0,
            kd: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OdChannel {
    pub channel: u8,
    /// `45`, `90`, `135`, `180` or `REF`.
    pub angle: String,
}

impl OdChannel {
    pub fn is_reference(&self) -> bool {
        self.angle.eq_ignore_ascii_case("REF")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OdReadingConfig {
    pub samples_per_second: f64,
    pub channels: Vec<OdChannel>,
    pub ir_led_intensity: f64,
    /// ADC reads per OD sample, fitted together for AC hum removal.
    pub oversampling: usize,
    /// EMA smoothing of the blank offset, in (0, 1).
    pub smoothing: f64,
    pub use_calibration: bool,
    /// Quiet window stirring must give before and after each sample.
    pub dodge_pre_ms: u64,
    pub dodge_post_ms: u64,
}

impl Default for OdReadingConfig {
    fn default() -> Self {
        Self {
            samples_per_second: 0.2,
            channels: vec![
                OdChannel {
                    channel: 1,
                    angle: "REF".into(),
                },
                OdChannel {
                    channel: 2,
                    angle: "90".into(),
                },
            ],
            ir_led_intensity: 50.0,
            oversampling: 32,
            smoothing: 0.9,
            use_calibration: false,
            dodge_pre_ms: 1500,
            dodge_post_ms: 500,
        }
    }
}

impl OdReadingConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.samples_per_second)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    pub obs_std: f64,
    pub od_std: f64,
    pub rate_std: f64,
    pub acc_std: f64,
    pub outlier_std_threshold: f64,
    /// Samples over which process noise stays inflated after a dosing event.
    pub dosing_window_samples: u32,
    pub dosing_inflation: f64,
    pub samples_for_od_statistics: usize,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            obs_std: 0.01,
            od_std: 0.0005,
            rate_std: 0.0005,
            acc_std: 0.00001,
            outlier_std_threshold: 3.0,
            dosing_window_samples: 60,
            dosing_inflation: 1e5,
            samples_for_od_statistics: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DosingConfig {
    pub max_subdose_ml: f64,
    /// Inputs older than this are stale and skip an automation run.
    pub stale_input_secs: f64,
    pub waste_pump_overdrive: f64,
}

impl Default for DosingConfig {
    fn default() -> Self {
        Self {
            max_subdose_ml: 0.75,
            stale_input_secs: 300.0,
            waste_pump_overdrive: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    pub heater_pwm_channel: u8,
    pub max_heater_duty: f64,
    pub period_secs: f64,
    pub max_temperature_c: f64,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            heater_pwm_channel: 5,
            max_heater_duty: 60.0,
            period_secs: 60.0,
            max_temperature_c: 50.0,
            kp: 3.0,
            ki: 0.01,
            kd: 3.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    /// PWM channels driving the growth LEDs, named `A`, `B`, ...
    pub pwm_channels: Vec<u8>,
    pub period_secs: f64,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            pwm_channels: vec![3, 4],
            period_secs: 60.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PwmConfig {
    pub frequency_hz: f64,
}

impl Default for PwmConfig {
    fn default() -> Self {
        Self { frequency_hz: 200.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BioreactorConfig {
    pub max_volume_ml: f64,
    pub initial_volume_ml: f64,
    pub initial_alt_media_fraction: f64,
}

impl Default for BioreactorConfig {
    fn default() -> Self {
        Self {
            max_volume_ml: 14.0,
            initial_volume_ml: 14.0,
            initial_alt_media_fraction: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// PWM outputs on the unit's header.
const PWM_CHANNELS: std::ops::RangeInclusive<u8> = 1..=5;
/// ADS1115 single-ended inputs, numbered from 1.
const ADC_CHANNELS: std::ops::RangeInclusive<u8> = 1..=4;
const OD_ANGLES: &[&str] = &["45", "90", "135", "180", "REF"];

impl Config {
    /// Validate every section. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_pwm(&mut errors);
        self.validate_od(&mut errors);
        self.validate_kalman(&mut errors);
        self.validate_volumes(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        if self.mqtt.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if self.mqtt.connect_timeout_secs == 0 {
            errors.push("mqtt.connect_timeout_secs must be positive".into());
        }
    }

    fn validate_pwm(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<u8> = HashSet::new();
        let mut claim = |owner: &str, ch: u8, errors: &mut Vec<String>| {
            if !PWM_CHANNELS.contains(&ch) {
                errors.push(format!("{owner}: pwm channel {ch} out of range [1, 5]"));
            } else if !seen.insert(ch) {
                errors.push(format!("{owner}: pwm channel {ch} is already used"));
            }
        };
        claim("stirring", self.stirring.pwm_channel, errors);
        claim(
            "temperature_automation",
            self.temperature_automation.heater_pwm_channel,
            errors,
        );
        for ch in &self.led_automation.pwm_channels {
            claim("led_automation", *ch, errors);
        }

        if !(0.0..=100.0).contains(&self.stirring.initial_duty_cycle) {
            errors.push(format!(
                "stirring.initial_duty_cycle {} out of range [0, 100]",
                self.stirring.initial_duty_cycle
            ));
        }
        if self.stirring.target_rpm < 0.0 {
            errors.push(format!(
                "stirring.target_rpm must be non-negative, got {}",
                self.stirring.target_rpm
            ));
        }
        if !(0.0..=1.0).contains(&self.stirring.dodge_duty_fraction) {
            errors.push(format!(
                "stirring.dodge_duty_fraction {} out of range [0, 1]",
                self.stirring.dodge_duty_fraction
            ));
        }
        if !(0.0..=100.0).contains(&self.temperature_automation.max_heater_duty) {
            errors.push(format!(
                "temperature_automation.max_heater_duty {} out of range [0, 100]",
                self.temperature_automation.max_heater_duty
            ));
        }
        for (name, secs) in [
            ("stirring.rpm_check_secs", self.stirring.rpm_check_secs),
            ("temperature_automation.period_secs", self.temperature_automation.period_secs),
            ("led_automation.period_secs", self.led_automation.period_secs),
        ] {
            if !(secs > 0.0) {
                errors.push(format!("{name} must be positive, got {secs}"));
            }
        }
        if !(self.pwm.frequency_hz > 0.0) {
            errors.push(format!(
                "pwm.frequency_hz must be positive, got {}",
                self.pwm.frequency_hz
            ));
        }
    }

    fn validate_od(&self, errors: &mut Vec<String>) {
        let od = &self.od_reading;
        if !(od.samples_per_second > 0.0 && od.samples_per_second <= 1.0) {
            errors.push(format!(
                "od_reading.samples_per_second {} out of range (0, 1]",
                od.samples_per_second
            ));
        }
        if !(od.smoothing > 0.0 && od.smoothing < 1.0) {
            errors.push(format!(
                "od_reading.smoothing {} out of range (0, 1)",
                od.smoothing
            ));
        }
        if od.oversampling < 4 {
            errors.push(format!(
                "od_reading.oversampling must be at least 4, got {}",
                od.oversampling
            ));
        }
        if !(0.0..=100.0).contains(&od.ir_led_intensity) {
            errors.push(format!(
                "od_reading.ir_led_intensity {} out of range [0, 100]",
                od.ir_led_intensity
            ));
        }

        let mut seen: HashSet<u8> = HashSet::new();
        let mut refs = 0;
        let mut signals = 0;
        for c in &od.channels {
            if !ADC_CHANNELS.contains(&c.channel) {
                errors.push(format!(
                    "od_reading: channel {} out of range [1, 4]",
                    c.channel
                ));
            } else if !seen.insert(c.channel) {
                errors.push(format!("od_reading: duplicate channel {}", c.channel));
            }
            if !OD_ANGLES.iter().any(|a| a.eq_ignore_ascii_case(&c.angle)) {
                errors.push(format!(
                    "od_reading: channel {} has unknown angle '{}'",
                    c.channel, c.angle
                ));
            }
            if c.is_reference() {
                refs += 1;
            } else {
                signals += 1;
            }
        }
        if signals == 0 {
            errors.push("od_reading: no signal channel configured".into());
        }
        if refs > 1 {
            errors.push("od_reading: at most one REF channel is allowed".into());
        }
    }

    fn validate_kalman(&self, errors: &mut Vec<String>) {
        let k = &self.growth_rate_kalman;
        for (name, v) in [
            ("obs_std", k.obs_std),
            ("od_std", k.od_std),
            ("rate_std", k.rate_std),
            ("acc_std", k.acc_std),
            ("outlier_std_threshold", k.outlier_std_threshold),
        ] {
            if !(v > 0.0) {
                errors.push(format!("growth_rate_kalman.{name} must be positive, got {v}"));
            }
        }
        if k.dosing_inflation < 1.0 {
            errors.push(format!(
                "growth_rate_kalman.dosing_inflation must be at least 1, got {}",
                k.dosing_inflation
            ));
        }
        if k.samples_for_od_statistics == 0 {
            errors.push("growth_rate_kalman.samples_for_od_statistics must be positive".into());
        }
    }

    fn validate_volumes(&self, errors: &mut Vec<String>) {
        let b = &self.bioreactor;
        if !(b.max_volume_ml > 0.0) {
            errors.push(format!(
                "bioreactor.max_volume_ml must be positive, got {}",
                b.max_volume_ml
            ));
        }
        if b.initial_volume_ml < 0.0 || b.initial_volume_ml > b.max_volume_ml {
            errors.push(format!(
                "bioreactor.initial_volume_ml ({}) must be within [0, max_volume_ml ({})]",
                b.initial_volume_ml, b.max_volume_ml
            ));
        }
        if !(0.0..=1.0).contains(&b.initial_alt_media_fraction) {
            errors.push(format!(
                "bioreactor.initial_alt_media_fraction {} out of range [0, 1]",
                b.initial_alt_media_fraction
            ));
        }
        let d = &self.dosing_automation;
        if !(d.max_subdose_ml > 0.0) {
            errors.push(format!(
                "dosing_automation.max_subdose_ml must be positive, got {}",
                d.max_subdose_ml
            ));
        } else if d.max_subdose_ml > b.max_volume_ml {
            errors.push(format!(
                "dosing_automation.max_subdose_ml ({}) exceeds bioreactor.max_volume_ml ({})",
                d.max_subdose_ml, b.max_volume_ml
            ));
        }
        if !(d.stale_input_secs > 0.0) {
            errors.push(format!(
                "dosing_automation.stale_input_secs must be positive, got {}",
                d.stale_input_secs
            ));
        }
        if d.waste_pump_overdrive < 1.0 {
            errors.push(format!(
                "dosing_automation.waste_pump_overdrive must be at least 1, got {}",
                d.waste_pump_overdrive
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Layering
// ---------------------------------------------------------------------------

/// Deep-merge `overlay` into `base`: tables merge key by key, anything else
/// (including arrays) is replaced.
pub fn merge(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(b), toml::Value::Table(o)) => {
            for (k, v) in o {
                match b.get_mut(&k) {
                    Some(existing) => merge(existing, v),
                    None => {
                        b.insert(k, v);
                    }
                }
            }
        }
        (b, o) => *b = o,
    }
}

/// Merge layers in order (later wins), deserialise and validate.
pub fn from_layers<I>(layers: I) -> Result<Config>
where
    I: IntoIterator<Item = toml::Value>,
{
    let mut merged = toml::Value::Table(toml::map::Map::new());
    for layer in layers {
        merge(&mut merged, layer);
    }
    let config: Config = merged
        .try_into()
        .context("failed to deserialise merged config")?;
    config.validate()?;
    Ok(config)
}

fn read_layer(path: &Path) -> Result<toml::Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {}", path.display()))
}

/// Effective config for a unit. Missing files are skipped; files that exist
/// but do not parse are errors.
pub fn load(shared: Option<&Path>, unit: Option<&Path>, cluster: Option<&ClusterView>) -> Result<Config> {
    let (leader_shared, leader_unit) = cluster
        .map(ClusterView::config_layers)
        .unwrap_or((None, None));

    let mut layers = Vec::new();
    if let Some(p) = shared.filter(|p| p.exists()) {
        layers.push(read_layer(p)?);
    }
    layers.extend(leader_shared);
    if let Some(p) = unit.filter(|p| p.exists()) {
        layers.push(read_layer(p)?);
    }
    layers.extend(leader_unit);

    let config = from_layers(layers).context("invalid config")?;
    tracing::info!(
        mqtt_host = %config.mqtt.host,
        od_channels = config.od_reading.channels.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
