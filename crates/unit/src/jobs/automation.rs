//! Automation strategies run by the dosing, temperature and LED automation
//! jobs.
//!
//! An automation is pure decision logic: given the latest inputs it returns
//! an [`AutomationEvent`], which the owning job carries out on hardware. An
//! automation is built from an [`AutomationSpec`] in one step, so a spec with
//! a bad argument never produces a half-configured automation.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::time::Instant;

use crate::error::{JobError, Result, SetError};
use crate::estimators::pid::{Pid, Tunings};

/// `{"automation_name": "...", "args": {...}}`, the payload of a
/// controller's `automation` attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationSpec {
    pub automation_name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl AutomationSpec {
    pub fn new(name: &str) -> Self {
        Self {
            automation_name: name.to_string(),
            args: Map::new(),
        }
    }

    pub fn with_arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    /// Deserialize the arguments into a strict argument struct.
    pub fn parse_args<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.args.clone())).map_err(|e| {
            JobError::InvalidArgument(format!("{}: {e}", self.automation_name))
        })
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Od,
    GrowthRate,
    Temperature,
}

impl Input {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Od => "od",
            Self::GrowthRate => "growth_rate",
            Self::Temperature => "temperature",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timed {
    pub value: f64,
    pub at: Instant,
}

/// Latest value of each input, with its arrival time.
#[derive(Debug, Clone, Default)]
pub struct Inputs {
    pub od: Option<Timed>,
    pub growth_rate: Option<Timed>,
    pub temperature: Option<Timed>,
    /// Seconds since the automation last ran.
    pub dt_secs: f64,
}

impl Inputs {
    pub fn get(&self, input: Input) -> Option<Timed> {
        match input {
            Input::Od => self.od,
            Input::GrowthRate => self.growth_rate,
            Input::Temperature => self.temperature,
        }
    }

    pub fn set(&mut self, input: Input, value: f64, at: Instant) {
        let slot = match input {
            Input::Od => &mut self.od,
            Input::GrowthRate => &mut self.growth_rate,
            Input::Temperature => &mut self.temperature,
        };
        *slot = Some(Timed { value, at });
    }

    /// First required input that is missing or older than `max_age`.
    pub fn stale(&self, required: &[Input], now: Instant, max_age: Duration) -> Option<Input> {
        required.iter().copied().find(|i| match self.get(*i) {
            Some(t) => now.saturating_duration_since(t.at) > max_age,
            None => true,
        })
    }

    fn value(&self, input: Input) -> Result<f64> {
        self.get(input)
            .map(|t| t.value)
            .ok_or_else(|| JobError::tick(format!("no {} reading yet", input.as_str())))
    }
}

// ---------------------------------------------------------------------------
// Events and trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum AutomationEvent {
    NoEvent,
    /// Exchange this volume: add media (and alt-media per the target
    /// fraction) and remove the same volume of waste.
    Dilution { volume_ml: f64, reason: String },
    HeaterDuty(f64),
    /// Intensity per LED channel name (`A`, `B`, ...).
    Lights(BTreeMap<String, f64>),
}

impl AutomationEvent {
    /// Summary published as the job's `latest_event`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::NoEvent => json!({ "event_name": "NoEvent" }),
            Self::Dilution { volume_ml, reason } => json!({
                "event_name": "DilutionEvent",
                "volume_ml": volume_ml,
                "message": reason,
            }),
            Self::HeaterDuty(d) => json!({ "event_name": "UpdatedHeaterDC", "duty_cycle": d }),
            Self::Lights(l) => json!({ "event_name": "ChangedLedIntensity", "intensities": l }),
        }
    }
}

pub trait Automation: Send + 'static {
    fn name(&self) -> &'static str;

    /// How often `execute` runs.
    fn period(&self) -> Duration;

    fn required_inputs(&self) -> &'static [Input] {
        &[]
    }

    /// Current arguments, published as the job's `automation_settings`.
    fn settings(&self) -> Value;

    /// Change one argument while running.
    fn update(&mut self, name: &str, _value: &Value) -> std::result::Result<(), SetError> {
        Err(SetError::OutOfRange {
            name: name.to_string(),
            reason: format!("not used by {}", self.name()),
        })
    }

    fn execute(&mut self, inputs: &Inputs) -> Result<AutomationEvent>;
}

fn positive(name: &str, v: f64) -> Result<f64> {
    if v.is_finite() && v > 0.0 {
        Ok(v)
    } else {
        Err(JobError::InvalidArgument(format!("{name} must be positive, got {v}")))
    }
}

fn value_f64(name: &str, v: &Value) -> std::result::Result<f64, SetError> {
    v.as_f64()
        .filter(|x| x.is_finite() && *x > 0.0)
        .ok_or_else(|| SetError::OutOfRange {
            name: name.to_string(),
            reason: format!("expected a positive number, got {v}"),
        })
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

/// Does nothing on a fixed cadence. Valid for every controller.
pub struct Silent {
    period: Duration,
}

impl Silent {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Automation for Silent {
    fn name(&self) -> &'static str {
        "silent"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn settings(&self) -> Value {
        json!({})
    }

    fn execute(&mut self, _inputs: &Inputs) -> Result<AutomationEvent> {
        Ok(AutomationEvent::NoEvent)
    }
}

// ---------------------------------------------------------------------------
// Dosing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChemostatArgs {
    volume: f64,
    /// Minutes between exchanges.
    duration: f64,
}

/// Fixed-volume exchange every `duration` minutes.
pub struct Chemostat {
    volume_ml: f64,
    period: Duration,
}

impl Chemostat {
    pub fn from_spec(spec: &AutomationSpec) -> Result<Self> {
        let a: ChemostatArgs = spec.parse_args()?;
        Ok(Self {
            volume_ml: positive("volume", a.volume)?,
            period: Duration::from_secs_f64(positive("duration", a.duration)? * 60.0),
        })
    }
}

impl Automation for Chemostat {
    fn name(&self) -> &'static str {
        "chemostat"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn settings(&self) -> Value {
        json!({ "volume": self.volume_ml, "duration": self.period.as_secs_f64() / 60.0 })
    }

    fn update(&mut self, name: &str, value: &Value) -> std::result::Result<(), SetError> {
        match name {
            "volume" => self.volume_ml = value_f64(name, value)?,
            _ => {
                return Err(SetError::OutOfRange {
                    name: name.to_string(),
                    reason: "not used by chemostat".into(),
                })
            }
        }
        Ok(())
    }

    fn execute(&mut self, _inputs: &Inputs) -> Result<AutomationEvent> {
        Ok(AutomationEvent::Dilution {
            volume_ml: self.volume_ml,
            reason: format!("exchanged {} mL", self.volume_ml),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TurbidostatArgs {
    target_od: f64,
    volume: f64,
    /// Minutes between checks.
    #[serde(default = "default_check_minutes")]
    duration: f64,
}

fn default_check_minutes() -> f64 {
    0.5
}

/// Exchange `volume` whenever OD reaches `target_od`.
pub struct Turbidostat {
    target_od: f64,
    volume_ml: f64,
    period: Duration,
}

impl Turbidostat {
    pub fn from_spec(spec: &AutomationSpec) -> Result<Self> {
        let a: TurbidostatArgs = spec.parse_args()?;
        Ok(Self {
            target_od: positive("target_od", a.target_od)?,
            volume_ml: positive("volume", a.volume)?,
            period: Duration::from_secs_f64(positive("duration", a.duration)? * 60.0),
        })
    }
}

impl Automation for Turbidostat {
    fn name(&self) -> &'static str {
        "turbidostat"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn required_inputs(&self) -> &'static [Input] {
        &[Input::Od]
    }

    fn settings(&self) -> Value {
        json!({ "target_od": self.target_od, "volume": self.volume_ml })
    }

    fn update(&mut self, name: &str, value: &Value) -> std::result::Result<(), SetError> {
        match name {
            "target_od" => self.target_od = value_f64(name, value)?,
            "volume" => self.volume_ml = value_f64(name, value)?,
            _ => {
                return Err(SetError::OutOfRange {
                    name: name.to_string(),
                    reason: "not used by turbidostat".into(),
                })
            }
        }
        Ok(())
    }

    fn execute(&mut self, inputs: &Inputs) -> Result<AutomationEvent> {
        let od = inputs.value(Input::Od)?;
        if od >= self.target_od {
            Ok(AutomationEvent::Dilution {
                volume_ml: self.volume_ml,
                reason: format!("od {od:.3} >= target {:.3}", self.target_od),
            })
        } else {
            Ok(AutomationEvent::NoEvent)
        }
    }
}

pub fn build_dosing(spec: &AutomationSpec) -> Result<Box<dyn Automation>> {
    Ok(match spec.automation_name.as_str() {
        "silent" => {
            let minutes = spec
                .args
                .get("duration")
                .and_then(Value::as_f64)
                .unwrap_or(60.0);
            Box::new(Silent::new(Duration::from_secs_f64(positive("duration", minutes)? * 60.0)))
        }
        "chemostat" => Box::new(Chemostat::from_spec(spec)?),
        "turbidostat" => Box::new(Turbidostat::from_spec(spec)?),
        other => {
            return Err(JobError::InvalidArgument(format!(
                "unknown dosing automation '{other}'"
            )))
        }
    })
}

// ---------------------------------------------------------------------------
// Temperature
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ThermostatArgs {
    target_temperature: f64,
}

/// PID on the vial temperature, output is the heater duty cycle.
pub struct Thermostat {
    pid: Pid,
    period: Duration,
}

impl Thermostat {
    pub fn new(target: f64, tunings: Tunings, max_duty: f64, period: Duration) -> Result<Self> {
        Ok(Self {
            pid: Pid::new(tunings, target, (0.0, max_duty))?,
            period,
        })
    }

    pub fn from_spec(
        spec: &AutomationSpec,
        tunings: Tunings,
        max_duty: f64,
        max_temperature: f64,
        period: Duration,
    ) -> Result<Self> {
        let a: ThermostatArgs = spec.parse_args()?;
        if !(a.target_temperature.is_finite() && a.target_temperature < max_temperature) {
            return Err(JobError::InvalidArgument(format!(
                "target_temperature must be below {max_temperature}, got {}",
                a.target_temperature
            )));
        }
        Self::new(a.target_temperature, tunings, max_duty, period)
    }
}

impl Automation for Thermostat {
    fn name(&self) -> &'static str {
        "thermostat"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn required_inputs(&self) -> &'static [Input] {
        &[Input::Temperature]
    }

    fn settings(&self) -> Value {
        json!({ "target_temperature": self.pid.setpoint() })
    }

    fn update(&mut self, name: &str, value: &Value) -> std::result::Result<(), SetError> {
        match name {
            "target_temperature" => {
                self.pid.set_setpoint(value_f64(name, value)?);
                Ok(())
            }
            _ => Err(SetError::OutOfRange {
                name: name.to_string(),
                reason: "not used by thermostat".into(),
            }),
        }
    }

    fn execute(&mut self, inputs: &Inputs) -> Result<AutomationEvent> {
        let t = inputs.value(Input::Temperature)?;
        let dt = if inputs.dt_secs > 0.0 {
            inputs.dt_secs
        } else {
            self.period.as_secs_f64()
        };
        Ok(AutomationEvent::HeaterDuty(self.pid.update(t, dt)))
    }
}

/// Heater off; temperature is still read and published.
pub struct OnlyRecordTemperature {
    period: Duration,
}

impl Automation for OnlyRecordTemperature {
    fn name(&self) -> &'static str {
        "only_record_temperature"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn settings(&self) -> Value {
        json!({})
    }

    fn execute(&mut self, _inputs: &Inputs) -> Result<AutomationEvent> {
        Ok(AutomationEvent::HeaterDuty(0.0))
    }
}

pub fn build_temperature(
    spec: &AutomationSpec,
    config: &crate::config::TemperatureConfig,
) -> Result<Box<dyn Automation>> {
    let period = Duration::from_secs_f64(config.period_secs);
    Ok(match spec.automation_name.as_str() {
        "thermostat" => Box::new(Thermostat::from_spec(
            spec,
            Tunings {
                kp: config.kp,
                ki: config.ki,
                kd: config.kd,
            },
            config.max_heater_duty,
            config.max_temperature_c,
            period,
        )?),
        "only_record_temperature" => Box::new(OnlyRecordTemperature { period }),
        other => {
            return Err(JobError::InvalidArgument(format!(
                "unknown temperature automation '{other}'"
            )))
        }
    })
}

// ---------------------------------------------------------------------------
// LEDs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LightDarkArgs {
    light_intensity: f64,
    light_duration_hours: f64,
    dark_duration_hours: f64,
}

/// Alternating light and dark phases, starting with light.
pub struct LightDarkCycle {
    channels: Vec<String>,
    intensity: f64,
    light_hours: f64,
    dark_hours: f64,
    elapsed_hours: f64,
    lights_on: Option<bool>,
    period: Duration,
}

impl LightDarkCycle {
    pub fn from_spec(spec: &AutomationSpec, channels: Vec<String>, period: Duration) -> Result<Self> {
        let a: LightDarkArgs = spec.parse_args()?;
        if !(0.0..=100.0).contains(&a.light_intensity) {
            return Err(JobError::InvalidArgument(format!(
                "light_intensity must be within 0-100, got {}",
                a.light_intensity
            )));
        }
        if !(a.light_duration_hours >= 0.0 && a.dark_duration_hours >= 0.0)
            || a.light_duration_hours + a.dark_duration_hours <= 0.0
        {
            return Err(JobError::InvalidArgument(
                "light and dark durations must be non-negative and not both zero".into(),
            ));
        }
        Ok(Self {
            channels,
            intensity: a.light_intensity,
            light_hours: a.light_duration_hours,
            dark_hours: a.dark_duration_hours,
            elapsed_hours: 0.0,
            lights_on: None,
            period,
        })
    }

    fn in_light_phase(&self) -> bool {
        let cycle = self.light_hours + self.dark_hours;
        self.elapsed_hours.rem_euclid(cycle) < self.light_hours
    }
}

impl Automation for LightDarkCycle {
    fn name(&self) -> &'static str {
        "light_dark_cycle"
    }

    fn period(&self) -> Duration {
        self.period
    }

    fn settings(&self) -> Value {
        json!({
            "light_intensity": self.intensity,
            "light_duration_hours": self.light_hours,
            "dark_duration_hours": self.dark_hours,
        })
    }

    fn update(&mut self, name: &str, value: &Value) -> std::result::Result<(), SetError> {
        match name {
            "light_intensity" => {
                let v = value
                    .as_f64()
                    .filter(|v| (0.0..=100.0).contains(v))
                    .ok_or_else(|| SetError::OutOfRange {
                        name: name.to_string(),
                        reason: format!("expected 0-100, got {value}"),
                    })?;
                self.intensity = v;
                // force a republish on the next run
                self.lights_on = None;
                Ok(())
            }
            _ => Err(SetError::OutOfRange {
                name: name.to_string(),
                reason: "not used by light_dark_cycle".into(),
            }),
        }
    }

    fn execute(&mut self, inputs: &Inputs) -> Result<AutomationEvent> {
        self.elapsed_hours += inputs.dt_secs / 3600.0;
        let on = self.in_light_phase();
        if self.lights_on == Some(on) {
            return Ok(AutomationEvent::NoEvent);
        }
        self.lights_on = Some(on);
        let level = if on { self.intensity } else { 0.0 };
        Ok(AutomationEvent::Lights(
            self.channels.iter().map(|c| (c.clone(), level)).collect(),
        ))
    }
}

pub fn build_led(spec: &AutomationSpec, channels: Vec<String>, period: Duration) -> Result<Box<dyn Automation>> {
    Ok(match spec.automation_name.as_str() {
        "silent" => Box::new(Silent::new(period)),
        "light_dark_cycle" => Box::new(LightDarkCycle::from_spec(spec, channels, period)?),
        other => {
            return Err(JobError::InvalidArgument(format!(
                "unknown led automation '{other}'"
            )))
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================
