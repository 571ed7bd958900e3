//! Simulated bioreactor for local development and tests.
//!
//! One shared model backs every handle the provider hands out, so the jobs
//! of a single process see a consistent vial:
//! - logistic culture growth, diluted by media and alt-media additions
//! - photodiode voltages proportional to IR intensity and OD, with mains hum
//!   and per-read electronic noise
//! - a heater with first-order thermal response toward ambient
//! - a stirrer whose RPM lags its duty cycle
//!
//! Time is taken from `tokio::time::Instant` so tests with a paused clock
//! drive the culture deterministically apart from noise.

use std::f64::consts::PI;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::time::Instant;

use super::{AdcReader, AdcSample, HardwareProvider, PumpDriver, PwmOutput, RpmSensor, Thermometer};
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::estimators::dosing::Pump;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Model parameters
// ---------------------------------------------------------------------------

/// Physical constants of the simulated vial.
#[derive(Debug, Clone)]
pub struct SimParams {
    pub initial_od: f64,
    /// Per hour, at low density.
    pub growth_rate: f64,
    pub carrying_capacity: f64,
    pub ambient_c: f64,
    /// °C/s of heating at 100 % duty.
    pub heater_gain: f64,
    /// 1/s toward ambient.
    pub heat_loss: f64,
    pub rpm_per_duty: f64,
    pub rpm_tau_secs: f64,
    pub pump_ml_per_sec: f64,
    pub line_hz: f64,
    pub hum_volts: f64,
    pub adc_noise_volts: f64,
    /// Spacing of back-to-back ADC conversions.
    pub adc_conversion_secs: f64,
}

impl Default for SimParams {
    fn default() -> Self {
        Self {
            initial_od: 0.05,
            growth_rate: 0.4,
            carrying_capacity: 2.5,
            ambient_c: 22.0,
            heater_gain: 0.02,
            heat_loss: 0.0005,
            rpm_per_duty: 16.0,
            rpm_tau_secs: 1.0,
            pump_ml_per_sec: 0.1,
            line_hz: 60.0,
            hum_volts: 0.004,
            adc_noise_volts: 0.0005,
            adc_conversion_secs: 1.0 / 128.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared vial state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Stirrer,
    Heater,
    Led,
    IrLed,
    Unused,
}

struct Vial {
    params: SimParams,
    start: Instant,
    last: Instant,
    od: f64,
    volume_ml: f64,
    max_volume_ml: f64,
    temperature_c: f64,
    heater_duty: f64,
    stir_duty: f64,
    rpm: f64,
    ir_intensity: f64,
    /// Last ADC read time, seconds since `start`.
    adc_t: f64,
}

impl Vial {
    /// Integrate the model up to `now`.
    fn advance(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last).as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        self.last = now;
        let p = &self.params;

        let r = p.growth_rate / 3600.0;
        let k = p.carrying_capacity;
        // closed-form logistic step
        let e = (r * dt).exp();
        self.od = k * self.od * e / (k + self.od * (e - 1.0));

        let t_ss = p.ambient_c + p.heater_gain * self.heater_duty / 100.0 / p.heat_loss;
        self.temperature_c = t_ss + (self.temperature_c - t_ss) * (-p.heat_loss * dt).exp();

        let rpm_target = p.rpm_per_duty * self.stir_duty;
        self.rpm = rpm_target + (self.rpm - rpm_target) * (-dt / p.rpm_tau_secs).exp();
    }

    fn add(&mut self, ml: f64) {
        if ml <= 0.0 {
            return;
        }
        self.od *= self.volume_ml / (self.volume_ml + ml);
        self.volume_ml += ml;
    }

    /// The efflux tube sits at the working volume; waste cannot go below it.
    fn remove(&mut self, ml: f64) {
        let floor = self.max_volume_ml.min(self.volume_ml);
        self.volume_ml = (self.volume_ml - ml).max(floor);
    }
}

#[derive(Clone)]
pub struct SimBioreactor {
    vial: Arc<Mutex<Vial>>,
    stir_channel: u8,
    heater_channel: u8,
    led_channels: Vec<u8>,
    reference_channel: Option<u8>,
}

impl SimBioreactor {
    pub fn new(params: SimParams, config: &Config) -> Self {
        let now = Instant::now();
        let vial = Vial {
            od: params.initial_od,
            temperature_c: params.ambient_c,
            params,
            start: now,
            last: now,
            volume_ml: config.bioreactor.initial_volume_ml,
            max_volume_ml: config.bioreactor.max_volume_ml,
            heater_duty: 0.0,
            stir_duty: 0.0,
            rpm: 0.0,
            ir_intensity: 0.0,
            adc_t: 0.0,
        };
        Self {
            vial: Arc::new(Mutex::new(vial)),
            stir_channel: config.stirring.pwm_channel,
            heater_channel: config.temperature_automation.heater_pwm_channel,
            led_channels: config.led_automation.pwm_channels.clone(),
            reference_channel: config
                .od_reading
                .channels
                .iter()
                .find(|c| c.is_reference())
                .map(|c| c.channel),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(SimParams::default(), config)
    }

    fn lock(&self) -> MutexGuard<'_, Vial> {
        let mut v = self.vial.lock().unwrap_or_else(|e| e.into_inner());
        v.advance(Instant::now());
        v
    }

    /// True culture density, for tests.
    pub fn od(&self) -> f64 {
        self.lock().od
    }

    pub fn volume_ml(&self) -> f64 {
        self.lock().volume_ml
    }

    pub fn temperature_c(&self) -> f64 {
        self.lock().temperature_c
    }

    pub fn stirrer_duty(&self) -> f64 {
        self.lock().stir_duty
    }

    pub fn heater_duty(&self) -> f64 {
        self.lock().heater_duty
    }

    fn role(&self, channel: u8) -> Role {
        if channel == self.stir_channel {
            Role::Stirrer
        } else if channel == self.heater_channel {
            Role::Heater
        } else if self.led_channels.contains(&channel) {
            Role::Led
        } else {
            Role::Unused
        }
    }
}

impl HardwareProvider for SimBioreactor {
    fn pwm(&self, channel: u8) -> Result<Box<dyn PwmOutput>> {
        Ok(Box::new(SimPwm {
            sim: self.clone(),
            channel,
            role: self.role(channel),
            duty: 0.0,
        }))
    }

    fn adc(&self) -> Result<Box<dyn AdcReader>> {
        Ok(Box::new(SimAdc { sim: self.clone() }))
    }

    fn thermometer(&self) -> Result<Box<dyn Thermometer>> {
        Ok(Box::new(SimProbe { sim: self.clone() }))
    }

    fn rpm_sensor(&self) -> Result<Box<dyn RpmSensor>> {
        Ok(Box::new(SimProbe { sim: self.clone() }))
    }

    fn ir_led(&self) -> Result<Box<dyn PwmOutput>> {
        Ok(Box::new(SimPwm {
            sim: self.clone(),
            channel: 0,
            role: Role::IrLed,
            duty: 0.0,
        }))
    }

    fn pump(&self, pump: Pump) -> Result<Box<dyn PumpDriver>> {
        Ok(Box::new(SimPump {
            sim: self.clone(),
            pump,
            started: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

struct SimPwm {
    sim: SimBioreactor,
    channel: u8,
    role: Role,
    duty: f64,
}

impl PwmOutput for SimPwm {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_duty_cycle(&mut self, duty: f64) -> Result<()> {
        if !duty.is_finite() {
            return Err(JobError::InvalidArgument(format!("duty cycle {duty}")));
        }
        self.duty = duty.clamp(0.0, 100.0);
        let mut v = self.sim.lock();
        match self.role {
            Role::Stirrer => v.stir_duty = self.duty,
            Role::Heater => v.heater_duty = self.duty,
            Role::IrLed => v.ir_intensity = self.duty,
            Role::Led | Role::Unused => {}
        }
        Ok(())
    }

    fn duty_cycle(&self) -> f64 {
        self.duty
    }
}

struct SimAdc {
    sim: SimBioreactor,
}

impl AdcReader for SimAdc {
    fn read_channel(&mut self, channel: u8) -> Result<AdcSample> {
        if !(1..=4).contains(&channel) {
            return Err(JobError::InvalidArgument(format!("adc channel {channel}")));
        }
        let reference = self.sim.reference_channel == Some(channel);
        let mut v = self.sim.lock();
        let elapsed = v.last.saturating_duration_since(v.start).as_secs_f64();
        let jitter = v.params.adc_conversion_secs * 0.1 * fastrand::f64();
        let t = (v.adc_t + v.params.adc_conversion_secs + jitter).max(elapsed);
        v.adc_t = t;

        let ir = v.ir_intensity / 50.0;
        let level = if reference {
            0.25 * ir
        } else {
            ir * (0.01 + 0.4 * v.od)
        };
        let hum = v.params.hum_volts * (2.0 * PI * v.params.line_hz * t).sin();
        let noise = gaussian(0.0, v.params.adc_noise_volts);
        Ok(AdcSample {
            t,
            volts: (level + hum + noise).clamp(0.0, 4.096),
        })
    }
}

struct SimProbe {
    sim: SimBioreactor,
}

impl Thermometer for SimProbe {
    fn read_celsius(&mut self) -> Result<f64> {
        Ok(gaussian(self.sim.lock().temperature_c, 0.05))
    }
}

impl RpmSensor for SimProbe {
    fn read_rpm(&mut self) -> Result<f64> {
        let rpm = self.sim.lock().rpm;
        if rpm < 1.0 {
            return Ok(0.0);
        }
        Ok(gaussian(rpm, 5.0).max(0.0))
    }
}

struct SimPump {
    sim: SimBioreactor,
    pump: Pump,
    started: Option<Instant>,
}

impl PumpDriver for SimPump {
    fn start(&mut self) -> Result<()> {
        self.started.get_or_insert_with(Instant::now);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(started) = self.started.take() else {
            return Ok(());
        };
        let mut v = self.sim.lock();
        let ml = started.elapsed().as_secs_f64() * v.params.pump_ml_per_sec;
        match self.pump {
            Pump::Media | Pump::AltMedia => v.add(ml),
            Pump::Waste => v.remove(ml),
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn sim() -> SimBioreactor {
        SimBioreactor::from_config(&Config::default())
    }

    fn mean(xs: &[f64]) -> f64 {
        xs.iter().sum::<f64>() / xs.len() as f64
    }

    #[tokio::test(start_paused = true)]
    async fn culture_grows_over_time() {
        let s = sim();
        let before = s.od();
        tokio::time::advance(Duration::from_secs(3 * 3600)).await;
        let after = s.od();
        // ~exp(0.4 * 3) at low density
        assert!(after / before > 3.0, "before={before} after={after}");
        assert!(after < 2.5);
    }

    #[tokio::test(start_paused = true)]
    async fn media_dilutes_and_waste_stops_at_working_volume() {
        let s = sim();
        let od = s.od();
        let mut media = s.pump(Pump::Media).unwrap();
        media.start().unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        media.stop().unwrap();
        assert!((s.volume_ml() - 15.0).abs() < 1e-6);
        assert!(s.od() < od * 0.95);

        let mut waste = s.pump(Pump::Waste).unwrap();
        waste.start().unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        waste.stop().unwrap();
        assert!((s.volume_ml() - 14.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn heater_warms_toward_steady_state() {
        let s = sim();
        let mut heater = s.pwm(Config::default().temperature_automation.heater_pwm_channel).unwrap();
        heater.set_duty_cycle(50.0).unwrap();
        tokio::time::advance(Duration::from_secs(20_000)).await;
        // ambient 22 + 0.02 * 0.5 / 0.0005
        assert!((s.temperature_c() - 42.0).abs() < 0.5);
    }

    #[tokio::test(start_paused = true)]
    async fn rpm_follows_stirring_duty() {
        let s = sim();
        let mut stir = s.pwm(Config::default().stirring.pwm_channel).unwrap();
        let mut rpm = s.rpm_sensor().unwrap();
        assert_eq!(rpm.read_rpm().unwrap(), 0.0);
        stir.set_duty_cycle(30.0).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        let r = rpm.read_rpm().unwrap();
        assert!((r - 480.0).abs() < 40.0, "rpm {r}");
    }

    #[tokio::test(start_paused = true)]
    async fn signal_tracks_od_and_reference_does_not() {
        let s = sim();
        s.ir_led().unwrap().set_duty_cycle(50.0).unwrap();
        let mut adc = s.adc().unwrap();
        let (_, sig) = adc.read_batch(2, 64).unwrap();
        let (_, reference) = adc.read_batch(1, 64).unwrap();
        assert!((mean(&reference) - 0.25).abs() < 0.01);
        let expected = 0.01 + 0.4 * s.od();
        assert!((mean(&sig) - expected).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_times_are_spread_for_hum_fitting() {
        let s = sim();
        let (times, _) = s.adc().unwrap().read_batch(2, 16).unwrap();
        assert!(times.windows(2).all(|w| w[1] > w[0]));
        let span = times[15] - times[0];
        assert!(span > 0.1 && span < 0.15, "span {span}");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let m = mean(&(0..n).map(|_| approx_std_normal()).collect::<Vec<_>>());
        assert!(m.abs() < 0.15, "approx_std_normal mean should be near zero: {m}");
    }

    #[test]
    fn bad_adc_channel_is_rejected() {
        assert!(sim().adc().unwrap().read_channel(7).is_err());
    }
}
