//! Hardware seam.
//!
//! Jobs only see these traits. The `gpio`/`adc` features provide the
//! Raspberry Pi implementations via rppal; without them the `sim` feature
//! provides a simulated bioreactor, and with neither every request reports
//! [`JobError::HardwareAbsent`]. Calls are synchronous and short (one I2C
//! transaction or one pin write); long actions such as running a pump are
//! split into `start` / `stop` so the caller can wait asynchronously.

#[cfg(feature = "adc")]
pub mod ads1115;
#[cfg(feature = "gpio")]
pub mod rpi;
#[cfg(feature = "sim")]
pub mod sim;

use std::sync::Arc;

use crate::cache::{holder_tag, Caches, LockGuard};
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::estimators::dosing::Pump;

/// One timestamped ADC read. `t` is seconds on a monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcSample {
    pub t: f64,
    pub volts: f64,
}

pub trait PwmOutput: Send {
    fn channel(&self) -> u8;

    /// Duty cycle in percent, clamped to `0..=100` by the implementation.
    fn set_duty_cycle(&mut self, duty: f64) -> Result<()>;

    fn duty_cycle(&self) -> f64;
}

pub trait AdcReader: Send {
    /// Single-ended read of a 1-based channel.
    fn read_channel(&mut self, channel: u8) -> Result<AdcSample>;

    /// `n` back-to-back reads, for fitting out mains hum.
    fn read_batch(&mut self, channel: u8, n: usize) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut times = Vec::with_capacity(n);
        let mut volts = Vec::with_capacity(n);
        for _ in 0..n {
            let s = self.read_channel(channel)?;
            times.push(s.t);
            volts.push(s.volts);
        }
        Ok((times, volts))
    }
}

pub trait Thermometer: Send {
    fn read_celsius(&mut self) -> Result<f64>;
}

pub trait RpmSensor: Send {
    fn read_rpm(&mut self) -> Result<f64>;
}

pub trait PumpDriver: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
}

pub trait HardwareProvider: Send + Sync {
    fn pwm(&self, channel: u8) -> Result<Box<dyn PwmOutput>>;
    fn adc(&self) -> Result<Box<dyn AdcReader>>;
    fn thermometer(&self) -> Result<Box<dyn Thermometer>>;
    fn rpm_sensor(&self) -> Result<Box<dyn RpmSensor>>;
    /// IR LED used for OD measurement; intensity is a duty cycle.
    fn ir_led(&self) -> Result<Box<dyn PwmOutput>>;
    fn pump(&self, pump: Pump) -> Result<Box<dyn PumpDriver>>;
}

pub type SharedHardware = Arc<dyn HardwareProvider>;

/// A unit with nothing attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHardware;

impl HardwareProvider for NullHardware {
    fn pwm(&self, channel: u8) -> Result<Box<dyn PwmOutput>> {
        Err(JobError::HardwareAbsent(format!("pwm channel {channel}")))
    }

    fn adc(&self) -> Result<Box<dyn AdcReader>> {
        Err(JobError::HardwareAbsent("adc".into()))
    }

    fn thermometer(&self) -> Result<Box<dyn Thermometer>> {
        Err(JobError::HardwareAbsent("temperature sensor".into()))
    }

    fn rpm_sensor(&self) -> Result<Box<dyn RpmSensor>> {
        Err(JobError::HardwareAbsent("rpm sensor".into()))
    }

    fn ir_led(&self) -> Result<Box<dyn PwmOutput>> {
        Err(JobError::HardwareAbsent("ir led".into()))
    }

    fn pump(&self, pump: Pump) -> Result<Box<dyn PumpDriver>> {
        Err(JobError::HardwareAbsent(pump.device().into()))
    }
}

/// Hardware for this build: the Pi drivers when compiled in, else the
/// simulator, else nothing.
#[cfg(any(feature = "gpio", feature = "adc"))]
pub fn default_provider(config: &Config) -> SharedHardware {
    #[cfg(feature = "gpio")]
    let hw = rpi::RpiHardware::new(config.pwm.frequency_hz);
    #[cfg(not(feature = "gpio"))]
    let hw = {
        let _ = config;
        AdcOnly
    };
    Arc::new(hw)
}

#[cfg(all(feature = "sim", not(any(feature = "gpio", feature = "adc"))))]
pub fn default_provider(config: &Config) -> SharedHardware {
    Arc::new(sim::SimBioreactor::from_config(config))
}

#[cfg(not(any(feature = "sim", feature = "gpio", feature = "adc")))]
pub fn default_provider(_config: &Config) -> SharedHardware {
    Arc::new(NullHardware)
}

#[cfg(all(feature = "adc", not(feature = "gpio")))]
struct AdcOnly;

#[cfg(all(feature = "adc", not(feature = "gpio")))]
impl HardwareProvider for AdcOnly {
    fn pwm(&self, channel: u8) -> Result<Box<dyn PwmOutput>> {
        NullHardware.pwm(channel)
    }
    fn adc(&self) -> Result<Box<dyn AdcReader>> {
        Ok(Box::new(ads1115::Ads1115::open(ads1115::DEFAULT_ADDR)?))
    }
    fn thermometer(&self) -> Result<Box<dyn Thermometer>> {
        NullHardware.thermometer()
    }
    fn rpm_sensor(&self) -> Result<Box<dyn RpmSensor>> {
        NullHardware.rpm_sensor()
    }
    fn ir_led(&self) -> Result<Box<dyn PwmOutput>> {
        NullHardware.ir_led()
    }
    fn pump(&self, pump: Pump) -> Result<Box<dyn PumpDriver>> {
        NullHardware.pump(pump)
    }
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// A PWM output together with the intermittent-cache lock that makes this
/// job its only writer. The output is set to 0 before the lock is released.
pub struct ClaimedPwm {
    pub output: Box<dyn PwmOutput>,
    lock: LockGuard,
}

impl ClaimedPwm {
    pub fn lock_key(channel: u8) -> String {
        format!("pwm/{channel}")
    }

    /// Fails fast with `ResourceBusy` when another job holds the channel.
    pub async fn claim(
        caches: &Caches,
        hardware: &dyn HardwareProvider,
        channel: u8,
        job: &str,
    ) -> Result<Self> {
        let lock = caches
            .intermittent
            .try_lock(&Self::lock_key(channel), &holder_tag(job))
            .await?;
        let output = hardware.pwm(channel)?;
        Ok(Self { output, lock })
    }

    pub async fn release(mut self) -> Result<()> {
        let off = self.output.set_duty_cycle(0.0);
        self.lock.release().await?;
        off
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_hardware_reports_absence() {
        let hw = NullHardware;
        assert!(matches!(hw.pwm(1), Err(JobError::HardwareAbsent(_))));
        assert!(matches!(hw.adc(), Err(JobError::HardwareAbsent(_))));
        assert!(matches!(
            hw.pump(Pump::Waste),
            Err(JobError::HardwareAbsent(d)) if d == "waste_pump"
        ));
    }

    #[tokio::test]
    async fn pwm_channel_has_a_single_owner() {
        let caches = Caches::in_memory().await.unwrap();
        let hw: SharedHardware = Arc::new(RecordingPwm);
        let first = ClaimedPwm::claim(&caches, hw.as_ref(), 1, "stirring").await.unwrap();
        let second = ClaimedPwm::claim(&caches, hw.as_ref(), 1, "heater").await;
        assert!(matches!(second, Err(JobError::ResourceBusy { .. })));
        first.release().await.unwrap();
        ClaimedPwm::claim(&caches, hw.as_ref(), 1, "heater")
            .await
            .unwrap()
            .release()
            .await
            .unwrap();
    }

    struct RecordingPwm;

    struct Out(u8, f64);

    impl PwmOutput for Out {
        fn channel(&self) -> u8 {
            self.0
        }
        fn set_duty_cycle(&mut self, duty: f64) -> Result<()> {
            self.1 = duty.clamp(0.0, 100.0);
            Ok(())
        }
        fn duty_cycle(&self) -> f64 {
            self.1
        }
    }

    impl HardwareProvider for RecordingPwm {
        fn pwm(&self, channel: u8) -> Result<Box<dyn PwmOutput>> {
            Ok(Box::new(Out(channel, 0.0)))
        }
        fn adc(&self) -> Result<Box<dyn AdcReader>> {
            NullHardware.adc()
        }
        fn thermometer(&self) -> Result<Box<dyn Thermometer>> {
            NullHardware.thermometer()
        }
        fn rpm_sensor(&self) -> Result<Box<dyn RpmSensor>> {
            NullHardware.rpm_sensor()
        }
        fn ir_led(&self) -> Result<Box<dyn PwmOutput>> {
            NullHardware.ir_led()
        }
        fn pump(&self, pump: Pump) -> Result<Box<dyn PumpDriver>> {
            NullHardware.pump(pump)
        }
    }
}
