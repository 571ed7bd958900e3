//! Raspberry Pi drivers via rppal: software PWM outputs, pump relays, the
//! stirrer's hall-effect tachometer and a TMP1075 temperature sensor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};
use rppal::i2c::I2c;

use super::{AdcReader, HardwareProvider, PumpDriver, PwmOutput, RpmSensor, Thermometer};
use crate::error::{JobError, Result};
use crate::estimators::dosing::Pump;

/// BCM pin of each PWM channel, indexed by channel - 1.
const PWM_PINS: [u8; 5] = [17, 13, 16, 12, 18];
const IR_LED_PIN: u8 = 26;
const HALL_PIN: u8 = 21;
const TMP1075_ADDR: u16 = 0x4F;

fn pump_pin(pump: Pump) -> u8 {
    match pump {
        Pump::Media => 23,
        Pump::AltMedia => 24,
        Pump::Waste => 25,
    }
}

fn absent(what: impl std::fmt::Display, e: impl std::fmt::Display) -> JobError {
    JobError::HardwareAbsent(format!("{what}: {e}"))
}

fn output(pin: u8) -> Result<OutputPin> {
    let gpio = Gpio::new().map_err(|e| absent("gpio", e))?;
    let mut out = gpio
        .get(pin)
        .map_err(|e| absent(format_args!("gpio {pin}"), e))?
        .into_output();
    // Fail-safe: off until told otherwise.
    out.set_low();
    Ok(out)
}

pub struct RpiHardware {
    pwm_frequency_hz: f64,
}

impl RpiHardware {
    pub fn new(pwm_frequency_hz: f64) -> Self {
        Self { pwm_frequency_hz }
    }
}

impl HardwareProvider for RpiHardware {
    fn pwm(&self, channel: u8) -> Result<Box<dyn PwmOutput>> {
        let pin = usize::from(channel)
            .checked_sub(1)
            .and_then(|i| PWM_PINS.get(i))
            .ok_or_else(|| JobError::HardwareAbsent(format!("pwm channel {channel}")))?;
        Ok(Box::new(SoftPwm {
            pin: output(*pin)?,
            channel,
            frequency_hz: self.pwm_frequency_hz,
            duty: 0.0,
        }))
    }

    #[cfg(feature = "adc")]
    fn adc(&self) -> Result<Box<dyn AdcReader>> {
        Ok(Box::new(super::ads1115::Ads1115::open(super::ads1115::DEFAULT_ADDR)?))
    }

    #[cfg(not(feature = "adc"))]
    fn adc(&self) -> Result<Box<dyn AdcReader>> {
        Err(JobError::HardwareAbsent("adc (built without the adc feature)".into()))
    }

    fn thermometer(&self) -> Result<Box<dyn Thermometer>> {
        let mut i2c = I2c::new().map_err(|e| absent("i2c bus", e))?;
        i2c.set_slave_address(TMP1075_ADDR)
            .map_err(|e| absent("tmp1075", e))?;
        Ok(Box::new(Tmp1075 { i2c }))
    }

    fn rpm_sensor(&self) -> Result<Box<dyn RpmSensor>> {
        Ok(Box::new(Tachometer::open(HALL_PIN)?))
    }

    fn ir_led(&self) -> Result<Box<dyn PwmOutput>> {
        Ok(Box::new(SoftPwm {
            pin: output(IR_LED_PIN)?,
            channel: 0,
            frequency_hz: self.pwm_frequency_hz,
            duty: 0.0,
        }))
    }

    fn pump(&self, pump: Pump) -> Result<Box<dyn PumpDriver>> {
        Ok(Box::new(RelayPump {
            pin: output(pump_pin(pump))?,
        }))
    }
}

// ---------------------------------------------------------------------------
// Outputs
// ---------------------------------------------------------------------------

struct SoftPwm {
    pin: OutputPin,
    channel: u8,
    frequency_hz: f64,
    duty: f64,
}

impl PwmOutput for SoftPwm {
    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_duty_cycle(&mut self, duty: f64) -> Result<()> {
        let duty = duty.clamp(0.0, 100.0);
        if duty == 0.0 {
            self.pin
                .clear_pwm()
                .map_err(|e| JobError::tick(format!("pwm {}: {e}", self.channel)))?;
            self.pin.set_low();
        } else {
            self.pin
                .set_pwm_frequency(self.frequency_hz, duty / 100.0)
                .map_err(|e| JobError::tick(format!("pwm {}: {e}", self.channel)))?;
        }
        self.duty = duty;
        Ok(())
    }

    fn duty_cycle(&self) -> f64 {
        self.duty
    }
}

struct RelayPump {
    pin: OutputPin,
}

impl PumpDriver for RelayPump {
    fn start(&mut self) -> Result<()> {
        self.pin.set_high();
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.pin.set_low();
        Ok(())
    }
}

impl Drop for RelayPump {
    fn drop(&mut self) {
        self.pin.set_low();
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

struct Tmp1075 {
    i2c: I2c,
}

/// 12-bit left-justified two's complement, 0.0625 °C per LSB.
fn tmp1075_celsius(buf: [u8; 2]) -> f64 {
    f64::from(i16::from_be_bytes(buf) >> 4) * 0.0625
}

impl Thermometer for Tmp1075 {
    fn read_celsius(&mut self) -> Result<f64> {
        let mut buf = [0u8; 2];
        self.i2c
            .block_read(0x00, &mut buf)
            .map_err(|e| JobError::tick(format!("tmp1075: {e}")))?;
        Ok(tmp1075_celsius(buf))
    }
}

/// Counts hall-effect pulses (one per revolution) between reads.
struct Tachometer {
    _pin: InputPin,
    pulses: Arc<AtomicU64>,
    last_count: u64,
    last_read: Instant,
}

impl Tachometer {
    fn open(pin: u8) -> Result<Self> {
        let gpio = Gpio::new().map_err(|e| absent("gpio", e))?;
        let mut input = gpio
            .get(pin)
            .map_err(|e| absent(format_args!("gpio {pin}"), e))?
            .into_input_pullup();
        let pulses = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&pulses);
        input
            .set_async_interrupt(Trigger::FallingEdge, move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .map_err(|e| absent("hall sensor interrupt", e))?;
        Ok(Self {
            _pin: input,
            pulses,
            last_count: 0,
            last_read: Instant::now(),
        })
    }
}

impl RpmSensor for Tachometer {
    fn read_rpm(&mut self) -> Result<f64> {
        let count = self.pulses.load(Ordering::Relaxed);
        let secs = self.last_read.elapsed().as_secs_f64();
        let delta = count - self.last_count;
        self.last_count = count;
        self.last_read = Instant::now();
        if secs <= 0.0 {
            return Ok(0.0);
        }
        Ok(delta as f64 * 60.0 / secs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp1075_conversion() {
        assert_eq!(tmp1075_celsius([0x19, 0x00]), 25.0);
        assert_eq!(tmp1075_celsius([0x25, 0x10]), 37.0625);
        assert_eq!(tmp1075_celsius([0xFF, 0xF0]), -0.0625);
    }

    #[test]
    fn pumps_use_distinct_pins() {
        let pins = [Pump::Media, Pump::AltMedia, Pump::Waste].map(pump_pin);
        assert_ne!(pins[0], pins[1]);
        assert_ne!(pins[1], pins[2]);
        assert!(!PWM_PINS.contains(&pins[0]));
    }
}
