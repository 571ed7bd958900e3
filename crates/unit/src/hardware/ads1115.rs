//! ADS1115 16-bit ADC over I2C, used for the OD photodiodes.
//!
//! Single-shot, single-ended reads at PGA ±4.096 V and 860 SPS so a batch of
//! reads spans a few mains cycles quickly enough for hum fitting.

use std::thread;
use std::time::{Duration, Instant};

use rppal::i2c::I2c;

use super::{AdcReader, AdcSample};
use crate::error::{JobError, Result};

pub const DEFAULT_ADDR: u16 = 0x48;

// ── Registers ───────────────────────────────────────────────────────────────

const REG_CONVERSION: u8 = 0x00;
const REG_CONFIG: u8 = 0x01;

// Config register layout (MSB first):
//   [15]    OS       start a single-shot conversion / ready flag
//   [14:12] MUX      input multiplexer
//   [11:9]  PGA
//   [8]     MODE     1 = single-shot
//   [7:5]   DR       data rate
//   [1:0]   COMP_QUE 11 = comparator off

/// OS=1, PGA=001 (±4.096 V), MODE=1, DR=111 (860 SPS), COMP_QUE=11.
const CONFIG_BASE: u16 = 0b1_000_001_1_111_0_0_0_11;

const MUX_SHIFT: u8 = 12;
/// AINx vs GND for x in 0..4.
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// One conversion at 860 SPS takes ~1.2 ms.
const CONVERSION_WAIT: Duration = Duration::from_micros(1300);

const OS_READY_BIT: u16 = 1 << 15;

const FULL_SCALE_VOLTS: f64 = 4.096;

/// Config word for a single-ended read of 1-based `channel`.
fn config_for_channel(channel: u8) -> Option<u16> {
    let mux = MUX_SINGLE_ENDED.get(usize::from(channel).checked_sub(1)?)?;
    Some(CONFIG_BASE | (mux << MUX_SHIFT))
}

fn raw_to_volts(raw: i16) -> f64 {
    f64::from(raw.max(0)) * FULL_SCALE_VOLTS / 32768.0
}

fn i2c_err(e: rppal::i2c::Error) -> JobError {
    JobError::tick(format!("ads1115: {e}"))
}

pub struct Ads1115 {
    i2c: I2c,
    epoch: Instant,
}

impl Ads1115 {
    /// Open I2C bus 1 at `addr`. A missing bus is reported as absent hardware.
    pub fn open(addr: u16) -> Result<Self> {
        let mut i2c = I2c::new().map_err(|e| JobError::HardwareAbsent(format!("i2c bus: {e}")))?;
        i2c.set_slave_address(addr)
            .map_err(|e| JobError::HardwareAbsent(format!("ads1115 at 0x{addr:02x}: {e}")))?;
        tracing::info!(addr = format_args!("0x{addr:02x}"), "ads1115 initialised");
        Ok(Self {
            i2c,
            epoch: Instant::now(),
        })
    }

    fn convert(&mut self, config: u16) -> Result<i16> {
        self.i2c
            .block_write(REG_CONFIG, &config.to_be_bytes())
            .map_err(i2c_err)?;
        thread::sleep(CONVERSION_WAIT);

        for _ in 0..3 {
            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONFIG, &mut buf).map_err(i2c_err)?;
            if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                break;
            }
            thread::sleep(Duration::from_micros(300));
        }

        let mut buf = [0u8; 2];
        self.i2c
            .block_read(REG_CONVERSION, &mut buf)
            .map_err(i2c_err)?;
        Ok(i16::from_be_bytes(buf))
    }
}

impl AdcReader for Ads1115 {
    fn read_channel(&mut self, channel: u8) -> Result<AdcSample> {
        let config = config_for_channel(channel).ok_or_else(|| {
            JobError::InvalidArgument(format!("ads1115 channel {channel} out of range (1-4)"))
        })?;
        let raw = self.convert(config)?;
        Ok(AdcSample {
            t: self.epoch.elapsed().as_secs_f64(),
            volts: raw_to_volts(raw),
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // -- Config register construction -----------------------------------------

    #[test]
    fn config_registers_per_channel() {
        assert_eq!(config_for_channel(1), Some(0xC3E3));
        assert_eq!(config_for_channel(2), Some(0xD3E3));
        assert_eq!(config_for_channel(3), Some(0xE3E3));
        assert_eq!(config_for_channel(4), Some(0xF3E3));
    }

    #[test]
    fn channels_outside_one_to_four_have_no_config() {
        assert_eq!(config_for_channel(0), None);
        assert_eq!(config_for_channel(5), None);
    }

    #[test]
    fn config_base_fields() {
        assert_eq!((CONFIG_BASE >> 15) & 1, 1, "OS starts a conversion");
        assert_eq!((CONFIG_BASE >> 9) & 0b111, 0b001, "PGA ±4.096 V");
        assert_eq!((CONFIG_BASE >> 8) & 1, 1, "single-shot");
        assert_eq!((CONFIG_BASE >> 5) & 0b111, 0b111, "860 SPS");
        assert_eq!(CONFIG_BASE & 0b11, 0b11, "comparator off");
    }

    // -- Scaling --------------------------------------------------------------

    #[test]
    fn raw_scaling() {
        assert_eq!(raw_to_volts(0), 0.0);
        assert_eq!(raw_to_volts(16384), 2.048);
        assert_eq!(raw_to_volts(-5), 0.0);
    }
}
