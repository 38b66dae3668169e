//! ADS1115 16-bit ADC over I2C for soil moisture sensing.
//!
//! Reads one single-ended channel at PGA ±4.096 V, 128 SPS, single-shot mode.
//! At that gain one LSB is 125 µV, so calibrated output is a fixed scale of
//! the raw count.  The driver itself needs the `adc` feature (rppal); the
//! register math below is always compiled so it can be tested on any host.

use crate::sensor::{Millivolts, RawSample};

// ── ADS1115 register addresses ──────────────────────────────────────────────

/// Conversion result register (read-only, 16-bit signed).
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const REG_CONFIG: u8 = 0x01;

// ── Config register bit fields ──────────────────────────────────────────────
//
// Layout (MSB first):
//   [15]    OS      : write 1 to start single-shot conversion
//   [14:12] MUX     : input multiplexer (channel selection)
//   [11:9]  PGA     : programmable gain amplifier
//   [8]     MODE    : 0 = continuous, 1 = single-shot
//   [7:5]   DR      : data rate
//   [4:0]   comparator, disabled (COMP_QUE = 11)

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// MUX values for single-ended reads (AINx vs GND).
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const MUX_SHIFT: u8 = 12;
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

/// Highest single-ended channel index.
pub const MAX_CHANNEL: u8 = 3;

/// Largest single-ended conversion result (15-bit unsigned).
pub const FULL_SCALE: RawSample = 32767;

/// Full-scale input at PGA ±4.096 V, in millivolts.
const FSR_MV: i64 = 4096;

/// Build the config register value for a single-ended read on `channel`.
#[cfg_attr(not(feature = "adc"), allow(dead_code))]
fn config_for_channel(channel: u8) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel as usize] << MUX_SHIFT)
}

/// Scale a raw count to millivolts at the configured gain.
pub fn to_millivolts(raw: RawSample) -> Millivolts {
    (raw as i64 * FSR_MV / (FULL_SCALE as i64 + 1)) as Millivolts
}

// ── Driver ──────────────────────────────────────────────────────────────────

#[cfg(feature = "adc")]
pub use driver::Ads1115;

#[cfg(feature = "adc")]
mod driver {
    use std::{thread, time::Duration};

    use rppal::i2c::I2c;

    use super::*;
    use crate::error::SensorError;
    use crate::sensor::SensorSource;

    /// Conversion time at 128 SPS is ~7.8 ms.  We wait 9 ms for margin.
    const CONVERSION_WAIT: Duration = Duration::from_millis(9);

    /// Bit 15 of the config register: conversion-ready flag when read.
    const OS_READY_BIT: u16 = 1 << 15;

    /// ADS1115 driver backed by `rppal::i2c`, bound to one input channel.
    pub struct Ads1115 {
        i2c: I2c,
        channel: u8,
    }

    impl Ads1115 {
        /// Open I2C bus 1 and address the ADS1115 at `addr`.
        pub fn new(addr: u16, channel: u8) -> anyhow::Result<Self> {
            anyhow::ensure!(
                channel <= MAX_CHANNEL,
                "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})",
            );

            let mut i2c = I2c::new()?;
            i2c.set_slave_address(addr)?;

            tracing::info!(
                addr = format_args!("0x{addr:02x}"),
                channel,
                "ads1115 initialised"
            );

            Ok(Self { i2c, channel })
        }

        fn convert(&mut self) -> Result<i16, rppal::i2c::Error> {
            let config = config_for_channel(self.channel);
            self.i2c.block_write(REG_CONFIG, &config.to_be_bytes())?;

            thread::sleep(CONVERSION_WAIT);

            // One wait is normally enough at 128 SPS.
            for _ in 0..3 {
                let mut buf = [0u8; 2];
                self.i2c.block_read(REG_CONFIG, &mut buf)?;
                if u16::from_be_bytes(buf) & OS_READY_BIT != 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(2));
            }

            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONVERSION, &mut buf)?;
            Ok(i16::from_be_bytes(buf))
        }
    }

    impl SensorSource for Ads1115 {
        fn read(&mut self) -> Result<RawSample, SensorError> {
            let raw = self
                .convert()
                .map_err(|e| SensorError::ReadFailed(e.to_string()))? as RawSample;
            // Single-ended reads are non-negative; anything else is bus noise.
            if !(0..=FULL_SCALE).contains(&raw) {
                return Err(SensorError::OutOfRange(raw));
            }
            Ok(raw)
        }

        fn calibrate(&self, raw: RawSample) -> Option<Millivolts> {
            Some(to_millivolts(raw))
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
