//! Stateful soil moisture sensor simulator for local development.
//!
//! Models realistic capacitive sensor behaviour on a single channel:
//! - Temporal coherence via random walk with mean reversion
//! - Gradual drying drift (evaporation)
//! - Per-reading ADC electronic noise
//! - Occasional spikes and, in the flaky scenario, outright read failures
//!
//! Output is in ADS1115 counts so the same millivolt scale applies.

use std::fmt;

use crate::adc;
use crate::error::SensorError;
use crate::sensor::{Millivolts, RawSample, SensorSource};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal(rng: &mut fastrand::Rng) -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += rng.f64();
    }
    sum - 6.0
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Pre-configured simulation profiles selectable via the `scenario` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range, slow drift toward dry.  Moderate noise.
    Drying,
    /// Hovers near the centre.  Low noise, rare spikes.
    Stable,
    /// High noise, frequent spikes and ~5% failed reads.  Exercises the
    /// skip-tick path.
    Flaky,
    /// Starts near the wet end.  Very slow drying.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying, // default
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// Per-scenario tuning, all in ADC units except the probabilities.
struct Profile {
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    noise_sigma: f64,
    spike_prob: f64,
    spike_sigma: f64,
    fault_prob: f64,
    /// 0.0 = at raw_wet (wettest), 1.0 = at raw_dry (driest).
    start_frac: f64,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        let (drift, walk_sigma, mean_reversion, noise_sigma, spike_prob, spike_sigma, fault_prob, start_frac) =
            match scenario {
                Scenario::Drying => (15.0, 150.0, 0.02, 80.0, 0.03, 2000.0, 0.0, 0.5),
                Scenario::Stable => (2.0, 60.0, 0.05, 40.0, 0.005, 1000.0, 0.0, 0.5),
                Scenario::Flaky => (10.0, 250.0, 0.02, 200.0, 0.10, 3000.0, 0.05, 0.5),
                Scenario::Wet => (3.0, 80.0, 0.02, 60.0, 0.02, 1500.0, 0.0, 0.2),
            };
        Self {
            drift,
            walk_sigma,
            mean_reversion,
            noise_sigma,
            spike_prob,
            spike_sigma,
            fault_prob,
            start_frac,
        }
    }
}

/// Simulated capacitive probe behind an ADS1115.
pub struct SimSensor {
    rng: fastrand::Rng,
    profile: Profile,
    /// Current "true" soil moisture in ADC units.  Evolves each read.
    base: f64,
    center: f64,
    raw_dry: f64,
    raw_wet: f64,
}

impl SimSensor {
    /// `raw_dry` / `raw_wet` are the calibration endpoints of a typical
    /// capacitive sensor on an ADS1115 (26000 / 12000).
    pub fn new(scenario: Scenario, raw_dry: f64, raw_wet: f64) -> Self {
        Self::with_rng(scenario, raw_dry, raw_wet, fastrand::Rng::new())
    }

    pub fn with_rng(scenario: Scenario, raw_dry: f64, raw_wet: f64, rng: fastrand::Rng) -> Self {
        let profile = Profile::for_scenario(scenario);
        let base = raw_wet + profile.start_frac * (raw_dry - raw_wet);
        Self {
            rng,
            profile,
            base,
            center: (raw_dry + raw_wet) / 2.0,
            raw_dry,
            raw_wet,
        }
    }

    fn gaussian(&mut self, sigma: f64) -> f64 {
        sigma * approx_std_normal(&mut self.rng)
    }
}

impl SensorSource for SimSensor {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        if self.rng.f64() < self.profile.fault_prob {
            return Err(SensorError::ReadFailed("simulated i2c timeout".into()));
        }

        // -- Evolve the base value ----------------------------------------
        let pull = self.profile.mean_reversion * (self.center - self.base);
        let walk = self.gaussian(self.profile.walk_sigma);
        self.base = (self.base + self.profile.drift + pull + walk)
            .clamp(self.raw_wet - 500.0, self.raw_dry + 500.0);

        // -- Build the instantaneous reading ------------------------------
        let noise = self.gaussian(self.profile.noise_sigma);
        let spike = if self.rng.f64() < self.profile.spike_prob {
            self.gaussian(self.profile.spike_sigma)
        } else {
            0.0
        };

        let reading = (self.base + noise + spike).round();
        Ok(reading.clamp(0.0, adc::FULL_SCALE as f64) as RawSample)
    }

    fn calibrate(&self, raw: RawSample) -> Option<Millivolts> {
        Some(adc::to_millivolts(raw))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
