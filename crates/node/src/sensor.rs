//! Sensor seam and the per-tick [`Reading`].

use time::OffsetDateTime;

use crate::error::SensorError;

/// Raw converter counts as produced by the ADC.
pub type RawSample = i32;

pub type Millivolts = i32;

/// Anything that can produce a soil-moisture sample on demand.
pub trait SensorSource {
    fn read(&mut self) -> Result<RawSample, SensorError>;

    /// Convert a raw sample to millivolts, if a calibration is available.
    fn calibrate(&self, raw: RawSample) -> Option<Millivolts>;
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One sample taken by the scheduler.  Immutable once created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    ts: i64,
    raw: RawSample,
    millivolts: Option<Millivolts>,
}

impl Reading {
    pub fn new(ts: i64, raw: RawSample, millivolts: Option<Millivolts>) -> Self {
        Self { ts, raw, millivolts }
    }

    /// Unix timestamp (seconds) of the sample.
    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn raw(&self) -> RawSample {
        self.raw
    }

    pub fn millivolts(&self) -> Option<Millivolts> {
        self.millivolts
    }

    /// The single integer reported upstream: calibrated millivolts when
    /// available, otherwise raw counts.
    pub fn value(&self) -> i32 {
        self.millivolts.unwrap_or(self.raw)
    }
}

/// Take exactly one sample from `source`.
pub fn sample<S: SensorSource + ?Sized>(source: &mut S) -> Result<Reading, SensorError> {
    let raw = source.read()?;
    Ok(Reading::new(now_unix(), raw, source.calibrate(raw)))
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

// ===========================================================================
// Tests
// ===========================================================================
