//! Telemetry reporter.
//!
//! Serialises a [`Reading`] as one JSON line and sends it over the secure
//! channel, opening a session first if needed.  Failures are logged and
//! returned for the node to count; the next tick is the retry.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{Connector, Endpoint, SecureChannel};
use crate::error::ReportError;
use crate::sensor::Reading;

/// Send buffer size on the wire, newline included.
pub const MAX_PAYLOAD: usize = 64;

/// `{"ts":<unix secs>,"moisture":<int>}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub ts: i64,
    pub moisture: i32,
}

impl From<&Reading> for WirePayload {
    fn from(r: &Reading) -> Self {
        Self {
            ts: r.ts(),
            moisture: r.value(),
        }
    }
}

/// Encode one reading as a newline-terminated JSON line.
pub fn encode(reading: &Reading) -> Result<Vec<u8>, ReportError> {
    let mut buf = serde_json::to_vec(&WirePayload::from(reading))
        .map_err(|e| ReportError::Encode(e.to_string()))?;
    buf.push(b'\n');
    if buf.len() > MAX_PAYLOAD {
        return Err(ReportError::Oversize(buf.len()));
    }
    Ok(buf)
}

pub struct Reporter {
    endpoint: Endpoint,
}

impl Reporter {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Best-effort send of one reading.
    pub async fn report<C: Connector>(
        &self,
        channel: &mut SecureChannel<C>,
        reading: &Reading,
    ) -> Result<(), ReportError> {
        let result = self.try_report(channel, reading).await;
        match &result {
            Ok(()) => {
                debug!(moisture = reading.value(), ts = reading.ts(), "reading reported");
            }
            Err(e) => warn!("report dropped: {e}"),
        }
        result
    }

    async fn try_report<C: Connector>(
        &self,
        channel: &mut SecureChannel<C>,
        reading: &Reading,
    ) -> Result<(), ReportError> {
        let payload = encode(reading)?;
        if !channel.is_open() {
            channel.open(&self.endpoint).await?;
        }
        channel.send(&payload).await?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
