//! Error taxonomy for the control loop.
//!
//! None of these are fatal.  Link errors are retried by the connectivity
//! manager, channel errors are recovered by re-opening on the next tick,
//! sensor errors skip a tick and protocol errors discard a frame.

use std::time::Duration;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("endpoint unreachable: {0}")]
    Unreachable(String),
}

// ---------------------------------------------------------------------------
// Secure channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("link is down")]
    LinkDown,
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error("no open session")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

impl ChannelError {
    /// Whether this error happened while establishing a session.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Self::HandshakeFailed(_) | Self::Timeout)
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SensorError {
    #[error("adc read failed: {0}")]
    ReadFailed(String),
    #[error("reading {0} outside the converter range")]
    OutOfRange(i32),
}

// ---------------------------------------------------------------------------
// Command protocol
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("frame of {0} bytes exceeds the frame limit")]
    Oversize(usize),
    #[error("frame is not ASCII")]
    NotAscii,
    #[error("unknown token '{0}'")]
    UnknownToken(String),
    #[error("invalid duration '{0}' (expected positive milliseconds)")]
    BadDuration(String),
    #[error("unexpected argument '{0}'")]
    UnexpectedArgument(String),
}

// ---------------------------------------------------------------------------
// Reporter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReportError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("payload is {0} bytes, over the 64 byte send buffer")]
    Oversize(usize),
    #[error("failed to encode reading: {0}")]
    Encode(String),
}
