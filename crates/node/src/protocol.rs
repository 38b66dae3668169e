//! Inbound command protocol.
//!
//! A frame is a short ASCII token, optionally followed by one argument, and
//! ends at the first delimiter (`\n`, `\r`, `;`, NUL) or the end of the
//! buffer.  Tokens are case-insensitive:
//!
//! ```text
//! WATER_ON [ms]   open the valve for ms milliseconds (default if absent)
//! WATER_OFF       close the valve
//! ON | OFF        aliases used on the valve/<node>/set topic
//! ```
//!
//! Anything else becomes [`Command::Unknown`].  The parser never fails.

use std::time::Duration;

use tracing::{debug, warn};

use crate::channel::{Connector, SecureChannel, MAX_FRAME};
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    WaterOn(Duration),
    WaterOff,
    /// Unrecognised input, kept verbatim for logging.  Never actuates.
    Unknown(Vec<u8>),
}

const DELIMITERS: &[u8] = b"\n\r;\0";

pub struct CommandProtocol {
    default_on: Duration,
}

impl CommandProtocol {
    /// `default_on` applies to `WATER_ON` without a duration.
    pub fn new(default_on: Duration) -> Self {
        Self { default_on }
    }

    /// Parse the first frame in `bytes`, reporting why it was rejected.
    pub fn parse_frame(&self, bytes: &[u8]) -> Result<Command, ProtocolError> {
        let end = bytes
            .iter()
            .position(|b| DELIMITERS.contains(b))
            .unwrap_or(bytes.len());
        let frame = &bytes[..end];

        if frame.len() > MAX_FRAME {
            return Err(ProtocolError::Oversize(frame.len()));
        }
        if !frame.is_ascii() {
            return Err(ProtocolError::NotAscii);
        }
        // ASCII is valid UTF-8.
        let text = std::str::from_utf8(frame)
            .map_err(|_| ProtocolError::NotAscii)?
            .trim();

        let mut parts = text.split_ascii_whitespace();
        let Some(token) = parts.next() else {
            return Err(ProtocolError::Empty);
        };
        let arg = parts.next();
        if let Some(extra) = parts.next() {
            return Err(ProtocolError::UnexpectedArgument(extra.to_string()));
        }

        match token.to_ascii_uppercase().as_str() {
            "WATER_ON" | "ON" => match arg {
                None => Ok(Command::WaterOn(self.default_on)),
                Some(ms) => parse_millis(ms).map(Command::WaterOn),
            },
            "WATER_OFF" | "OFF" => match arg {
                None => Ok(Command::WaterOff),
                Some(a) => Err(ProtocolError::UnexpectedArgument(a.to_string())),
            },
            _ => Err(ProtocolError::UnknownToken(token.to_string())),
        }
    }

    /// Total parse: every byte sequence maps to exactly one [`Command`].
    pub fn parse(&self, bytes: &[u8]) -> Command {
        self.parse_frame(bytes)
            .unwrap_or_else(|_| Command::Unknown(bytes.to_vec()))
    }

    /// One bounded receive on an open channel.  Returns `None` when the
    /// channel is closed, nothing arrived, or the receive failed (which
    /// closes the session for the next tick to re-open).
    pub async fn poll<C: Connector>(
        &self,
        channel: &mut SecureChannel<C>,
        wait: Duration,
    ) -> Option<Command> {
        if !channel.is_open() {
            return None;
        }
        let frame = match channel.receive(wait).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                warn!("command receive failed: {e}");
                return None;
            }
        };

        match self.parse_frame(&frame) {
            Ok(cmd) => {
                debug!(?cmd, "command received");
                Some(cmd)
            }
            Err(reason) => {
                warn!(
                    raw = %String::from_utf8_lossy(&frame).escape_debug(),
                    "discarding command: {reason}"
                );
                Some(Command::Unknown(frame))
            }
        }
    }
}

fn parse_millis(s: &str) -> Result<Duration, ProtocolError> {
    match s.parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Duration::from_millis(ms)),
        _ => Err(ProtocolError::BadDuration(s.to_string())),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
