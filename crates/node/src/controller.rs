//! Fail-safe relay state machine.
//!
//! ```text
//! Closed ──WaterOn(d)──▶ Open(now+d) ──WaterOff────────▶ Closed
//!   ▲  │                  │    ▲      ──tick, now≥deadline──▶ Closed
//!   │  └─WaterOff (no-op) └────┘ WaterOn(d): deadline = now+d
//!   └── Unknown: no transition, in any state
//! ```
//!
//! Every `Open` carries its own deadline and the controller, not the remote
//! peer, guarantees the return to `Closed`.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::protocol::Command;
use crate::relay::Actuator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Closed,
    Open { deadline: Instant },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Command,
    Watchdog,
}

/// What a call to [`ActuatorController::apply`] or
/// [`ActuatorController::tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Opened { until: Instant },
    /// Deadline moved to `now + d`; the old remainder is discarded.
    Extended { until: Instant },
    Closed(CloseReason),
    Unchanged,
}

pub struct ActuatorController<A: Actuator> {
    actuator: A,
    state: RelayState,
    max_on: Duration,
}

impl<A: Actuator> ActuatorController<A> {
    /// Takes ownership of the actuator and drives it off.  `max_on` caps the
    /// duration any single command may request.
    pub fn new(mut actuator: A, max_on: Duration) -> Self {
        actuator.set(false);
        Self {
            actuator,
            state: RelayState::Closed,
            max_on,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, RelayState::Open { .. })
    }

    /// Time left before the watchdog closes the relay.
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        match self.state {
            RelayState::Open { deadline } => Some(deadline.saturating_duration_since(now)),
            RelayState::Closed => None,
        }
    }

    pub fn actuator(&self) -> &A {
        &self.actuator
    }

    pub fn apply(&mut self, cmd: &Command, now: Instant) -> Transition {
        match cmd {
            Command::WaterOn(requested) => {
                let duration = if *requested > self.max_on {
                    warn!(
                        requested_ms = requested.as_millis() as u64,
                        max_ms = self.max_on.as_millis() as u64,
                        "watering duration clamped"
                    );
                    self.max_on
                } else {
                    *requested
                };
                let until = now + duration;

                match self.state {
                    RelayState::Closed => {
                        self.actuator.set(true);
                        self.state = RelayState::Open { deadline: until };
                        info!(duration_ms = duration.as_millis() as u64, "valve opened");
                        Transition::Opened { until }
                    }
                    RelayState::Open { .. } => {
                        self.state = RelayState::Open { deadline: until };
                        info!(duration_ms = duration.as_millis() as u64, "valve deadline refreshed");
                        Transition::Extended { until }
                    }
                }
            }
            Command::WaterOff => match self.state {
                RelayState::Open { .. } => {
                    self.close();
                    info!("valve closed by command");
                    Transition::Closed(CloseReason::Command)
                }
                RelayState::Closed => Transition::Unchanged,
            },
            Command::Unknown(_) => Transition::Unchanged,
        }
    }

    /// Watchdog: close once the deadline has passed.
    pub fn tick(&mut self, now: Instant) -> Transition {
        match self.state {
            RelayState::Open { deadline } if now >= deadline => {
                self.close();
                warn!(
                    overdue_ms = now.saturating_duration_since(deadline).as_millis() as u64,
                    "watchdog closed valve"
                );
                Transition::Closed(CloseReason::Watchdog)
            }
            _ => Transition::Unchanged,
        }
    }

    /// Drive the actuator off regardless of state.
    pub fn force_off(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        self.actuator.set(false);
        self.state = RelayState::Closed;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
