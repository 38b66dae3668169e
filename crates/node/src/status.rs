use std::collections::VecDeque;

use serde::Serialize;

use crate::sensor::{now_unix, Reading};

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    pub ts: i64,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Sensor,
    Report,
    Command,
    Valve,
    Link,
    Escalation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub ticks: u64,
    pub samples: u64,
    pub sensor_faults: u64,
    pub reports_sent: u64,
    pub reports_failed: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub watchdog_trips: u64,
    pub escalations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LastReading {
    pub ts: i64,
    pub raw: i32,
    pub millivolts: Option<i32>,
}

/// In-memory health of the node: counters, the last reading and a bounded
/// log of notable events.
#[derive(Debug, Default)]
pub struct NodeStatus {
    pub counters: Counters,
    pub last_reading: Option<LastReading>,
    events: VecDeque<NodeEvent>,
}

/// JSON-serialisable snapshot.
#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub counters: Counters,
    pub last_reading: Option<LastReading>,
    pub events: Vec<NodeEvent>,
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

impl NodeStatus {
    pub fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(MAX_EVENTS),
            ..Self::default()
        }
    }

    pub fn record_reading(&mut self, reading: &Reading) {
        self.counters.samples += 1;
        self.last_reading = Some(LastReading {
            ts: reading.ts(),
            raw: reading.raw(),
            millivolts: reading.millivolts(),
        });
    }

    pub fn record_sensor_fault(&mut self, detail: String) {
        self.counters.sensor_faults += 1;
        self.push_event(EventKind::Sensor, detail);
    }

    pub fn record_report(&mut self, result: Result<(), String>) {
        match result {
            Ok(()) => self.counters.reports_sent += 1,
            Err(detail) => {
                self.counters.reports_failed += 1;
                self.push_event(EventKind::Report, detail);
            }
        }
    }

    pub fn record_command(&mut self, accepted: bool, detail: String) {
        if accepted {
            self.counters.commands_applied += 1;
        } else {
            self.counters.commands_rejected += 1;
        }
        self.push_event(EventKind::Command, detail);
    }

    pub fn record_valve(&mut self, on: bool, detail: &str) {
        let state_str = if on { "ON" } else { "OFF" };
        self.push_event(EventKind::Valve, format!("valve {state_str} ({detail})"));
    }

    pub fn record_watchdog(&mut self) {
        self.counters.watchdog_trips += 1;
        self.record_valve(false, "watchdog");
    }

    pub fn record_link(&mut self, detail: String) {
        self.push_event(EventKind::Link, detail);
    }

    pub fn record_escalation(&mut self, failures: u32) {
        self.counters.escalations += 1;
        self.push_event(
            EventKind::Escalation,
            format!("{failures} consecutive handshake failures"),
        );
    }

    pub fn events(&self) -> impl Iterator<Item = &NodeEvent> {
        self.events.iter()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            counters: self.counters,
            last_reading: self.last_reading,
            events: self.events.iter().cloned().collect(),
        }
    }

    // -- Internal --------------------------------------------------------

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(NodeEvent {
            ts: now_unix(),
            kind,
            detail,
        });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
