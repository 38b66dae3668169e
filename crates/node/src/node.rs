//! The foreground control loop.
//!
//! One fixed-period tick does, in order:
//!
//! 1. watchdog check
//! 2. drain link events into [`NodeStatus`]
//! 3. sample the sensor exactly once
//! 4. report the reading (opens the channel if needed)
//! 5. poll for one command and apply it
//! 6. watchdog check again
//!
//! Every await inside a tick is bounded by a channel timeout, so sampling
//! and the watchdog keep their cadence whatever the network does.

use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::channel::{Connector, SecureChannel};
use crate::config::NodeConfig;
use crate::controller::{ActuatorController, CloseReason, Transition};
use crate::link::{LinkEvent, LinkHandle};
use crate::protocol::{Command, CommandProtocol};
use crate::relay::Actuator;
use crate::report::Reporter;
use crate::sensor::{self, SensorSource};
use crate::status::NodeStatus;

/// What happened during one tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickOutcome {
    pub sampled: bool,
    pub reported: bool,
    pub command: Option<Command>,
    pub watchdog_closed: bool,
}

pub struct Node<S, C, A>
where
    S: SensorSource,
    C: Connector,
    A: Actuator,
{
    sensor: S,
    channel: SecureChannel<C>,
    controller: ActuatorController<A>,
    reporter: Reporter,
    protocol: CommandProtocol,
    link: LinkHandle,
    link_events: broadcast::Receiver<LinkEvent>,
    period: Duration,
    command_wait: Duration,
    relink_after: Duration,
    relink_at: Option<Instant>,
    status: NodeStatus,
}

impl<S, C, A> Node<S, C, A>
where
    S: SensorSource,
    C: Connector,
    A: Actuator,
{
    pub fn new(
        sensor: S,
        channel: SecureChannel<C>,
        controller: ActuatorController<A>,
        link: LinkHandle,
        cfg: &NodeConfig,
    ) -> Self {
        let link_events = link.events();
        Self {
            sensor,
            channel,
            controller,
            reporter: Reporter::new(cfg.endpoint()),
            protocol: CommandProtocol::new(cfg.default_on()),
            link,
            link_events,
            period: cfg.period(),
            command_wait: cfg.command_wait(),
            relink_after: cfg.relink_after(),
            relink_at: None,
            status: NodeStatus::new(),
        }
    }

    pub fn status(&self) -> &NodeStatus {
        &self.status
    }

    pub fn controller(&self) -> &ActuatorController<A> {
        &self.controller
    }

    pub fn channel(&self) -> &SecureChannel<C> {
        &self.channel
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    /// Tick forever.  Cancel by dropping the future, then call
    /// [`Node::shutdown`].
    pub async fn run(&mut self) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period_ms = self.period.as_millis() as u64, "sampling loop started");

        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&mut self) -> TickOutcome {
        self.status.counters.ticks += 1;
        let mut out = TickOutcome {
            watchdog_closed: self.watchdog(),
            ..TickOutcome::default()
        };

        self.drain_link_events();

        match sensor::sample(&mut self.sensor) {
            Ok(reading) => {
                out.sampled = true;
                self.status.record_reading(&reading);

                let result = self.reporter.report(&mut self.channel, &reading).await;
                out.reported = result.is_ok();
                self.status.record_report(result.map_err(|e| e.to_string()));
            }
            Err(e) => {
                warn!("sensor read failed; skipping report: {e}");
                self.status.record_sensor_fault(e.to_string());
            }
        }

        if let Some(failures) = self.channel.take_escalation() {
            self.status.record_escalation(failures);
        }

        if let Some(cmd) = self.protocol.poll(&mut self.channel, self.command_wait).await {
            self.handle_command(&cmd);
            out.command = Some(cmd);
        }

        out.watchdog_closed |= self.watchdog();
        out
    }

    /// Relay off, then release the session.
    pub async fn shutdown(&mut self) {
        self.controller.force_off();
        self.status.record_valve(false, "shutdown");
        self.channel.close().await;

        match serde_json::to_string(&self.status.snapshot().counters) {
            Ok(counters) => info!(%counters, "node stopped"),
            Err(_) => info!("node stopped"),
        }
    }

    // -- Internal ------------------------------------------------------------

    fn watchdog(&mut self) -> bool {
        match self.controller.tick(Instant::now()) {
            Transition::Closed(CloseReason::Watchdog) => {
                self.status.record_watchdog();
                true
            }
            _ => false,
        }
    }

    fn handle_command(&mut self, cmd: &Command) {
        let transition = self.controller.apply(cmd, Instant::now());
        match cmd {
            Command::Unknown(raw) => self.status.record_command(
                false,
                format!("rejected {:?}", String::from_utf8_lossy(raw)),
            ),
            _ => self.status.record_command(true, format!("{cmd:?} -> {transition:?}")),
        }
        match transition {
            Transition::Opened { .. } => self.status.record_valve(true, "command"),
            Transition::Closed(_) => self.status.record_valve(false, "command"),
            Transition::Extended { .. } | Transition::Unchanged => {}
        }
    }

    fn drain_link_events(&mut self) {
        loop {
            match self.link_events.try_recv() {
                Ok(LinkEvent::Ready) => {
                    self.relink_at = None;
                    self.status.record_link("link up".into());
                }
                Ok(LinkEvent::Lost) => self.status.record_link("link lost".into()),
                Ok(LinkEvent::GaveUp { attempts }) => {
                    warn!(
                        attempts,
                        retry_in_s = self.relink_after.as_secs(),
                        "link manager gave up"
                    );
                    self.relink_at = Some(Instant::now() + self.relink_after);
                    self.status
                        .record_link(format!("gave up after {attempts} attempts"));
                }
                Err(TryRecvError::Lagged(n)) => {
                    self.status.record_link(format!("{n} link events missed"));
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }

        if self.relink_at.is_some_and(|at| Instant::now() >= at) {
            self.relink_at = None;
            info!("asking link manager to reconnect");
            self.link.request_connect();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
