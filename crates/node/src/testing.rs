//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time;

use crate::channel::{Connector, Endpoint, Transport};
use crate::error::{ChannelError, LinkError, SensorError};
use crate::link::LinkDriver;
use crate::relay::Actuator;
use crate::sensor::{Millivolts, RawSample, SensorSource};

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum ConnectScript {
    /// Fail this many attempts, then succeed.
    FailFirst(u32),
    AlwaysFail,
    Hang,
}

/// Shared attempt counter, readable after the link moved into a manager.
#[derive(Debug, Clone, Default)]
pub struct Attempts(Arc<AtomicU32>);

impl Attempts {
    pub fn get(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    fn bump(&self) -> u32 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

pub struct ScriptedLink {
    script: ConnectScript,
    lose_after: Option<Duration>,
    attempts: Attempts,
}

impl ScriptedLink {
    fn scripted(script: ConnectScript) -> Self {
        Self {
            script,
            lose_after: None,
            attempts: Attempts::default(),
        }
    }

    pub fn always_up() -> Self {
        Self::scripted(ConnectScript::FailFirst(0))
    }

    pub fn failing_then_up(failures: u32) -> Self {
        Self::scripted(ConnectScript::FailFirst(failures))
    }

    pub fn always_failing() -> Self {
        Self::scripted(ConnectScript::AlwaysFail)
    }

    pub fn hanging() -> Self {
        Self::scripted(ConnectScript::Hang)
    }

    /// Every established link drops after `after`.
    pub fn losing_after(mut self, after: Duration) -> Self {
        self.lose_after = Some(after);
        self
    }

    pub fn attempts(&self) -> Attempts {
        self.attempts.clone()
    }
}

impl LinkDriver for ScriptedLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        let n = self.attempts.bump();
        match self.script {
            ConnectScript::FailFirst(k) if n > k => Ok(()),
            ConnectScript::FailFirst(_) | ConnectScript::AlwaysFail => {
                Err(LinkError::Unreachable(format!("scripted failure {n}")))
            }
            ConnectScript::Hang => std::future::pending().await,
        }
    }

    async fn lost(&mut self) -> LinkError {
        match self.lose_after {
            Some(after) => {
                time::sleep(after).await;
                LinkError::Unreachable("scripted loss".into())
            }
            None => std::future::pending().await,
        }
    }

    async fn disconnect(&mut self) {}
}

// ---------------------------------------------------------------------------
// Channel transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MockPlan {
    pub refuse_connect: bool,
    pub hang_connect: bool,
    pub fail_send: bool,
    pub hang_send: bool,
    pub hang_close: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MockStats {
    pub connects: u32,
    pub live: u32,
    pub max_live: u32,
    pub closes: u32,
    pub sent: Vec<Vec<u8>>,
}

#[derive(Default)]
struct MockShared {
    plan: MockPlan,
    stats: MockStats,
    inbox: VecDeque<Vec<u8>>,
}

/// In-memory connector.  Clones share state so a test can keep one and
/// hand the other to the channel.
#[derive(Clone, Default)]
pub struct MockConnector {
    shared: Arc<Mutex<MockShared>>,
    inbound: Arc<Notify>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(plan: MockPlan) -> Self {
        let mock = Self::default();
        mock.lock().plan = plan;
        mock
    }

    pub fn stats(&self) -> MockStats {
        self.lock().stats.clone()
    }

    /// Queue a frame for the next `receive` on any session.
    pub fn push_inbound(&self, frame: Vec<u8>) {
        self.lock().inbox.push_back(frame);
        self.inbound.notify_one();
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.lock().plan.refuse_connect = refuse;
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.lock().plan.fail_send = fail;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockShared> {
        self.shared.lock().unwrap()
    }
}

impl Connector for MockConnector {
    type Session = MockTransport;

    async fn connect(&mut self, _endpoint: &Endpoint) -> Result<MockTransport, ChannelError> {
        let plan = {
            let mut shared = self.lock();
            shared.stats.connects += 1;
            shared.plan.clone()
        };
        if plan.hang_connect {
            std::future::pending::<()>().await;
        }
        if plan.refuse_connect {
            return Err(ChannelError::HandshakeFailed("mock refused".into()));
        }

        let mut shared = self.lock();
        shared.stats.live += 1;
        shared.stats.max_live = shared.stats.max_live.max(shared.stats.live);
        Ok(MockTransport {
            owner: self.clone(),
        })
    }
}

pub struct MockTransport {
    owner: MockConnector,
}

impl Transport for MockTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let plan = self.owner.lock().plan.clone();
        if plan.hang_send {
            std::future::pending::<()>().await;
        }
        if plan.fail_send {
            return Err(ChannelError::Io("mock send failure".into()));
        }
        self.owner.lock().stats.sent.push(bytes.to_vec());
        Ok(bytes.len())
    }

    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, ChannelError> {
        loop {
            let next = self.owner.lock().inbox.pop_front();
            if let Some(mut frame) = next {
                frame.truncate(max_len);
                return Ok(frame);
            }
            self.owner.inbound.notified().await;
        }
    }

    async fn close(&mut self) {
        let hang = {
            let mut shared = self.owner.lock();
            shared.stats.closes += 1;
            shared.plan.hang_close
        };
        if hang {
            std::future::pending::<()>().await;
        }
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        let mut shared = self.owner.lock();
        shared.stats.live = shared.stats.live.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// Sensor
// ---------------------------------------------------------------------------

/// Replays a fixed script of reads; the last entry repeats once exhausted.
pub struct FakeSensor {
    script: Vec<Result<RawSample, SensorError>>,
    next: usize,
    reads: usize,
    calibrated: bool,
}

impl FakeSensor {
    pub fn new(script: Vec<Result<RawSample, SensorError>>) -> Self {
        assert!(!script.is_empty(), "FakeSensor needs at least one entry");
        Self {
            script,
            next: 0,
            reads: 0,
            calibrated: false,
        }
    }

    pub fn constant(raw: RawSample) -> Self {
        Self::new(vec![Ok(raw)])
    }

    /// Report millivolts on the ADS1115 scale.
    pub fn calibrated(mut self) -> Self {
        self.calibrated = true;
        self
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl SensorSource for FakeSensor {
    fn read(&mut self) -> Result<RawSample, SensorError> {
        self.reads += 1;
        let entry = self.script[self.next.min(self.script.len() - 1)].clone();
        self.next += 1;
        entry
    }

    fn calibrate(&self, raw: RawSample) -> Option<Millivolts> {
        self.calibrated.then(|| crate::adc::to_millivolts(raw))
    }
}

// ---------------------------------------------------------------------------
// Actuator
// ---------------------------------------------------------------------------

/// Records every write so tests can assert on exact actuator traffic.
#[derive(Debug, Default)]
pub struct RecordingActuator {
    writes: Vec<bool>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writes(&self) -> &[bool] {
        &self.writes
    }

    /// Output level after the last write; off if never written.
    pub fn is_on(&self) -> bool {
        self.writes.last().copied().unwrap_or(false)
    }
}

impl Actuator for RecordingActuator {
    fn set(&mut self, on: bool) {
        self.writes.push(on);
    }
}
