//! Link connectivity manager.
//!
//! Owns the [`LinkState`] of the network substrate beneath the secure
//! channel and drives connect / retry / backoff as an independent tokio
//! task.  The foreground loop only ever reads the state (through a `watch`
//! receiver) and sends connect/disconnect requests; nothing else crosses the
//! task boundary.
//!
//! ```text
//! Down ──[request_connect]──▶ Connecting ──ok──▶ Up ──[lost]──▶ Down ─┐
//!                              ▲      │                               │
//!                              │    fail                              │
//!                              │      ▼                               │
//!                              └── Failed(n) ◀── backoff ◀────────────┘
//!                                     │
//!                          [n > max_retries] ──▶ Failed(n), idle until
//!                                                request_connect()
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::channel::Endpoint;
use crate::error::LinkError;

// ---------------------------------------------------------------------------
// State & events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Down,
    Connecting,
    Up,
    /// Consecutive failed attempts since the link was last up.
    Failed(u32),
}

impl LinkState {
    pub fn is_up(self) -> bool {
        self == Self::Up
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Transition into `Up`.
    Ready,
    /// Transition out of `Up`.
    Lost,
    /// Retry ceiling reached; no further attempts until re-requested.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
enum Request {
    Connect,
    Disconnect,
}

// ---------------------------------------------------------------------------
// Driver trait
// ---------------------------------------------------------------------------

/// The physical link beneath the channel (station association, cable, ...).
pub trait LinkDriver: Send + 'static {
    /// Make one attempt to bring the link up.
    fn connect(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Resolves once an established link has dropped.
    fn lost(&mut self) -> impl Future<Output = LinkError> + Send;

    /// Tear down an established link.
    fn disconnect(&mut self) -> impl Future<Output = ()> + Send;
}

/// Treats the link as up while the endpoint accepts TCP connections.
///
/// The OS owns the actual interface; this probe is what the node can observe
/// of it.  While up, the endpoint is re-probed every `health_interval`.
pub struct ReachabilityLink {
    endpoint: Endpoint,
    health_interval: Duration,
    probe_timeout: Duration,
}

impl ReachabilityLink {
    pub fn new(endpoint: Endpoint, health_interval: Duration, probe_timeout: Duration) -> Self {
        Self {
            endpoint,
            health_interval,
            probe_timeout,
        }
    }

    async fn probe(&self) -> Result<(), LinkError> {
        let addr = (self.endpoint.host.as_str(), self.endpoint.port);
        match time::timeout(self.probe_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(LinkError::Unreachable(format!("{}: {e}", self.endpoint))),
            Err(_) => Err(LinkError::Timeout(self.probe_timeout)),
        }
    }
}

impl LinkDriver for ReachabilityLink {
    async fn connect(&mut self) -> Result<(), LinkError> {
        self.probe().await
    }

    async fn lost(&mut self) -> LinkError {
        loop {
            time::sleep(self.health_interval).await;
            if let Err(e) = self.probe().await {
                return e;
            }
        }
    }

    async fn disconnect(&mut self) {
        debug!(endpoint = %self.endpoint, "reachability link released");
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with symmetric jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    rng: fastrand::Rng,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self::with_rng(initial, max, jitter, fastrand::Rng::new())
    }

    pub fn with_rng(initial: Duration, max: Duration, jitter: f64, rng: fastrand::Rng) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            rng,
        }
    }

    /// Delay before the retry that follows failed attempt number `attempt`
    /// (1-based).
    pub fn delay(&mut self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let base = self.initial.saturating_mul(1u32 << exp).min(self.max);
        if self.jitter == 0.0 {
            return base;
        }
        let spread = base.as_secs_f64() * self.jitter;
        let offset = (self.rng.f64() * 2.0 - 1.0) * spread;
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0)).min(self.max)
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LinkPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: f64,
    /// Retries after the first failed attempt; `None` retries forever.
    pub max_retries: Option<u32>,
    pub attempt_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Handle (foreground side)
// ---------------------------------------------------------------------------

/// Cheap, cloneable view of the link used by the foreground loop.
#[derive(Clone)]
pub struct LinkHandle {
    state: watch::Receiver<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    requests: mpsc::Sender<Request>,
}

impl LinkHandle {
    pub fn status(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Ask the manager to (re)start connecting.  Also restarts a manager
    /// that gave up after its retry ceiling.
    pub fn request_connect(&self) {
        // A full queue already holds a pending request.
        let _ = self.requests.try_send(Request::Connect);
    }

    pub fn request_disconnect(&self) {
        let _ = self.requests.try_send(Request::Disconnect);
    }

    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Wait until the link is up.  Returns `false` if the manager is gone.
    pub async fn ready(&self) -> bool {
        let mut rx = self.state.clone();
        let ready = rx.wait_for(|s| s.is_up()).await.is_ok();
        ready
    }
}

// ---------------------------------------------------------------------------
// Manager (background side)
// ---------------------------------------------------------------------------

pub struct ConnectivityManager<D: LinkDriver> {
    driver: D,
    backoff: Backoff,
    max_retries: Option<u32>,
    attempt_timeout: Duration,
    state: watch::Sender<LinkState>,
    events: broadcast::Sender<LinkEvent>,
    requests: mpsc::Receiver<Request>,
}

/// Why the manager stopped driving the link.
enum Halt {
    /// Go idle and wait for the next request.
    Idle,
    /// Every handle is gone.
    Shutdown,
}

/// Outcome of waiting while the link is up or backing off.
enum Wake {
    Lost(LinkError),
    Retry,
    Disconnect,
    Shutdown,
}

impl<D: LinkDriver> ConnectivityManager<D> {
    pub fn new(driver: D, policy: &LinkPolicy) -> (Self, LinkHandle) {
        Self::with_backoff(
            driver,
            policy,
            Backoff::new(policy.initial_backoff, policy.max_backoff, policy.jitter),
        )
    }

    pub fn with_backoff(driver: D, policy: &LinkPolicy, backoff: Backoff) -> (Self, LinkHandle) {
        let (state_tx, state_rx) = watch::channel(LinkState::Down);
        let (events, _) = broadcast::channel(16);
        let (req_tx, req_rx) = mpsc::channel(4);

        let manager = Self {
            driver,
            backoff,
            max_retries: policy.max_retries,
            attempt_timeout: policy.attempt_timeout,
            state: state_tx,
            events: events.clone(),
            requests: req_rx,
        };
        let handle = LinkHandle {
            state: state_rx,
            events,
            requests: req_tx,
        };
        (manager, handle)
    }

    /// Run until every [`LinkHandle`] is dropped.  Intended to be
    /// `tokio::spawn`-ed from main.
    pub async fn run(mut self) {
        loop {
            match self.requests.recv().await {
                None => return,
                Some(Request::Disconnect) => continue,
                Some(Request::Connect) => {}
            }
            if let Halt::Shutdown = self.drive().await {
                return;
            }
        }
    }

    async fn drive(&mut self) -> Halt {
        let mut failures: u32 = 0;
        loop {
            self.set_state(LinkState::Connecting);

            let attempt = time::timeout(self.attempt_timeout, self.driver.connect())
                .await
                .unwrap_or(Err(LinkError::Timeout(self.attempt_timeout)));

            match attempt {
                Ok(()) => {
                    if failures > 0 {
                        info!(after_failures = failures, "link up");
                    } else {
                        info!("link up");
                    }
                    failures = 0;
                    self.set_state(LinkState::Up);

                    match self.hold().await {
                        Wake::Lost(reason) => {
                            warn!(%reason, "link lost; reconnecting");
                            self.set_state(LinkState::Down);
                        }
                        Wake::Disconnect => {
                            self.driver.disconnect().await;
                            self.set_state(LinkState::Down);
                            info!("link disconnected on request");
                            return Halt::Idle;
                        }
                        Wake::Shutdown => {
                            self.driver.disconnect().await;
                            self.set_state(LinkState::Down);
                            return Halt::Shutdown;
                        }
                        Wake::Retry => {}
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    self.set_state(LinkState::Failed(failures));

                    if let Some(max) = self.max_retries {
                        if failures > max {
                            error!(attempts = failures, "link retry ceiling reached; giving up");
                            let _ = self.events.send(LinkEvent::GaveUp { attempts: failures });
                            return Halt::Idle;
                        }
                    }

                    let delay = self.backoff.delay(failures);
                    warn!(
                        attempt = failures,
                        retry_in_ms = delay.as_millis() as u64,
                        "link attempt failed: {e}"
                    );

                    match self.back_off(delay).await {
                        Wake::Retry | Wake::Lost(_) => {}
                        Wake::Disconnect => {
                            self.set_state(LinkState::Down);
                            return Halt::Idle;
                        }
                        Wake::Shutdown => return Halt::Shutdown,
                    }
                }
            }
        }
    }

    /// Wait while the link is up.
    async fn hold(&mut self) -> Wake {
        loop {
            tokio::select! {
                reason = self.driver.lost() => return Wake::Lost(reason),
                req = self.requests.recv() => match req {
                    Some(Request::Connect) => continue,
                    Some(Request::Disconnect) => return Wake::Disconnect,
                    None => return Wake::Shutdown,
                },
            }
        }
    }

    /// Sleep out a backoff delay.  A connect request cuts it short.
    async fn back_off(&mut self, delay: Duration) -> Wake {
        tokio::select! {
            _ = time::sleep(delay) => Wake::Retry,
            req = self.requests.recv() => match req {
                Some(Request::Connect) => Wake::Retry,
                Some(Request::Disconnect) => Wake::Disconnect,
                None => Wake::Shutdown,
            },
        }
    }

    fn set_state(&self, next: LinkState) {
        let prev = self.state.send_replace(next);
        if !prev.is_up() && next.is_up() {
            let _ = self.events.send(LinkEvent::Ready);
        } else if prev.is_up() && !next.is_up() {
            let _ = self.events.send(LinkEvent::Lost);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedLink;

    fn policy(max_retries: Option<u32>) -> LinkPolicy {
        LinkPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: 0.0,
            max_retries,
            attempt_timeout: Duration::from_secs(1),
        }
    }

    // -- Backoff ------------------------------------------------------------

    #[test]
    fn backoff_doubles_until_capped() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000), 0.0);
        let delays: Vec<u64> = (1..=6).map(|n| b.delay(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn backoff_huge_attempt_does_not_overflow() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 0.0);
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_jitter_stays_within_spread_and_cap() {
        let mut b = Backoff::with_rng(
            Duration::from_millis(1000),
            Duration::from_millis(5000),
            0.25,
            fastrand::Rng::with_seed(7),
        );
        for _ in 0..500 {
            let d = b.delay(1).as_millis();
            assert!((750..=1250).contains(&d), "jittered delay out of range: {d}");
        }
        for _ in 0..500 {
            assert!(b.delay(10) <= Duration::from_millis(5000));
        }
    }

    // -- Manager ------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn starts_down_and_idle_until_requested() {
        let link = ScriptedLink::always_up();
        let attempts = link.attempts();
        let (manager, handle) = ConnectivityManager::new(link, &policy(None));
        tokio::spawn(manager.run());

        time::sleep(Duration::from_secs(30)).await;
        assert_eq!(handle.status(), LinkState::Down);
        assert_eq!(attempts.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_emits_ready() {
        let (manager, handle) = ConnectivityManager::new(ScriptedLink::always_up(), &policy(None));
        let mut events = handle.events();
        tokio::spawn(manager.run());

        handle.request_connect();
        assert!(handle.ready().await);
        assert_eq!(handle.status(), LinkState::Up);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_failures_until_up() {
        let link = ScriptedLink::failing_then_up(2);
        let attempts = link.attempts();
        let (manager, handle) = ConnectivityManager::new(link, &policy(None));
        let mut rx = handle.watch();
        tokio::spawn(manager.run());

        handle.request_connect();
        rx.wait_for(|s| *s == LinkState::Failed(2)).await.unwrap();
        rx.wait_for(|s| s.is_up()).await.unwrap();
        assert_eq!(attempts.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_ceiling_until_rerequested() {
        let link = ScriptedLink::always_failing();
        let attempts = link.attempts();
        let (manager, handle) = ConnectivityManager::new(link, &policy(Some(2)));
        let mut events = handle.events();
        tokio::spawn(manager.run());

        handle.request_connect();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::GaveUp { attempts: 3 }
        );
        assert_eq!(handle.status(), LinkState::Failed(3));

        // No automatic retries once given up.
        time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(attempts.get(), 3);
        assert_eq!(handle.status(), LinkState::Failed(3));

        // An explicit request starts a fresh round.
        handle.request_connect();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::GaveUp { attempts: 3 }
        );
        assert_eq!(attempts.get(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_link_reconnects() {
        let link = ScriptedLink::always_up().losing_after(Duration::from_secs(5));
        let attempts = link.attempts();
        let (manager, handle) = ConnectivityManager::new(link, &policy(None));
        let mut events = handle.events();
        tokio::spawn(manager.run());

        handle.request_connect();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Ready);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Lost);
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Ready);
        assert!(attempts.get() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_request_goes_down_and_idle() {
        let link = ScriptedLink::always_up();
        let attempts = link.attempts();
        let (manager, handle) = ConnectivityManager::new(link, &policy(None));
        let mut events = handle.events();
        tokio::spawn(manager.run());

        handle.request_connect();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Ready);

        handle.request_disconnect();
        assert_eq!(events.recv().await.unwrap(), LinkEvent::Lost);
        assert_eq!(handle.status(), LinkState::Down);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(attempts.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_attempt_is_bounded_by_attempt_timeout() {
        let link = ScriptedLink::hanging();
        let (manager, handle) = ConnectivityManager::new(link, &policy(Some(0)));
        let mut events = handle.events();
        tokio::spawn(manager.run());

        let started = time::Instant::now();
        handle.request_connect();
        assert_eq!(
            events.recv().await.unwrap(),
            LinkEvent::GaveUp { attempts: 1 }
        );
        assert!(started.elapsed() <= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn ready_returns_false_when_manager_dropped() {
        let (manager, handle) = ConnectivityManager::new(ScriptedLink::always_up(), &policy(None));
        drop(manager);
        assert!(!handle.ready().await);
    }
}
