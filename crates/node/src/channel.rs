//! Secure channel: one authenticated session at a time.
//!
//! The channel owns at most one [`SessionHandle`].  Opening a new session
//! closes the previous one first, and any transport error closes the session
//! so callers see the failure and re-open on their next cycle.  Every
//! operation is bounded by a timeout and abandoned as soon as the link
//! leaves `Up`.

#![allow(async_fn_in_trait)]

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::error::ChannelError;
use crate::link::LinkState;

// ---------------------------------------------------------------------------
// Endpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Establishes authenticated sessions against an endpoint.
pub trait Connector {
    type Session: Transport;

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<Self::Session, ChannelError>;
}

/// Byte-level operations on one established session.
///
/// Implementations may wait indefinitely; the channel applies timeouts and
/// may drop any of these futures mid-flight.
pub trait Transport {
    async fn send(&mut self, bytes: &[u8]) -> Result<usize, ChannelError>;

    /// Wait for the next inbound frame, truncated to `max_len` bytes.
    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, ChannelError>;

    async fn close(&mut self);
}

// ---------------------------------------------------------------------------
// Session handle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The one live session.  Never leaves the channel.
struct SessionHandle<T> {
    id: SessionId,
    opened_at: Instant,
    transport: T,
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ChannelTimeouts {
    pub open: Duration,
    pub io: Duration,
    pub close: Duration,
}

/// Largest inbound frame a caller will accept.  `receive` keeps one byte
/// past this so an over-long frame stays detectable instead of being cut
/// down to something that parses.
pub const MAX_FRAME: usize = 64;

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

pub struct SecureChannel<C: Connector> {
    connector: C,
    link: watch::Receiver<LinkState>,
    timeouts: ChannelTimeouts,
    session: Option<SessionHandle<C::Session>>,
    next_id: u64,
    handshake_failures: u32,
    handshake_ceiling: u32,
    escalation_pending: bool,
}

impl<C: Connector> SecureChannel<C> {
    pub fn new(
        connector: C,
        link: watch::Receiver<LinkState>,
        timeouts: ChannelTimeouts,
        handshake_ceiling: u32,
    ) -> Self {
        Self {
            connector,
            link,
            timeouts,
            session: None,
            next_id: 1,
            handshake_failures: 0,
            handshake_ceiling: handshake_ceiling.max(1),
            escalation_pending: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn link_state(&self) -> LinkState {
        *self.link.borrow()
    }

    pub fn consecutive_handshake_failures(&self) -> u32 {
        self.handshake_failures
    }

    /// Returns the failure count once, the first time consecutive handshake
    /// failures reach the ceiling.
    pub fn take_escalation(&mut self) -> Option<u32> {
        if std::mem::take(&mut self.escalation_pending) {
            Some(self.handshake_failures)
        } else {
            None
        }
    }

    /// Open a fresh session, closing any existing one first.
    pub async fn open(&mut self, endpoint: &Endpoint) -> Result<SessionId, ChannelError> {
        self.close().await;

        if !self.link_state().is_up() {
            return Err(ChannelError::LinkDown);
        }

        let result = tokio::select! {
            biased;
            _ = link_dropped(&mut self.link) => Err(ChannelError::LinkDown),
            r = time::timeout(self.timeouts.open, self.connector.connect(endpoint)) => {
                r.unwrap_or(Err(ChannelError::Timeout))
            }
        };

        match result {
            Ok(transport) => {
                if self.handshake_failures >= self.handshake_ceiling {
                    info!(
                        failures = self.handshake_failures,
                        "secure channel recovered after repeated handshake failures"
                    );
                }
                self.handshake_failures = 0;
                self.escalation_pending = false;

                let id = SessionId(self.next_id);
                self.next_id += 1;
                self.session = Some(SessionHandle {
                    id,
                    opened_at: Instant::now(),
                    transport,
                });
                info!(session = %id, %endpoint, "secure channel open");
                Ok(id)
            }
            Err(e) => {
                if e.is_handshake() {
                    self.note_handshake_failure();
                }
                warn!(%endpoint, "secure channel open failed: {e}");
                Err(e)
            }
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) -> Result<usize, ChannelError> {
        let Some(session) = self.session.as_mut() else {
            return Err(ChannelError::Closed);
        };

        let result = tokio::select! {
            biased;
            _ = link_dropped(&mut self.link) => Err(ChannelError::LinkDown),
            r = time::timeout(self.timeouts.io, session.transport.send(bytes)) => {
                r.unwrap_or(Err(ChannelError::Timeout))
            }
        };

        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    /// Wait up to `wait` for one inbound frame.  `Ok(None)` means nothing
    /// arrived in time; the session stays open.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        let Some(session) = self.session.as_mut() else {
            return Err(ChannelError::Closed);
        };

        let result = tokio::select! {
            biased;
            _ = link_dropped(&mut self.link) => Err(ChannelError::LinkDown),
            r = time::timeout(wait, session.transport.receive(MAX_FRAME + 1)) => match r {
                Err(_) => Ok(None),
                Ok(Ok(frame)) => Ok(Some(frame)),
                Ok(Err(e)) => Err(e),
            }
        };

        if let Err(e) = &result {
            self.abort(e).await;
        }
        result
    }

    /// Release the current session, if any.  Safe to call at any time.
    pub async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if time::timeout(self.timeouts.close, session.transport.close())
            .await
            .is_err()
        {
            warn!(session = %session.id, "transport close timed out; dropping session");
        }
        debug!(
            session = %session.id,
            open_for_ms = session.opened_at.elapsed().as_millis() as u64,
            "secure channel closed"
        );
    }

    async fn abort(&mut self, cause: &ChannelError) {
        if let Some(id) = self.session_id() {
            warn!(session = %id, "secure channel error, closing session: {cause}");
        }
        self.close().await;
    }

    fn note_handshake_failure(&mut self) {
        self.handshake_failures = self.handshake_failures.saturating_add(1);
        if self.handshake_failures == self.handshake_ceiling {
            self.escalation_pending = true;
            error!(
                escalation = true,
                failures = self.handshake_failures,
                "secure channel handshake keeps failing; operator attention needed"
            );
        }
    }
}

/// Resolves once the link is no longer `Up`.  Pending forever if the
/// connectivity manager is gone.
async fn link_dropped(link: &mut watch::Receiver<LinkState>) {
    let dropped = link.wait_for(|s| !s.is_up()).await.is_ok();
    if !dropped {
        std::future::pending::<()>().await;
    }
}

// ===========================================================================
// Tests
// ===========================================================================
