//! MQTT transport for the secure channel.
//!
//! Each session is one rumqttc client + event loop, connected over TLS with
//! username/password auth.  Readings go out on `tele/<node_id>/reading`;
//! commands arrive on `valve/<node_id>/set`.  The event loop is only polled
//! from inside channel operations, so every wait is bounded by the channel's
//! timeouts.

use std::collections::VecDeque;
use std::fs;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    TlsConfiguration, Transport as MqttTransport,
};
use tracing::{debug, info};

use crate::channel::{Connector, Endpoint, Transport};
use crate::config::NodeConfig;
use crate::error::ChannelError;

/// Inbound publishes held while waiting for an unrelated ack.
const MAX_PENDING: usize = 8;

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

pub fn telemetry_topic(node_id: &str) -> String {
    format!("tele/{node_id}/reading")
}

pub fn command_topic(node_id: &str) -> String {
    format!("valve/{node_id}/set")
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

pub struct MqttConnector {
    node_id: String,
    keep_alive: Duration,
    ca: Option<Vec<u8>>,
    credentials: Option<(String, String)>,
}

impl MqttConnector {
    /// Reads the CA bundle up front so a missing file fails at startup.
    pub fn from_config(cfg: &NodeConfig) -> Result<Self> {
        let ep = &cfg.endpoint;
        if !ep.tls && !ep.insecure {
            bail!("endpoint.tls is off and endpoint.insecure is not set");
        }
        let ca = if ep.tls {
            let path = ep
                .ca_path
                .as_deref()
                .context("endpoint.tls is set but endpoint.ca_path is missing")?;
            let pem = fs::read(path).with_context(|| format!("failed to read CA file: {path}"))?;
            Some(pem)
        } else {
            None
        };
        let credentials = match (&ep.username, &ep.password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        };

        Ok(Self {
            node_id: cfg.node_id.clone(),
            keep_alive: Duration::from_secs(ep.keep_alive_sec),
            ca,
            credentials,
        })
    }

    fn options(&self, endpoint: &Endpoint) -> MqttOptions {
        let client_id = format!("irrigation-node-{}", self.node_id);
        let mut opts = MqttOptions::new(client_id, endpoint.host.clone(), endpoint.port);
        opts.set_keep_alive(self.keep_alive);
        opts.set_clean_session(true);
        if let Some((user, pass)) = &self.credentials {
            opts.set_credentials(user.clone(), pass.clone());
        }
        if let Some(ca) = &self.ca {
            opts.set_transport(MqttTransport::Tls(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: None,
            }));
        }
        opts
    }
}

impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&mut self, endpoint: &Endpoint) -> Result<MqttSession, ChannelError> {
        let (client, eventloop) = AsyncClient::new(self.options(endpoint), 10);
        let mut session = MqttSession {
            client,
            eventloop,
            telemetry: telemetry_topic(&self.node_id),
            commands: command_topic(&self.node_id),
            pending: VecDeque::new(),
        };

        session
            .poll_until(|ev| matches!(ev, Event::Incoming(Packet::ConnAck(_))))
            .await
            .map_err(handshake_error)?;

        session
            .client
            .subscribe(session.commands.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?;
        session
            .poll_until(|ev| matches!(ev, Event::Incoming(Packet::SubAck(_))))
            .await
            .map_err(handshake_error)?;

        info!(topic = %session.commands, "subscribed to commands");
        Ok(session)
    }
}

fn handshake_error(e: ConnectionError) -> ChannelError {
    ChannelError::HandshakeFailed(e.to_string())
}

fn io_error(e: ConnectionError) -> ChannelError {
    ChannelError::Io(e.to_string())
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct MqttSession {
    client: AsyncClient,
    eventloop: EventLoop,
    telemetry: String,
    commands: String,
    pending: VecDeque<Vec<u8>>,
}

impl MqttSession {
    /// Drive the event loop until `done` matches.  Command publishes seen on
    /// the way are queued for the next `receive`.
    async fn poll_until(
        &mut self,
        done: impl Fn(&Event) -> bool,
    ) -> Result<(), ConnectionError> {
        loop {
            let event = self.eventloop.poll().await?;
            if done(&event) {
                return Ok(());
            }
            self.stash(event);
        }
    }

    fn stash(&mut self, event: Event) {
        if let Event::Incoming(Packet::Publish(p)) = event {
            if p.topic != self.commands {
                return;
            }
            if self.pending.len() == MAX_PENDING {
                debug!("command backlog full; dropping oldest");
                self.pending.pop_front();
            }
            self.pending.push_back(p.payload.to_vec());
        }
    }
}

impl Transport for MqttSession {
    async fn send(&mut self, bytes: &[u8]) -> Result<usize, ChannelError> {
        self.client
            .publish(self.telemetry.clone(), QoS::AtLeastOnce, false, bytes.to_vec())
            .await
            .map_err(|e| ChannelError::Io(e.to_string()))?;
        self.poll_until(|ev| matches!(ev, Event::Outgoing(Outgoing::Publish(_))))
            .await
            .map_err(io_error)?;
        Ok(bytes.len())
    }

    async fn receive(&mut self, max_len: usize) -> Result<Vec<u8>, ChannelError> {
        loop {
            if let Some(mut frame) = self.pending.pop_front() {
                frame.truncate(max_len);
                return Ok(frame);
            }
            let event = self.eventloop.poll().await.map_err(io_error)?;
            self.stash(event);
        }
    }

    async fn close(&mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_node_id() {
        assert_eq!(telemetry_topic("node-a"), "tele/node-a/reading");
        assert_eq!(command_topic("node-a"), "valve/node-a/set");
    }

    fn plaintext_config() -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.endpoint.tls = false;
        cfg.endpoint.insecure = true;
        cfg.endpoint.port = 1883;
        cfg
    }

    #[test]
    fn from_config_without_tls_needs_no_ca() {
        let conn = MqttConnector::from_config(&plaintext_config()).unwrap();
        assert!(conn.ca.is_none());
        assert!(conn.credentials.is_none());
    }

    #[test]
    fn from_config_refuses_plaintext_without_opt_in() {
        let mut cfg = plaintext_config();
        cfg.endpoint.insecure = false;
        let err = MqttConnector::from_config(&cfg).err().unwrap();
        assert!(format!("{err:#}").contains("endpoint.insecure is not set"));
    }

    #[test]
    fn default_config_reads_ca_file() {
        // Default is TLS against /etc/irrigation/ca.pem, absent on test hosts.
        let err = MqttConnector::from_config(&NodeConfig::default()).err().unwrap();
        assert!(format!("{err:#}").contains("failed to read CA file"));
    }

    #[test]
    fn from_config_missing_ca_file_fails_with_context() {
        let mut cfg = NodeConfig::default();
        cfg.endpoint.ca_path = Some("/nonexistent/ca.pem".into());
        let err = MqttConnector::from_config(&cfg).err().unwrap();
        assert!(format!("{err:#}").contains("failed to read CA file"));
    }

    #[test]
    fn from_config_tls_without_ca_path_fails() {
        let mut cfg = NodeConfig::default();
        cfg.endpoint.tls = true;
        cfg.endpoint.ca_path = None;
        assert!(MqttConnector::from_config(&cfg).is_err());
    }

    #[test]
    fn credentials_need_both_halves() {
        let mut cfg = plaintext_config();
        cfg.endpoint.username = Some("node".into());
        assert!(MqttConnector::from_config(&cfg).unwrap().credentials.is_none());

        cfg.endpoint.password = Some("secret".into());
        let conn = MqttConnector::from_config(&cfg).unwrap();
        assert_eq!(conn.credentials, Some(("node".into(), "secret".into())));
    }
}
