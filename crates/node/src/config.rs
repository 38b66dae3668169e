//! TOML config file loading, environment overrides and validation.
//!
//! Every key has a default, so an empty file (or no file at all at the
//! default path) yields a node that talks TLS to the default broker.  A
//! plaintext broker has to be asked for with `endpoint.insecure = true`.

use std::io::ErrorKind;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::info;

use crate::adc;
use crate::channel::{ChannelTimeouts, Endpoint};
use crate::link::LinkPolicy;

/// Used when `NODE_CONFIG` is unset.
pub const DEFAULT_PATH: &str = "node.toml";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub endpoint: EndpointConfig,
    pub sampling: SamplingConfig,
    pub sensor: SensorConfig,
    pub actuator: ActuatorConfig,
    pub link: LinkConfig,
    pub channel: ChannelConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Permits `tls = false`.  Bench use only.
    pub insecure: bool,
    pub ca_path: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    pub period_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// ADS1115 input (0-3).
    pub channel: u8,
    pub i2c_addr: u16,
    /// Simulator profile when built without the `adc` feature.
    pub scenario: String,
    pub raw_dry: i64,
    pub raw_wet: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    pub gpio_pin: i64,
    pub active_low: bool,
    /// Used by `WATER_ON` without a duration.
    pub default_on_ms: u64,
    /// No single command may hold the valve open longer than this.
    pub max_on_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter: f64,
    /// Unset retries forever.
    pub max_retries: Option<u32>,
    pub attempt_timeout_ms: u64,
    pub health_interval_ms: u64,
    /// How long the node waits after the manager gives up before asking
    /// it to try again.
    pub relink_after_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub open_timeout_ms: u64,
    pub io_timeout_ms: u64,
    pub close_timeout_ms: u64,
    pub command_wait_ms: u64,
    pub handshake_failure_ceiling: u32,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-a".into(),
            endpoint: EndpointConfig::default(),
            sampling: SamplingConfig::default(),
            sensor: SensorConfig::default(),
            actuator: ActuatorConfig::default(),
            link: LinkConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.10".into(),
            port: 8883,
            tls: true,
            insecure: false,
            ca_path: Some("/etc/irrigation/ca.pem".into()),
            username: None,
            password: None,
            keep_alive_sec: 30,
        }
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self { period_ms: 5_000 }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            channel: 0,
            i2c_addr: 0x48,
            scenario: "drying".into(),
            raw_dry: 26_000,
            raw_wet: 12_000,
        }
    }
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            gpio_pin: 17,
            active_low: true,
            default_on_ms: 30_000,
            max_on_ms: 600_000,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            jitter: 0.2,
            max_retries: None,
            attempt_timeout_ms: 5_000,
            health_interval_ms: 10_000,
            relink_after_ms: 300_000,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            open_timeout_ms: 2_000,
            io_timeout_ms: 1_000,
            close_timeout_ms: 250,
            command_wait_ms: 500,
            handshake_failure_ceiling: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// ADDR pin strapping gives the ADS1115 one of four addresses.
const ADS1115_ADDRS: std::ops::RangeInclusive<u16> = 0x48..=0x4B;

/// rumqttc rejects keep-alive intervals below this.
const MIN_KEEP_ALIVE_SEC: u64 = 5;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Validate every section. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_identity(&mut errors);
        self.validate_endpoint(&mut errors);
        self.validate_sensor(&mut errors);
        self.validate_actuator(&mut errors);
        self.validate_link(&mut errors);
        self.validate_timing(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_identity(&self, errors: &mut Vec<String>) {
        if self.node_id.trim().is_empty() {
            errors.push("node_id is empty".into());
        } else if self.node_id.contains(['/', '+', '#']) {
            errors.push(format!(
                "node_id '{}' contains an MQTT topic character ('/', '+' or '#')",
                self.node_id
            ));
        }
    }

    fn validate_endpoint(&self, errors: &mut Vec<String>) {
        let ep = &self.endpoint;
        if ep.host.trim().is_empty() {
            errors.push("endpoint.host is empty".into());
        }
        if ep.port == 0 {
            errors.push("endpoint.port must be non-zero".into());
        }
        if ep.tls && ep.ca_path.as_deref().map_or(true, |p| p.trim().is_empty()) {
            errors.push("endpoint.tls is set but endpoint.ca_path is missing".into());
        }
        if !ep.tls && !ep.insecure {
            errors.push(
                "endpoint.tls is off; set endpoint.insecure = true to allow a plaintext broker".into(),
            );
        }
        if ep.username.is_some() != ep.password.is_some() {
            errors.push("endpoint.username and endpoint.password must be set together".into());
        }
        if ep.keep_alive_sec < MIN_KEEP_ALIVE_SEC {
            errors.push(format!(
                "endpoint.keep_alive_sec must be at least {MIN_KEEP_ALIVE_SEC}, got {}",
                ep.keep_alive_sec
            ));
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        if s.channel > adc::MAX_CHANNEL {
            errors.push(format!(
                "sensor.channel {} out of range (0-{})",
                s.channel,
                adc::MAX_CHANNEL
            ));
        }
        if !ADS1115_ADDRS.contains(&s.i2c_addr) {
            errors.push(format!(
                "sensor.i2c_addr 0x{:02x} is not an ADS1115 address (0x48-0x4b)",
                s.i2c_addr
            ));
        }
    }

    fn validate_actuator(&self, errors: &mut Vec<String>) {
        let a = &self.actuator;
        if !VALID_GPIO_PINS.contains(&a.gpio_pin) {
            errors.push(format!(
                "actuator.gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                a.gpio_pin
            ));
        }
        if a.default_on_ms == 0 {
            errors.push("actuator.default_on_ms must be positive".into());
        }
        if a.max_on_ms == 0 {
            errors.push("actuator.max_on_ms must be positive".into());
        }
        if a.default_on_ms > a.max_on_ms {
            errors.push(format!(
                "actuator.default_on_ms ({}) exceeds actuator.max_on_ms ({})",
                a.default_on_ms, a.max_on_ms
            ));
        }
    }

    fn validate_link(&self, errors: &mut Vec<String>) {
        let l = &self.link;
        for (name, value) in [
            ("link.initial_backoff_ms", l.initial_backoff_ms),
            ("link.attempt_timeout_ms", l.attempt_timeout_ms),
            ("link.health_interval_ms", l.health_interval_ms),
            ("link.relink_after_ms", l.relink_after_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }
        if l.max_backoff_ms < l.initial_backoff_ms {
            errors.push(format!(
                "link.max_backoff_ms ({}) is below link.initial_backoff_ms ({})",
                l.max_backoff_ms, l.initial_backoff_ms
            ));
        }
        if !(0.0..=1.0).contains(&l.jitter) {
            errors.push(format!("link.jitter {} out of range [0.0, 1.0]", l.jitter));
        }
    }

    /// Every bounded wait in one tick must fit inside the sampling period.
    fn validate_timing(&self, errors: &mut Vec<String>) {
        let c = &self.channel;
        let period = self.sampling.period_ms;

        if period == 0 {
            errors.push("sampling.period_ms must be positive".into());
        }
        for (name, value) in [
            ("channel.open_timeout_ms", c.open_timeout_ms),
            ("channel.io_timeout_ms", c.io_timeout_ms),
            ("channel.close_timeout_ms", c.close_timeout_ms),
            ("channel.command_wait_ms", c.command_wait_ms),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }
        if c.handshake_failure_ceiling == 0 {
            errors.push("channel.handshake_failure_ceiling must be at least 1".into());
        }

        // open + send + receive, each of which may end in a bounded close.
        let worst_case = c
            .open_timeout_ms
            .saturating_add(c.io_timeout_ms)
            .saturating_add(c.command_wait_ms)
            .saturating_add(c.close_timeout_ms.saturating_mul(2));
        if period > 0 && worst_case >= period {
            errors.push(format!(
                "channel timeouts ({worst_case} ms worst case per tick) do not fit in \
                 sampling.period_ms ({period})"
            ));
        }

        if period >= self.endpoint.keep_alive_sec.saturating_mul(1000) {
            errors.push(format!(
                "sampling.period_ms ({period}) must be shorter than endpoint.keep_alive_sec ({} s)",
                self.endpoint.keep_alive_sec
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Apply `NODE_ID`, `MQTT_HOST`, `MQTT_PORT`, `SAMPLE_EVERY_S`,
    /// `MQTT_USERNAME` and `MQTT_PASSWORD` on top of the file values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("NODE_ID") {
            self.node_id = v;
        }
        if let Some(v) = lookup("MQTT_HOST") {
            self.endpoint.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT") {
            self.endpoint.port = v
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT '{v}' is not a valid port"))?;
        }
        if let Some(v) = lookup("SAMPLE_EVERY_S") {
            let secs: u64 = v
                .trim()
                .parse()
                .with_context(|| format!("SAMPLE_EVERY_S '{v}' is not a whole number of seconds"))?;
            self.sampling.period_ms = secs.saturating_mul(1000);
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.endpoint.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.endpoint.password = Some(v);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Derived runtime settings
// ---------------------------------------------------------------------------

impl NodeConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.endpoint.host.clone(), self.endpoint.port)
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.sampling.period_ms)
    }

    pub fn command_wait(&self) -> Duration {
        Duration::from_millis(self.channel.command_wait_ms)
    }

    pub fn default_on(&self) -> Duration {
        Duration::from_millis(self.actuator.default_on_ms)
    }

    pub fn max_on(&self) -> Duration {
        Duration::from_millis(self.actuator.max_on_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.link.health_interval_ms)
    }

    pub fn relink_after(&self) -> Duration {
        Duration::from_millis(self.link.relink_after_ms)
    }

    pub fn link_policy(&self) -> LinkPolicy {
        LinkPolicy {
            initial_backoff: Duration::from_millis(self.link.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.link.max_backoff_ms),
            jitter: self.link.jitter,
            max_retries: self.link.max_retries,
            attempt_timeout: Duration::from_millis(self.link.attempt_timeout_ms),
        }
    }

    pub fn channel_timeouts(&self) -> ChannelTimeouts {
        ChannelTimeouts {
            open: Duration::from_millis(self.channel.open_timeout_ms),
            io: Duration::from_millis(self.channel.io_timeout_ms),
            close: Duration::from_millis(self.channel.close_timeout_ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<NodeConfig> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse(&contents, path)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

fn parse(contents: &str, path: &str) -> Result<NodeConfig> {
    toml::from_str(contents).with_context(|| format!("failed to parse config: {path}"))
}

/// Startup configuration: the file named by `NODE_CONFIG` (or
/// [`DEFAULT_PATH`], which may be absent), then environment overrides,
/// then validation.
pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> Result<NodeConfig> {
    let explicit = lookup("NODE_CONFIG");
    let path = explicit.as_deref().unwrap_or(DEFAULT_PATH);

    let mut config = match std::fs::read_to_string(path) {
        Ok(contents) => parse(&contents, path)?,
        Err(e) if explicit.is_none() && e.kind() == ErrorKind::NotFound => {
            info!(path, "no config file; using defaults");
            NodeConfig::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };

    config
        .apply_overrides(&lookup)
        .context("invalid environment override")?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
