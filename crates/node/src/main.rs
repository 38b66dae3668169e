use std::env;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use irrigation_node::channel::SecureChannel;
use irrigation_node::config::{self, NodeConfig};
use irrigation_node::controller::ActuatorController;
use irrigation_node::link::{ConnectivityManager, ReachabilityLink};
use irrigation_node::mqtt::MqttConnector;
use irrigation_node::node::Node;
use irrigation_node::relay::Relay;
use irrigation_node::sensor::SensorSource;

#[cfg(feature = "adc")]
fn build_sensor(cfg: &NodeConfig) -> Result<impl SensorSource> {
    irrigation_node::adc::Ads1115::new(cfg.sensor.i2c_addr, cfg.sensor.channel)
        .context("failed to initialise ADS1115")
}

#[cfg(not(feature = "adc"))]
fn build_sensor(cfg: &NodeConfig) -> Result<impl SensorSource> {
    use irrigation_node::sim::{Scenario, SimSensor};

    let scenario = Scenario::from_str_lossy(&cfg.sensor.scenario);
    info!(%scenario, "using simulated sensor");
    Ok(SimSensor::new(
        scenario,
        cfg.sensor.raw_dry as f64,
        cfg.sensor.raw_wet as f64,
    ))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = config::resolve(|key| env::var(key).ok())?;
    info!(
        node_id = %cfg.node_id,
        endpoint = %cfg.endpoint(),
        tls = cfg.endpoint.tls,
        period_ms = cfg.sampling.period_ms,
        "irrigation node starting"
    );
    if !cfg.endpoint.tls {
        warn!(endpoint = %cfg.endpoint(), "endpoint.insecure: reporting over plaintext MQTT");
    }

    // Relay off before anything touches the network.
    let pin = u8::try_from(cfg.actuator.gpio_pin).context("actuator.gpio_pin out of range")?;
    let relay = Relay::new(pin, cfg.actuator.active_low).context("failed to initialise relay")?;
    let controller = ActuatorController::new(relay, cfg.max_on());

    let sensor = build_sensor(&cfg)?;
    let connector = MqttConnector::from_config(&cfg)?;

    let policy = cfg.link_policy();
    let driver = ReachabilityLink::new(cfg.endpoint(), cfg.health_interval(), policy.attempt_timeout);
    let (manager, link) = ConnectivityManager::new(driver, &policy);
    tokio::spawn(manager.run());
    link.request_connect();

    let channel = SecureChannel::new(
        connector,
        link.watch(),
        cfg.channel_timeouts(),
        cfg.channel.handshake_failure_ceiling,
    );
    let mut node = Node::new(sensor, channel, controller, link, &cfg);

    tokio::select! {
        _ = node.run() => {}
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("shutdown requested"),
            Err(e) => error!("failed to listen for ctrl-c: {e}; shutting down"),
        },
    }

    node.shutdown().await;
    Ok(())
}
