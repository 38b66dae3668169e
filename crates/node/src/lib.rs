//! Irrigation node: samples a soil moisture probe, reports over a secure
//! channel and drives a valve relay from inbound commands, with a watchdog
//! that always returns the valve to off.

pub mod adc;
pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod link;
pub mod mqtt;
pub mod node;
pub mod protocol;
pub mod relay;
pub mod report;
pub mod sensor;
pub mod sim;
pub mod status;

#[cfg(test)]
mod testing;
