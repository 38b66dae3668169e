//! Relay output for the valve / pump.  The `gpio` feature gates the real
//! rppal driver; without it, a mock relay records and logs state changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// A binary output.  Writes are synchronous and best-effort.
pub trait Actuator {
    fn set(&mut self, on: bool);
}

fn label(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO relay (production, needs rppal and a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct Relay {
    pin: OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl Relay {
    pub fn new(pin_num: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(pin_num)?.into_output();
        let mut relay = Self { pin, active_low };

        // Fail-safe: ensure "OFF" at startup
        relay.drive(false);
        info!(gpio = pin_num, active_low, "relay initialised (off)");
        Ok(relay)
    }

    fn drive(&mut self, on: bool) {
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }
}

#[cfg(feature = "gpio")]
impl Actuator for Relay {
    fn set(&mut self, on: bool) {
        self.drive(on);
        info!("relay set {}", label(on));
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct Relay {
    on: bool,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub fn new(pin_num: u8, _active_low: bool) -> Result<Self> {
        info!(gpio = pin_num, "[mock-gpio] relay initialised (no hardware)");
        Ok(Self { on: false })
    }

    pub fn is_on(&self) -> bool {
        self.on
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for Relay {
    fn set(&mut self, on: bool) {
        self.on = on;
        info!("[mock-gpio] relay set {}", label(on));
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn relay_new_is_off() {
        let relay = Relay::new(17, true).unwrap();
        assert!(!relay.is_on());
    }

    #[test]
    fn relay_set_on_then_off() {
        let mut relay = Relay::new(17, true).unwrap();
        relay.set(true);
        assert!(relay.is_on());
        relay.set(false);
        assert!(!relay.is_on());
    }

    #[test]
    fn relay_set_is_idempotent() {
        let mut relay = Relay::new(17, false).unwrap();
        relay.set(true);
        relay.set(true);
        assert!(relay.is_on());
    }

    #[test]
    fn label_names_levels() {
        assert_eq!(label(true), "ON");
        assert_eq!(label(false), "OFF");
    }
}
