//! Static description of a GPIO pin.
//!
//! Pins are addressed by their BCM GPIO numbers. Each configured pin
//! carries a compiled-in descriptor naming its physical header
//! position, direction, and role; the descriptor never changes at
//! runtime.

use super::Error;
use crate::Result;
use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// BCM GPIO numbers are limited to this range on all supported
/// boards.
pub const MAX_PIN: u8 = 53;

/// Whether the controller drives the pin or reads it.

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Output,
    Input,
}

/// The role a pin plays in the installation. Used to build readable
/// default names and to tag the document entry.

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Subtype {
    Pump,
    Light,
    Motor,
    Sensor,
    Generic,
}

impl fmt::Display for Subtype {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Subtype::Pump => write!(f, "PUMP"),
            Subtype::Light => write!(f, "LIGHT"),
            Subtype::Motor => write!(f, "MOTOR"),
            Subtype::Sensor => write!(f, "SENSOR"),
            Subtype::Generic => write!(f, "GENERIC"),
        }
    }
}

/// Compiled-in description of one GPIO pin.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinDescriptor {
    /// BCM GPIO number.
    pub number: u8,
    /// Position on the physical 40-pin header.
    pub physical: u8,
    pub direction: Direction,
    pub subtype: Subtype,
    /// Only meaningful for outputs; inputs are never PWM-driven.
    pub pwm_capable: bool,
}

impl PinDescriptor {
    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }

    /// Returns the document's `type` tag for this pin.

    pub fn device_type(&self) -> &'static str {
        match self.direction {
            Direction::Output => "actuator",
            Direction::Input => "sensor",
        }
    }

    // Short human-readable capability text, used in the default name.

    fn capability(&self) -> &'static str {
        match (self.direction, self.pwm_capable) {
            (Direction::Output, true) => "PWM dimmable",
            (Direction::Output, false) => "on/off",
            (Direction::Input, _) => "input only",
        }
    }

    /// Builds the smart default name for this pin, e.g.
    /// `GPIO18 (PIN12) - LIGHT (PWM dimmable)`.

    pub fn default_name(&self) -> String {
        format!(
            "GPIO{} (PIN{}) - {} ({})",
            self.number,
            self.physical,
            self.subtype,
            self.capability()
        )
    }
}

/// Validates a pin number taken from a document field. Document
/// fields arrive as JSON numbers, so the value may be out of range or
/// not an integer at all.

pub fn pin_from_doc(v: &serde_json::Value) -> Result<u8> {
    match v.as_u64() {
        Some(n) if n <= MAX_PIN as u64 => Ok(n as u8),
        Some(n) => Err(Error::Schema(format!("pin {} out of range", n))),
        None => Err(Error::Schema(format!("bad pin value: {}", v))),
    }
}
