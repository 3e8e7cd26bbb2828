//! The compiled-in pin table.
//!
//! Every pin the controller manages is listed here with its physical
//! header position and role. Bootstrap configures exactly these pins;
//! documents referring to pins outside this table are skipped.

use pinbridge_api::types::pin::{Direction, PinDescriptor, Subtype};

pub const PIN_TABLE: &[PinDescriptor] = &[
    PinDescriptor {
        number: 17,
        physical: 11,
        direction: Direction::Output,
        subtype: Subtype::Pump,
        pwm_capable: false,
    },
    PinDescriptor {
        number: 27,
        physical: 13,
        direction: Direction::Output,
        subtype: Subtype::Pump,
        pwm_capable: false,
    },
    PinDescriptor {
        number: 22,
        physical: 15,
        direction: Direction::Output,
        subtype: Subtype::Motor,
        pwm_capable: false,
    },
    // GPIO 18, 12 and 13 are the hardware-PWM capable pins on the
    // 40-pin header.
    PinDescriptor {
        number: 18,
        physical: 12,
        direction: Direction::Output,
        subtype: Subtype::Light,
        pwm_capable: true,
    },
    PinDescriptor {
        number: 12,
        physical: 32,
        direction: Direction::Output,
        subtype: Subtype::Light,
        pwm_capable: true,
    },
    PinDescriptor {
        number: 13,
        physical: 33,
        direction: Direction::Output,
        subtype: Subtype::Light,
        pwm_capable: true,
    },
    PinDescriptor {
        number: 23,
        physical: 16,
        direction: Direction::Output,
        subtype: Subtype::Generic,
        pwm_capable: false,
    },
    PinDescriptor {
        number: 24,
        physical: 18,
        direction: Direction::Output,
        subtype: Subtype::Generic,
        pwm_capable: false,
    },
    PinDescriptor {
        number: 25,
        physical: 22,
        direction: Direction::Output,
        subtype: Subtype::Generic,
        pwm_capable: false,
    },
    PinDescriptor {
        number: 4,
        physical: 7,
        direction: Direction::Input,
        subtype: Subtype::Sensor,
        pwm_capable: false,
    },
    PinDescriptor {
        number: 6,
        physical: 31,
        direction: Direction::Input,
        subtype: Subtype::Sensor,
        pwm_capable: false,
    },
];

/// Finds the descriptor for a BCM pin number, if the pin is managed.

pub fn lookup(pin: u8) -> Option<&'static PinDescriptor> {
    PIN_TABLE.iter().find(|d| d.number == pin)
}

/// Decides whether a stored pin name was generated by an earlier
/// naming convention. Such names are overwritten with the current
/// smart default; anything else the user may have typed is left
/// alone.

pub fn is_legacy_default(desc: &PinDescriptor, name: &str) -> bool {
    name == format!("GPIO {}", desc.number)
        || name == format!("GPIO{}", desc.number)
        || name == format!("GPIO{} (PIN{})", desc.number, desc.physical)
}
