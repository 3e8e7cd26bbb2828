//! A deterministic, in-memory GPIO backend.
//!
//! Pin state lives in a map. Outputs read back the last value
//! written; inputs read from a pluggable source (defaults to
//! `false`). Every write is also appended to a history list so tests
//! can assert on the exact sequence of hardware actions.

use pinbridge_api::{
    hal::Hal,
    types::pin::{Direction, PinDescriptor},
    Error, Result,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// One recorded hardware action.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Write {
    Digital(u8, bool),
    Pwm(u8, u8),
}

struct SimPin {
    desc: PinDescriptor,
    level: bool,
    duty: u8,
}

type InputSource = Box<dyn Fn(u8) -> bool + Send>;

#[derive(Default)]
struct Inner {
    pins: HashMap<u8, SimPin>,
    history: Vec<Write>,
    input_source: Option<InputSource>,
}

pub struct SimHal {
    inner: Mutex<Inner>,
}

impl SimHal {
    pub fn new() -> SimHal {
        SimHal {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replaces the value source used by input pins.

    pub fn set_input_source<F>(&self, f: F)
    where
        F: Fn(u8) -> bool + Send + 'static,
    {
        self.inner.lock().unwrap().input_source = Some(Box::new(f))
    }

    /// Returns the currently-driven level of an output pin.

    pub fn level(&self, pin: u8) -> Option<bool> {
        self.inner.lock().unwrap().pins.get(&pin).map(|p| p.level)
    }

    /// Returns the last PWM duty written to a pin.

    pub fn duty(&self, pin: u8) -> Option<u8> {
        self.inner.lock().unwrap().pins.get(&pin).map(|p| p.duty)
    }

    /// Returns the recorded sequence of writes.

    pub fn history(&self) -> Vec<Write> {
        self.inner.lock().unwrap().history.clone()
    }

    /// Clears the recorded write history.

    pub fn clear_history(&self) {
        self.inner.lock().unwrap().history.clear()
    }
}

impl Default for SimHal {
    fn default() -> Self {
        SimHal::new()
    }
}

impl Hal for SimHal {
    fn configure(&self, pin: &PinDescriptor) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        // Reconfiguring the same pin the same way is idempotent;
        // flipping its direction is not allowed.

        if let Some(existing) = inner.pins.get(&pin.number) {
            if existing.desc.direction != pin.direction {
                return Err(Error::Hardware(format!(
                    "pin {} already configured as {:?}",
                    pin.number, existing.desc.direction
                )));
            }
        }

        inner.pins.insert(
            pin.number,
            SimPin {
                desc: *pin,
                level: false,
                duty: 0,
            },
        );
        Ok(())
    }

    fn set_digital(&self, pin: u8, value: bool) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.pins.get_mut(&pin) {
            Some(p) if p.desc.direction == Direction::Output => {
                p.level = value;
                inner.history.push(Write::Digital(pin, value));
                Ok(())
            }
            Some(_) => Err(Error::Hardware(format!(
                "pin {} is not an output",
                pin
            ))),
            None => {
                Err(Error::Hardware(format!("pin {} not configured", pin)))
            }
        }
    }

    fn read_digital(&self, pin: u8) -> Result<bool> {
        let inner = self.inner.lock().unwrap();

        match inner.pins.get(&pin) {
            Some(p) if p.desc.direction == Direction::Output => Ok(p.level),
            Some(_) => Ok(inner
                .input_source
                .as_ref()
                .map(|f| f(pin))
                .unwrap_or(false)),
            None => {
                Err(Error::Hardware(format!("pin {} not configured", pin)))
            }
        }
    }

    fn set_pwm(&self, pin: u8, duty: u8, _freq_hz: u32) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();

        match inner.pins.get_mut(&pin) {
            Some(p) if p.desc.pwm_capable => {
                p.duty = duty;
                p.level = duty > 0;
                inner.history.push(Write::Pwm(pin, duty));
                Ok(())
            }
            Some(_) => Err(Error::Hardware(format!(
                "pin {} is not PWM-capable",
                pin
            ))),
            None => {
                Err(Error::Hardware(format!("pin {} not configured", pin)))
            }
        }
    }

    fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();

        inner.pins.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinbridge_api::types::pin::Subtype;

    fn out_pin(n: u8, pwm: bool) -> PinDescriptor {
        PinDescriptor {
            number: n,
            physical: n,
            direction: Direction::Output,
            subtype: Subtype::Generic,
            pwm_capable: pwm,
        }
    }

    fn in_pin(n: u8) -> PinDescriptor {
        PinDescriptor {
            number: n,
            physical: n,
            direction: Direction::Input,
            subtype: Subtype::Sensor,
            pwm_capable: false,
        }
    }

    #[test]
    fn test_digital_roundtrip() {
        let hal = SimHal::new();

        // Unconfigured pins are rejected.

        assert!(hal.set_digital(17, true).is_err());
        assert!(hal.read_digital(17).is_err());

        hal.configure(&out_pin(17, false)).unwrap();

        assert_eq!(hal.read_digital(17), Ok(false));
        hal.set_digital(17, true).unwrap();
        assert_eq!(hal.read_digital(17), Ok(true));
        hal.set_digital(17, false).unwrap();
        assert_eq!(hal.read_digital(17), Ok(false));

        assert_eq!(
            hal.history(),
            vec![Write::Digital(17, true), Write::Digital(17, false)]
        );
    }

    #[test]
    fn test_direction_rules() {
        let hal = SimHal::new();

        hal.configure(&in_pin(4)).unwrap();

        // Writing an input fails; reading it uses the source.

        assert!(hal.set_digital(4, true).is_err());
        assert_eq!(hal.read_digital(4), Ok(false));

        hal.set_input_source(|_| true);
        assert_eq!(hal.read_digital(4), Ok(true));

        // Re-configuring with the same direction is fine; flipping
        // direction is not.

        assert!(hal.configure(&in_pin(4)).is_ok());
        assert!(hal.configure(&out_pin(4, false)).is_err());
    }

    #[test]
    fn test_pwm_rules() {
        let hal = SimHal::new();

        hal.configure(&out_pin(18, true)).unwrap();
        hal.configure(&out_pin(23, false)).unwrap();

        hal.set_pwm(18, 75, 1000).unwrap();
        assert_eq!(hal.duty(18), Some(75));
        assert_eq!(hal.read_digital(18), Ok(true));

        hal.set_pwm(18, 0, 1000).unwrap();
        assert_eq!(hal.read_digital(18), Ok(false));

        assert!(hal.set_pwm(23, 50, 1000).is_err());
        assert!(hal.set_pwm(99, 50, 1000).is_err());
    }

    #[test]
    fn test_cleanup_releases_pins() {
        let hal = SimHal::new();

        hal.configure(&out_pin(17, false)).unwrap();
        hal.cleanup();
        assert!(hal.read_digital(17).is_err());
    }
}
