//! GPIO backend for Raspberry Pi boards, built on `rppal`.
//!
//! Pins are claimed through the memory-mapped GPIO interface and kept
//! in a table for the lifetime of the process. `rppal` resets claimed
//! pins to their original state on drop, which gives us the release
//! semantics `cleanup` promises.

use pinbridge_api::{
    hal::Hal,
    types::pin::{Direction, PinDescriptor},
    Error, Result,
};
use rppal::gpio::{Gpio, InputPin, OutputPin};
use std::collections::HashMap;
use std::sync::Mutex;

enum Claimed {
    Output { pin: OutputPin, pwm: bool },
    Input(InputPin),
}

pub struct RpiHal {
    gpio: Gpio,
    pins: Mutex<HashMap<u8, Claimed>>,
}

// rppal errors carry the detail we want in the log; wrap them all the
// same way.

fn hw_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Hardware(e.to_string())
}

impl RpiHal {
    pub fn new() -> Result<RpiHal> {
        Ok(RpiHal {
            gpio: Gpio::new().map_err(hw_err)?,
            pins: Mutex::new(HashMap::new()),
        })
    }
}

impl Hal for RpiHal {
    fn configure(&self, pin: &PinDescriptor) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();

        if pins.contains_key(&pin.number) {
            return Ok(());
        }

        let raw = self.gpio.get(pin.number).map_err(hw_err)?;
        let claimed = match pin.direction {
            Direction::Output => Claimed::Output {
                pin: raw.into_output_low(),
                pwm: pin.pwm_capable,
            },
            Direction::Input => Claimed::Input(raw.into_input()),
        };

        pins.insert(pin.number, claimed);
        Ok(())
    }

    fn set_digital(&self, pin: u8, value: bool) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();

        match pins.get_mut(&pin) {
            Some(Claimed::Output { pin: p, .. }) => {
                // A previous PWM signal keeps running until cleared.

                let _ = p.clear_pwm();

                if value {
                    p.set_high()
                } else {
                    p.set_low()
                }
                Ok(())
            }
            Some(Claimed::Input(_)) => Err(Error::Hardware(format!(
                "pin {} is not an output",
                pin
            ))),
            None => {
                Err(Error::Hardware(format!("pin {} not configured", pin)))
            }
        }
    }

    fn read_digital(&self, pin: u8) -> Result<bool> {
        let pins = self.pins.lock().unwrap();

        match pins.get(&pin) {
            Some(Claimed::Output { pin: p, .. }) => Ok(p.is_set_high()),
            Some(Claimed::Input(p)) => Ok(p.is_high()),
            None => {
                Err(Error::Hardware(format!("pin {} not configured", pin)))
            }
        }
    }

    fn set_pwm(&self, pin: u8, duty: u8, freq_hz: u32) -> Result<()> {
        let mut pins = self.pins.lock().unwrap();

        match pins.get_mut(&pin) {
            Some(Claimed::Output { pin: p, pwm: true }) => p
                .set_pwm_frequency(freq_hz as f64, duty as f64 / 100.0)
                .map_err(hw_err),
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
        // Dropping the claimed pins lets rppal restore their original
        // state.

        self.pins.lock().unwrap().clear()
    }
}
