//! The hardware seam.
//!
//! `Hal` is a thin façade over the GPIO driver. Two backends
//! implement it: the real one for boards that have a GPIO character
//! device, and a deterministic simulator that keeps pin state in a
//! map. Both have identical semantics so every other component is
//! tested against the simulator.

use crate::{types::pin::PinDescriptor, Result};

/// Synchronous contract with the GPIO layer. Calls are atomic with
/// respect to a single pin; the caller guarantees exclusion (the
/// per-pin mutex in the state cache). The HAL never retries -- a
/// failed call is reported as `Error::Hardware` and the pin must be
/// assumed unchanged.

pub trait Hal: Send + Sync {
    /// Claims the pin and sets its direction. Idempotent; fails if
    /// the pin can't be used in the requested direction.
    fn configure(&self, pin: &PinDescriptor) -> Result<()>;

    /// Drives an output pin high or low.
    fn set_digital(&self, pin: u8, value: bool) -> Result<()>;

    /// Reads the pin level without blocking. For outputs this is the
    /// currently-driven level.
    fn read_digital(&self, pin: u8) -> Result<bool>;

    /// Starts a software PWM signal on the pin. `duty` is 0..100.
    /// Fails unless the pin was configured PWM-capable.
    fn set_pwm(&self, pin: u8, duty: u8, freq_hz: u32) -> Result<()>;

    /// Releases every configured pin. Called exactly once, at
    /// shutdown, after outputs have been driven low.
    fn cleanup(&self);
}
