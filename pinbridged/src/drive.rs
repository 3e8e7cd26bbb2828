//! Helpers that drive a pin and keep the cache honest.
//!
//! Every physical transition goes through one of these: the HAL call
//! and the cache update happen together, inside the pin's exclusive
//! section, so observers never see a `hardware` value that disagrees
//! with the most recent HAL call.

use crate::cache::{PinEntry, PinState};
use pinbridge_api::{hal::Hal, Result};
use std::sync::Arc;

/// Drives a digital level while the caller already holds the pin's
/// exclusive section. On failure the cache is left unchanged.

pub fn digital_locked(
    hal: &dyn Hal,
    entry: &PinEntry,
    state: &mut PinState,
    value: bool,
) -> Result<()> {
    hal.set_digital(entry.desc.number, value)?;
    state.desired = value;
    state.hardware = value;
    state.note_drive();
    Ok(())
}

/// Starts a PWM signal while the caller already holds the pin's
/// exclusive section.

pub fn pwm_locked(
    hal: &dyn Hal,
    entry: &PinEntry,
    state: &mut PinState,
    duty: u8,
    freq_hz: u32,
) -> Result<()> {
    hal.set_pwm(entry.desc.number, duty, freq_hz)?;
    state.pwm_duty = duty;
    state.desired = duty > 0;
    state.hardware = duty > 0;
    state.note_drive();
    Ok(())
}

/// Acquires the pin and drives a digital level.

pub async fn digital(
    hal: &Arc<dyn Hal>,
    entry: &Arc<PinEntry>,
    value: bool,
) -> Result<()> {
    let mut state = entry.lock().await;

    digital_locked(hal.as_ref(), entry, &mut state, value)
}
