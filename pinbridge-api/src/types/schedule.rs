//! Typed view of the per-pin schedule entries stored in the device
//! document.
//!
//! Schedules arrive as JSON maps under `gpioState.<pin>.schedules`.
//! Operators edit them from the companion app, so every field is
//! validated here and malformed entries are reported as
//! `Error::Schema` instead of being applied.

use super::Error;
use crate::Result;
use serde_json::Value;

// Durations are bounded to keep a mistyped value from parking an
// executor for weeks. One day covers every legitimate use.

const MAX_DURATION_MS: u64 = 86_400_000;
const MAX_CYCLES: u64 = 1_000_000;
const MAX_FADE_STEPS: u64 = 10_000;

/// A daily window of local wall-clock time, expressed in minutes
/// since midnight. `start > end` means the window wraps midnight.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub enabled: bool,
    pub start: u16,
    pub end: u16,
}

impl TimeWindow {
    /// Decides whether the window admits the given minute-of-day.
    ///
    /// A disabled window admits everything. `start == end` is defined
    /// as always open. Minutes equal to `end` are outside the window.

    pub fn admits(&self, minute: u16) -> bool {
        if !self.enabled || self.start == self.end {
            true
        } else if self.start < self.end {
            self.start <= minute && minute < self.end
        } else {
            minute >= self.start || minute < self.end
        }
    }
}

/// Parses a wall-clock `"HH:MM"` string into minutes since midnight.

pub fn parse_hhmm(s: &str) -> Result<u16> {
    let bad = || Error::Schema(format!("bad time of day: '{}'", s));

    match s.split_once(':') {
        Some((hh, mm)) => {
            let hh = hh.parse::<u16>().map_err(|_| bad())?;
            let mm = mm.parse::<u16>().map_err(|_| bad())?;

            if hh < 24 && mm < 60 {
                Ok(hh * 60 + mm)
            } else {
                Err(bad())
            }
        }
        None => Err(bad()),
    }
}

/// Outcome of the most recent run of a schedule. Written back to the
/// document as `schedules.<id>.last_status`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    SkippedOutOfWindow,
    SupersededByOverride,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::SkippedOutOfWindow => "skipped_out_of_window",
            RunStatus::SupersededByOverride => "superseded_by_override",
            RunStatus::Error => "error",
        }
    }
}

/// The type-specific portion of a schedule.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleKind {
    /// Drive the pin high for `on_ms`, low for `off_ms`, `cycles`
    /// times. Terminal state is low.
    PwmCycle { cycles: u32, on_ms: u64, off_ms: u64 },

    /// Ramp the PWM duty linearly from `start_duty` to `end_duty`
    /// over `total_ms` in `steps` writes. Requires a PWM-capable pin.
    PwmFade {
        total_ms: u64,
        steps: u32,
        start_duty: u8,
        end_duty: u8,
    },

    /// Toggle the pin `cycles` times with `interval_ms` between
    /// toggles. An even number of toggles, so the pin ends where it
    /// started.
    DigitalToggle { cycles: u32, interval_ms: u64 },

    /// Drive the pin to `state`, hold for `hold_ms`, then drive it
    /// low.
    HoldState { state: bool, hold_ms: u64 },
}

/// One schedule, as configured by the operator.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub id: String,
    pub enabled: bool,
    pub window: Option<TimeWindow>,
    pub kind: ScheduleKind,
}

impl ScheduleSpec {
    /// Decides whether this schedule's window admits the given
    /// minute-of-day. A schedule without a window runs
    /// unconditionally.

    pub fn in_window(&self, minute: u16) -> bool {
        self.window.map(|w| w.admits(minute)).unwrap_or(true)
    }

    /// Builds a `ScheduleSpec` from the JSON map stored in the device
    /// document. Unknown `type` values, missing parameters, and
    /// out-of-range values are `Error::Schema`.

    pub fn from_doc(id: &str, doc: &Value) -> Result<ScheduleSpec> {
        let enabled = opt_bool(doc, "enabled")?.unwrap_or(false);
        let window = parse_window(doc.get("time_window"))?;

        let kind = match doc.get("type").and_then(Value::as_str) {
            Some("pwm_cycle") => ScheduleKind::PwmCycle {
                cycles: req_cycles(doc, "cycles")?,
                on_ms: req_duration(doc, "on_duration_ms")?,
                off_ms: req_duration(doc, "off_duration_ms")?,
            },

            Some("pwm_fade") => {
                let steps = req_u64(doc, "steps")?;

                if !(1..=MAX_FADE_STEPS).contains(&steps) {
                    return Err(Error::Schema(String::from(
                        "'steps' out of range",
                    )));
                }

                ScheduleKind::PwmFade {
                    total_ms: req_duration(doc, "total_duration_ms")?,
                    steps: steps as u32,
                    start_duty: opt_duty(doc, "start_duty")?.unwrap_or(0),
                    end_duty: opt_duty(doc, "end_duty")?.unwrap_or(100),
                }
            }

            Some("digital_toggle") => ScheduleKind::DigitalToggle {
                cycles: req_cycles(doc, "cycles")?,
                interval_ms: req_duration(doc, "toggle_interval_ms")?,
            },

            Some("hold_state") => ScheduleKind::HoldState {
                state: req_bool(doc, "state")?,
                hold_ms: req_duration(doc, "hold_duration_ms")?,
            },

            Some(other) => {
                return Err(Error::Schema(format!(
                    "unknown schedule type '{}'",
                    other
                )))
            }
            None => {
                return Err(Error::Schema(String::from(
                    "missing schedule 'type'",
                )))
            }
        };

        Ok(ScheduleSpec {
            id: String::from(id),
            enabled,
            window,
            kind,
        })
    }
}

fn parse_window(v: Option<&Value>) -> Result<Option<TimeWindow>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(_)) => {
            let v = v.unwrap();
            let enabled = opt_bool(v, "enabled")?.unwrap_or(false);
            let start = match v.get("start").and_then(Value::as_str) {
                Some(s) => parse_hhmm(s)?,
                None if enabled => {
                    return Err(Error::Schema(String::from(
                        "time window missing 'start'",
                    )))
                }
                None => 0,
            };
            let end = match v.get("end").and_then(Value::as_str) {
                Some(s) => parse_hhmm(s)?,
                None if enabled => {
                    return Err(Error::Schema(String::from(
                        "time window missing 'end'",
                    )))
                }
                None => 0,
            };

            Ok(Some(TimeWindow {
                enabled,
                start,
                end,
            }))
        }
        Some(_) => {
            Err(Error::Schema(String::from("'time_window' should be a map")))
        }
    }
}

fn req_u64(doc: &Value, key: &str) -> Result<u64> {
    match doc.get(key) {
        Some(v) => v.as_u64().ok_or_else(|| {
            Error::Schema(format!("'{}' should be a non-negative integer", key))
        }),
        None => Err(Error::Schema(format!("missing '{}' parameter", key))),
    }
}

fn req_duration(doc: &Value, key: &str) -> Result<u64> {
    let v = req_u64(doc, key)?;

    if v <= MAX_DURATION_MS {
        Ok(v)
    } else {
        Err(Error::Schema(format!("'{}' out of range", key)))
    }
}

fn req_cycles(doc: &Value, key: &str) -> Result<u32> {
    let v = req_u64(doc, key)?;

    if v <= MAX_CYCLES {
        Ok(v as u32)
    } else {
        Err(Error::Schema(format!("'{}' out of range", key)))
    }
}

fn req_bool(doc: &Value, key: &str) -> Result<bool> {
    match doc.get(key) {
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => {
            Err(Error::Schema(format!("'{}' should be a boolean", key)))
        }
        None => Err(Error::Schema(format!("missing '{}' parameter", key))),
    }
}

fn opt_bool(doc: &Value, key: &str) -> Result<Option<bool>> {
    match doc.get(key) {
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => {
            Err(Error::Schema(format!("'{}' should be a boolean", key)))
        }
    }
}

fn opt_duty(doc: &Value, key: &str) -> Result<Option<u8>> {
    match doc.get(key) {
        Some(v) => match v.as_u64() {
            Some(d) if d <= 100 => Ok(Some(d as u8)),
            _ => Err(Error::Schema(format!("'{}' should be 0..100", key))),
        },
        None => Ok(None),
    }
}
