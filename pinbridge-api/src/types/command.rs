//! Typed view of operator command documents.
//!
//! Commands are one-shot documents in the `commands` subcollection.
//! The controller consumes each exactly once, writes a response, and
//! deletes the command document.

use super::{pin::pin_from_doc, Error};
use crate::Result;
use serde_json::Value;

const MAX_DURATION_MS: u64 = 86_400_000;

/// What the operator wants done with the pin.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
}

impl Action {
    pub fn as_bool(&self) -> bool {
        *self == Action::On
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::On => "on",
            Action::Off => "off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    PinControl,
    PwmControl,
}

/// One operator command, validated.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: String,
    pub kind: CommandKind,
    pub pin: u8,
    pub action: Action,
    /// Auto-off delay; only honored for `action = on`.
    pub duration_ms: Option<u64>,
    /// PWM duty, 0..100.
    pub duty: Option<u8>,
}

impl Command {
    /// Builds a `Command` from a document in the `commands`
    /// subcollection. All field errors are `Error::Schema`; the
    /// processor answers those with an error response instead of
    /// touching hardware.

    pub fn from_doc(id: &str, doc: &Value) -> Result<Command> {
        let kind = match doc.get("type").and_then(Value::as_str) {
            Some("pin_control") => CommandKind::PinControl,
            Some("pwm_control") => CommandKind::PwmControl,
            Some(other) => {
                return Err(Error::Schema(format!(
                    "unknown command type '{}'",
                    other
                )))
            }
            None => {
                return Err(Error::Schema(String::from(
                    "missing command 'type'",
                )))
            }
        };

        let pin = match doc.get("pin") {
            Some(v) => pin_from_doc(v)?,
            None => {
                return Err(Error::Schema(String::from(
                    "missing command 'pin'",
                )))
            }
        };

        let action = match doc.get("action").and_then(Value::as_str) {
            Some("on") => Action::On,
            Some("off") => Action::Off,
            Some(other) => {
                return Err(Error::Schema(format!(
                    "unknown action '{}'",
                    other
                )))
            }
            None => {
                return Err(Error::Schema(String::from(
                    "missing command 'action'",
                )))
            }
        };

        let duration_ms = match doc.get("duration_ms") {
            Some(Value::Null) | None => None,
            Some(v) => match v.as_u64() {
                Some(ms) if ms <= MAX_DURATION_MS => Some(ms),
                _ => {
                    return Err(Error::Schema(String::from(
                        "'duration_ms' out of range",
                    )))
                }
            },
        };

        let duty = match doc.get("duty") {
            Some(Value::Null) | None => None,
            Some(v) => match v.as_u64() {
                Some(d) if d <= 100 => Some(d as u8),
                _ => {
                    return Err(Error::Schema(String::from(
                        "'duty' should be 0..100",
                    )))
                }
            },
        };

        Ok(Command {
            id: String::from(id),
            kind,
            pin,
            action,
            duration_ms,
            duty,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pin_control() {
        let cmd = Command::from_doc(
            "c1",
            &json!({
                "type": "pin_control",
                "pin": 19,
                "action": "on",
                "duration_ms": 3000
            }),
        )
        .unwrap();

        assert_eq!(
            cmd,
            Command {
                id: String::from("c1"),
                kind: CommandKind::PinControl,
                pin: 19,
                action: Action::On,
                duration_ms: Some(3000),
                duty: None
            }
        );
        assert!(cmd.action.as_bool());

        let cmd = Command::from_doc(
            "c2",
            &json!({"type": "pin_control", "pin": 17, "action": "off"}),
        )
        .unwrap();

        assert_eq!(cmd.action, Action::Off);
        assert_eq!(cmd.duration_ms, None);
    }

    #[test]
    fn test_parse_pwm_control() {
        let cmd = Command::from_doc(
            "c3",
            &json!({
                "type": "pwm_control",
                "pin": 18,
                "action": "on",
                "duty": 75
            }),
        )
        .unwrap();

        assert_eq!(cmd.kind, CommandKind::PwmControl);
        assert_eq!(cmd.duty, Some(75));
    }

    #[test]
    fn test_parse_rejects_bad_docs() {
        // Unknown type and action.

        assert!(Command::from_doc(
            "x",
            &json!({"type": "reboot", "pin": 1, "action": "on"})
        )
        .is_err());
        assert!(Command::from_doc(
            "x",
            &json!({"type": "pin_control", "pin": 1, "action": "up"})
        )
        .is_err());

        // Missing fields.

        assert!(Command::from_doc(
            "x",
            &json!({"type": "pin_control", "action": "on"})
        )
        .is_err());
        assert!(
            Command::from_doc("x", &json!({"type": "pin_control", "pin": 1}))
                .is_err()
        );

        // Out-of-range values.

        assert!(Command::from_doc(
            "x",
            &json!({"type": "pin_control", "pin": 99, "action": "on"})
        )
        .is_err());
        assert!(Command::from_doc(
            "x",
            &json!({
                "type": "pwm_control",
                "pin": 18,
                "action": "on",
                "duty": 101
            })
        )
        .is_err());
        assert!(Command::from_doc(
            "x",
            &json!({
                "type": "pin_control",
                "pin": 18,
                "action": "on",
                "duration_ms": "soon"
            })
        )
        .is_err());
    }
}
