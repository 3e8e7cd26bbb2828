//! Defines fundamental types used throughout the PinBridge codebase.

use std::fmt;
use tokio::sync::{mpsc, oneshot};

pub mod command;
pub mod pin;
pub mod schedule;

/// Enumerates all the errors that can be reported by the controller.
/// Backends and tasks should map their failures onto one of these
/// values; the associated string carries the details. Keep the
/// variants generic -- don't add a variant that only makes sense for
/// one backend.

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Error {
    /// Returned whenever a resource cannot be found.
    NotFound,

    /// The GPIO layer rejected or failed an operation. The caller
    /// must not assume the pin changed state.
    Hardware(String),

    /// A document-store call failed in a way that may succeed if
    /// retried (timeout, dropped connection).
    TransientRpc(String),

    /// A document field had an unexpected type or an out-of-range
    /// value. The offending document is skipped, never applied.
    Schema(String),

    /// A bad parameter was given in a configuration or a
    /// configuration was missing a required parameter.
    Config(String),

    /// An operation didn't complete in a timely fashion.
    Timeout,

    /// Reported when the peer of a communication channel has closed
    /// its handle.
    MissingPeer(String),

    /// The requested operation couldn't complete. The description
    /// field will have more information for the user.
    Operation(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "item not found"),
            Error::Hardware(v) => write!(f, "hardware error: {}", &v),
            Error::TransientRpc(v) => write!(f, "rpc error: {}", &v),
            Error::Schema(v) => write!(f, "schema error: {}", &v),
            Error::Config(v) => write!(f, "config error: {}", &v),
            Error::Timeout => write!(f, "timeout"),
            Error::MissingPeer(v) => write!(f, "{} is missing peer", &v),
            Error::Operation(v) => {
                write!(f, "couldn't complete operation: {}", &v)
            }
        }
    }
}

// Defining these trait implementations allows any code that sends
// requests over an `mpsc` channel and expects the reply in a
// `oneshot` to easily translate the channel errors into a PinBridge
// error.

impl<T> From<mpsc::error::SendError<T>> for Error {
    fn from(_error: mpsc::error::SendError<T>) -> Self {
        Error::MissingPeer(String::from("request channel is closed"))
    }
}

impl From<oneshot::error::RecvError> for Error {
    fn from(_error: oneshot::error::RecvError) -> Self {
        Error::MissingPeer(String::from("request dropped"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Schema(error.to_string())
    }
}
