//! Error taxonomy for the whole crate.
//!
//! Every failure a caller can observe is one of the [`Error`] variants below.
//! Errors captured on an observer while data is being delivered are re-raised
//! by [`Runner::wait`](crate::runner::Runner::wait) in the waiting context, so
//! the variants are `Clone`.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum Error {
    /// The nominal time budget elapsed, including any terminating grace
    /// window that was configured.
    #[error("'{name}' timed out after {after:.1?}")]
    Timeout { name: String, after: Duration },

    /// A command-specific failure pattern matched in the output.
    #[error("command failed: {0}")]
    CommandFailure(String),

    /// A device state transition could not be performed.
    #[error(transparent)]
    Device(#[from] DeviceFailure),

    /// `start()` was called on an observer that is already running.
    #[error("observer '{0}' already started")]
    AlreadyStarted(String),

    /// The observer was awaited before being started.
    #[error("observer '{0}' was never started")]
    NotStarted(String),

    /// The observer was cancelled before it completed.
    #[error("observer '{0}' was cancelled")]
    Cancelled(String),

    /// The connection dropped (or was never there) while the observer still
    /// needed it.
    #[error("connection is gone")]
    ConnectionGone,

    /// Writing to the transport failed.
    #[error("send failed: {0}")]
    Send(String),

    /// No command or event with this name is registered on the device.
    #[error("no command or event named '{0}' registered")]
    UnknownName(String),

    /// A command factory rejected its parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// Failures raised by the device state machine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DeviceFailure {
    /// The requested state is not a vertex of the state graph.
    #[error("unknown state '{0}'")]
    UnknownState(String),

    /// The target state is not reachable from the current one.
    #[error("no path from '{from}' to '{to}'")]
    NoPathFound { from: String, to: String },

    /// A command was requested for a state the device is not in.
    #[error("requires state '{required}', device is in '{current}'")]
    WrongState { required: String, current: String },

    /// Every path attempt failed.
    #[error("transition '{from}' -> '{to}' failed after {attempts} attempt(s): {cause}")]
    TransitionFailed {
        from: String,
        to: String,
        attempts: u32,
        cause: String,
    },
}

impl Error {
    /// Returns `true` for errors another attempt of the same operation might
    /// resolve. `goto_state` stops its rerun attempts early on anything else.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::CommandFailure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_failure_converts() {
        let err: Error = DeviceFailure::UnknownState("LIMBO".into()).into();
        assert!(matches!(err, Error::Device(DeviceFailure::UnknownState(_))));
    }

    #[test]
    fn test_transient_classification() {
        assert!(
            Error::Timeout {
                name: "x".into(),
                after: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!Error::Cancelled("x".into()).is_transient());
    }
}
