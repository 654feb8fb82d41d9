//! Error types for the event engine.
//!
//! The taxonomy is small and maps onto where an operation can fail:
//! configuration of a base, registration of a descriptor, transport I/O
//! outside callback delivery, and a hard backend poll failure. Timeouts are
//! never errors; they are delivered as conditions through callbacks.

use std::io;
use thiserror::Error;

use crate::buffer::BufferError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for base, event, buffer-event and listener operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No backend satisfies the requested configuration, or the
    /// configuration itself is contradictory. Raised at construction only;
    /// no base is produced.
    #[error("configuration rejected: {reason}")]
    Config {
        /// Why no base could be built.
        reason: String,
    },

    /// A descriptor operation violated the registration state machine. The
    /// descriptor remains in its prior state.
    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    /// Transport-level failure surfaced outside callback delivery, such as
    /// a failed bind or an immediately-refused connect.
    #[error("transport error: {source}")]
    Transport {
        /// The underlying OS error.
        #[from]
        source: io::Error,
    },

    /// The backend poller failed hard. Fatal to the current run invocation;
    /// loop state stays consistent and a later run may be attempted.
    #[error("backend poll failed: {source}")]
    Poll {
        /// The underlying OS error.
        source: io::Error,
    },

    /// `run` was re-entered from inside a callback of the same base.
    #[error("dispatch loop is already running")]
    LoopRunning,

    /// A byte-buffer operation was rejected.
    #[error(transparent)]
    Buffer(#[from] BufferError),
}

/// Why a descriptor operation was rejected.
///
/// These never tear down state: the event keeps whatever registration it had
/// before the failing call.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The handle refers to a freed event or to a base that was dropped.
    #[error("event handle is stale (freed, or its base is gone)")]
    Stale,

    /// The operation requires a non-pending event.
    #[error("event is pending; remove it first")]
    Pending,

    /// The condition mask is empty or inconsistent with the handle kind.
    #[error("invalid condition mask for this event: {0}")]
    InvalidMask(&'static str),

    /// Priority outside `0..levels`.
    #[error("priority {priority} out of range (base has {levels} levels)")]
    PriorityRange {
        /// Requested priority.
        priority: usize,
        /// Number of levels configured on the base.
        levels: usize,
    },

    /// Priority levels can only change while no callbacks are queued.
    #[error("cannot resize priority levels while {pending} callbacks are active")]
    LevelsInUse {
        /// How many queued callbacks blocked the resize.
        pending: usize,
    },

    /// An fd already watched level-triggered cannot gain an edge-triggered
    /// watcher, and vice versa.
    #[error("edge-triggered mode conflicts with an existing watcher on fd {fd}")]
    EdgeConflict {
        /// The contended descriptor.
        fd: i32,
    },

    /// The backend refused the descriptor.
    #[error("backend rejected fd {fd}: {message}")]
    Backend {
        /// The rejected descriptor.
        fd: i32,
        /// Stringified OS error (kept clonable).
        message: String,
    },
}

impl RegistrationError {
    pub(crate) fn backend(fd: i32, err: &io::Error) -> Self {
        Self::Backend {
            fd,
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_strings_are_stable() {
        let err = Error::Config {
            reason: "required features unavailable".into(),
        };
        assert_eq!(
            err.to_string(),
            "configuration rejected: required features unavailable"
        );

        let err = Error::from(RegistrationError::Pending);
        assert!(err.to_string().contains("pending"));
    }

    #[test]
    fn io_errors_convert_to_transport() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::Transport { .. }));
    }

    #[test]
    fn registration_errors_are_comparable() {
        assert_eq!(RegistrationError::Stale, RegistrationError::Stale);
        assert_ne!(RegistrationError::Stale, RegistrationError::Pending);
    }
}
