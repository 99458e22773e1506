//! Error types for the bridge.
//!
//! Two kinds of failure flow through this crate and they never mix:
//!
//! - [`BridgeError`] is returned by fallible bridge operations (starting a
//!   watcher, running an iteration). These are the caller's problem and
//!   propagate with `?`.
//! - [`CallbackError`] is how a user callback reports failure to the
//!   dispatcher. It is routed to the loop's error sink and never propagates
//!   to the reactor; a panicking callback is converted into one.

use std::any::Any;
use std::fmt;
use std::io;
use thiserror::Error;

/// Errors returned by bridge operations.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The native reactor refused an operation.
    #[error("reactor operation failed: {source}")]
    Reactor {
        /// The underlying reactor error.
        #[source]
        source: io::Error,
    },

    /// The watcher's slot has been released; the id no longer resolves.
    #[error("watcher is closed")]
    WatcherClosed,

    /// The owning event loop has been dropped.
    #[error("event loop has been dropped")]
    LoopGone,
}

/// Convenience alias for bridge results.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure reported by a user callback.
///
/// Carries a human-readable message and whether the failure was a caught
/// panic rather than an ordinary `Err` return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackError {
    message: String,
    panicked: bool,
}

impl CallbackError {
    /// Creates a callback error with the given message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            panicked: false,
        }
    }

    /// Creates a callback error from a caught panic payload.
    ///
    /// Extracts the conventional `&str`/`String` panic message when present;
    /// other payload types are reported opaquely.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "callback panicked with non-string payload".to_string()
        };
        Self {
            message,
            panicked: true,
        }
    }

    /// Returns the failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns `true` if this error was a caught panic.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        self.panicked
    }
}

impl fmt::Display for CallbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.panicked {
            write!(f, "callback panicked: {}", self.message)
        } else {
            write!(f, "callback failed: {}", self.message)
        }
    }
}

impl std::error::Error for CallbackError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn callback_error_message() {
        init_test("callback_error_message");
        let err = CallbackError::new("boom");
        crate::assert_with_log!(err.message() == "boom", "message", "boom", err.message());
        crate::assert_with_log!(!err.is_panic(), "not a panic", false, err.is_panic());
        crate::test_complete!("callback_error_message");
    }

    #[test]
    fn from_panic_extracts_str_payload() {
        init_test("from_panic_extracts_str_payload");
        let payload = std::panic::catch_unwind(|| panic!("kaboom")).unwrap_err();
        let err = CallbackError::from_panic(payload.as_ref());
        crate::assert_with_log!(err.is_panic(), "panic flag", true, err.is_panic());
        crate::assert_with_log!(err.message() == "kaboom", "message", "kaboom", err.message());
        crate::test_complete!("from_panic_extracts_str_payload");
    }

    #[test]
    fn from_panic_handles_opaque_payload() {
        init_test("from_panic_handles_opaque_payload");
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42_u32)).unwrap_err();
        let err = CallbackError::from_panic(payload.as_ref());
        crate::assert_with_log!(err.is_panic(), "panic flag", true, err.is_panic());
        let opaque = err.message().contains("non-string");
        crate::assert_with_log!(opaque, "opaque message", true, opaque);
        crate::test_complete!("from_panic_handles_opaque_payload");
    }

    #[test]
    fn display_formats() {
        init_test("display_formats");
        let plain = CallbackError::new("x").to_string();
        crate::assert_with_log!(
            plain == "callback failed: x",
            "plain display",
            "callback failed: x",
            plain
        );
        crate::test_complete!("display_formats");
    }
}
