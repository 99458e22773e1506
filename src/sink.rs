//! Error sink: the terminal point of error propagation for reactor-driven
//! callbacks.
//!
//! There is no caller further up the stack to hand a callback failure to —
//! the frame above the dispatcher is the native reactor, which must never
//! see one. So every failure funnels here:
//!
//! 1. The failure is captured as the loop's current error (origin +
//!    payload).
//! 2. It is routed to the pluggable handler installed on the loop, if any.
//! 3. If the handler panics, or none is installed, an unconditional
//!    last-resort report is emitted. That path cannot fail.
//! 4. The captured error is cleared before returning, on every path — the
//!    error condition never leaks across a dispatch boundary.

use crate::error::CallbackError;
use crate::watcher::{WatcherId, WatcherKind};
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Where a reported error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOrigin {
    /// A watcher's callback failed.
    Watcher {
        /// The watcher that was being dispatched.
        id: WatcherId,
        /// Its kind.
        kind: WatcherKind,
    },
    /// An asynchronous interrupt was observed.
    Signal,
    /// A deferred-queue entry failed.
    Deferred {
        /// The watcher the entry was associated with, if any.
        watcher: Option<WatcherId>,
    },
}

impl ErrorOrigin {
    /// Short name for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Watcher { .. } => "watcher",
            Self::Signal => "signal",
            Self::Deferred { .. } => "deferred",
        }
    }
}

/// The currently-captured error condition.
#[derive(Debug, Clone)]
pub(crate) struct CapturedError {
    pub(crate) origin: ErrorOrigin,
    pub(crate) error: CallbackError,
}

/// Pluggable error handler installed on a loop.
pub type ErrorHandler = Box<dyn FnMut(&ErrorOrigin, &CallbackError)>;

/// Captures, routes, and clears callback failures.
pub(crate) struct ErrorSink {
    handler: RefCell<Option<ErrorHandler>>,
    current: RefCell<Option<CapturedError>>,
    reports: std::cell::Cell<u64>,
}

impl ErrorSink {
    pub(crate) fn new() -> Self {
        Self {
            handler: RefCell::new(None),
            current: RefCell::new(None),
            reports: std::cell::Cell::new(0),
        }
    }

    pub(crate) fn set_handler(&self, handler: ErrorHandler) {
        *self.handler.borrow_mut() = Some(handler);
    }

    pub(crate) fn clear_handler(&self) {
        *self.handler.borrow_mut() = None;
    }

    /// Captures and routes in one step.
    pub(crate) fn report(&self, origin: ErrorOrigin, error: CallbackError) {
        *self.current.borrow_mut() = Some(CapturedError { origin, error });
        self.route_current();
    }

    /// Returns true if an error is currently captured (only ever observable
    /// from inside a handler; the sink clears before returning).
    pub(crate) fn has_current(&self) -> bool {
        self.current.borrow().is_some()
    }

    /// Total reports routed, for diagnostics.
    pub(crate) fn report_count(&self) -> u64 {
        self.reports.get()
    }

    fn route_current(&self) {
        let Some(captured) = self.current.borrow_mut().take() else {
            return;
        };
        self.reports.set(self.reports.get() + 1);

        let mut handler_guard = self.handler.borrow_mut();
        if let Some(handler) = handler_guard.as_mut() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                handler(&captured.origin, &captured.error);
            }));
            if outcome.is_err() {
                last_resort(&captured, "error handler panicked");
            }
        } else {
            last_resort(&captured, "no error handler installed");
        }
        // `current` was taken above; nothing to clear. The handler may have
        // reported reentrantly, which routed (and cleared) on its own.
    }
}

/// Unconditional terminal report. Must never fail.
fn last_resort(captured: &CapturedError, reason: &str) {
    tracing::error!(
        origin = captured.origin.as_str(),
        error = %captured.error,
        reason,
        "unhandled callback error"
    );
}
