//! The dispatch protocol: one entry point for every watcher kind.
//!
//! The reactor reports a firing as nothing more than (watcher id, event
//! bitmask); everything else — which record, which callback, which
//! arguments, what to do with the result — is decoded here. All nine
//! watcher kinds go through this one path; the record's kind tag selects
//! the per-kind behavior (the I/O force-stop rule), never the record's
//! layout.
//!
//! # Result protocol
//!
//! Every dispatch ends in exactly one [`DispatchOutcome`]:
//!
//! | Outcome    | Meaning                                     | Lifecycle effect      |
//! |------------|---------------------------------------------|-----------------------|
//! | `Continue` | Callback succeeded, watcher still active    | none                  |
//! | `Stop`     | Reactor reports the watcher inactive        | bridge-driven stop    |
//! | `Error`    | Callback failed (routed to the error sink)  | force-stop if I/O     |
//! | `Dead`     | Record gone, retired, or callback absent    | none (no side effect) |
//!
//! `Dead` exists because a batch is decoded before it is dispatched: an
//! earlier callback in the same tick may stop or release a watcher that
//! fired later in the batch.
//!
//! # Ownership during a dispatch
//!
//! The callback box and argument bundle are moved out of the record for the
//! duration of the invocation and only written back if the record is still
//! this activation (still resolvable, still active, callback slot still
//! empty). A reentrant `stop` — or a replacement `start` — from inside the
//! callback therefore takes effect the moment the callback returns, and the
//! record can never be freed mid-call.

use crate::error::CallbackError;
use crate::event_loop::LoopShared;
use crate::reactor::Revents;
use crate::sink::ErrorOrigin;
use crate::watcher::WatcherId;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Result of driving one watcher dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The callback ran; the watcher remains active.
    Continue,
    /// The reactor reported the watcher inactive; the bridge stopped it and
    /// released its callback and arguments.
    Stop,
    /// The callback failed; the failure was routed to the error sink.
    Error,
    /// The watcher was already retired when the event arrived; nothing ran.
    Dead,
}

impl DispatchOutcome {
    /// Integer encoding for embedders driving the bridge across a native
    /// boundary.
    #[must_use]
    pub const fn to_raw(self) -> i32 {
        match self {
            Self::Continue => 0,
            Self::Stop => 1,
            Self::Error => -1,
            Self::Dead => 2,
        }
    }

    /// Decodes the integer encoding. Returns `None` for codes outside the
    /// protocol.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Continue),
            1 => Some(Self::Stop),
            -1 => Some(Self::Error),
            2 => Some(Self::Dead),
            _ => None,
        }
    }

    /// Decodes the integer encoding, failing open: a code outside the
    /// protocol is reported through the last-resort path and treated as
    /// `Continue`, since the watcher's underlying resource may already be
    /// inconsistent and closing it on a garbled code would compound that.
    #[must_use]
    pub fn coerce_raw(raw: i32) -> Self {
        Self::from_raw(raw).unwrap_or_else(|| {
            tracing::error!(raw, "dispatch result code outside protocol; continuing");
            Self::Continue
        })
    }

    /// Returns true for `Continue`.
    #[must_use]
    pub const fn is_continue(self) -> bool {
        matches!(self, Self::Continue)
    }

    /// Returns true for `Error`.
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Error)
    }
}

/// Non-reentrant execution guard for the native → managed crossing.
///
/// The loop is single-threaded, so this is not a mutex: it detects the one
/// violation that matters — the reactor (or a callback) re-entering the
/// dispatcher while a crossing is in progress. It is never held across a
/// blocking wait.
pub(crate) struct ExecutionGuard<'a> {
    flag: &'a Cell<bool>,
}

impl<'a> ExecutionGuard<'a> {
    pub(crate) fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.get() {
            return None;
        }
        flag.set(true);
        Some(Self { flag })
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

/// Drives one dispatch. See the module docs for the full protocol.
pub(crate) fn dispatch(shared: &LoopShared, id: WatcherId, revents: Revents) -> DispatchOutcome {
    let Some(_guard) = ExecutionGuard::acquire(&shared.dispatch_lock) else {
        // Reentrant entry is a protocol violation; report and refuse
        // without side effects.
        tracing::error!(?id, "dispatch re-entered while execution lock held");
        return DispatchOutcome::Dead;
    };

    // Asynchronous interrupts are observed before any callback runs, no
    // matter which watcher fired.
    shared.check_interrupt();

    if id == shared.signal_check.get() {
        // The dedicated signal-check watcher exists only to force the poll
        // above on otherwise-idle iterations; no user callback is attached.
        shared.clear_pending(id);
        return DispatchOutcome::Continue;
    }
    if id == shared.drain.get() {
        shared.clear_pending(id);
        shared.drain_deferred();
        return DispatchOutcome::Continue;
    }

    // Take the callback and arguments out of the record: the dispatch frame
    // owns them until the result is decoded.
    let (kind, mut callback, args) = {
        let mut table = shared.watchers.borrow_mut();
        let Some(slot) = table.get_mut(id) else {
            return DispatchOutcome::Dead;
        };
        slot.pending = false;
        let kind = slot.kind;
        let Some(callback) = slot.callback.take() else {
            return DispatchOutcome::Dead;
        };
        let args = std::mem::take(&mut slot.args);
        (kind, callback, args)
    };

    let invoke_args = args.substituted(revents);
    let outcome = catch_unwind(AssertUnwindSafe(|| callback(&invoke_args)));
    let failure = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(error)) => Some(error),
        Err(payload) => Some(CallbackError::from_panic(payload.as_ref())),
    };

    if let Some(error) = failure {
        shared.sink.report(ErrorOrigin::Watcher { id, kind }, error);
        if kind.is_io() {
            // An erroring I/O callback left active would be re-invoked on
            // the same readiness condition forever.
            shared.stop_watcher(id);
            return DispatchOutcome::Error;
        }
        if shared.reactor.is_active(id) {
            shared.restore_callback(id, callback, args);
        } else {
            shared.stop_watcher(id);
        }
        return DispatchOutcome::Error;
    }

    if shared.reactor.is_active(id) {
        shared.restore_callback(id, callback, args);
        DispatchOutcome::Continue
    } else {
        // Self-stopped, one-shot expiry, or a reactor-detected error
        // condition: release the callback and arguments now rather than
        // leaking them until the record is reused.
        shared.stop_watcher(id);
        DispatchOutcome::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    #[test]
    fn raw_round_trip() {
        init_test("raw_round_trip");
        for outcome in [
            DispatchOutcome::Continue,
            DispatchOutcome::Stop,
            DispatchOutcome::Error,
            DispatchOutcome::Dead,
        ] {
            let back = DispatchOutcome::from_raw(outcome.to_raw());
            crate::assert_with_log!(back == Some(outcome), "round trip", Some(outcome), back);
        }
        crate::test_complete!("raw_round_trip");
    }

    #[test]
    fn unknown_raw_coerces_to_continue() {
        init_test("unknown_raw_coerces_to_continue");
        for raw in [3, -2, 99, i32::MIN] {
            let outcome = DispatchOutcome::coerce_raw(raw);
            crate::assert_with_log!(
                outcome == DispatchOutcome::Continue,
                "fails open",
                DispatchOutcome::Continue,
                outcome
            );
        }
        crate::assert_with_log!(
            DispatchOutcome::from_raw(3).is_none(),
            "strict decode rejects",
            true,
            DispatchOutcome::from_raw(3).is_none()
        );
        crate::test_complete!("unknown_raw_coerces_to_continue");
    }

    #[test]
    fn execution_guard_detects_reentry() {
        init_test("execution_guard_detects_reentry");
        let flag = Cell::new(false);
        let guard = ExecutionGuard::acquire(&flag);
        crate::assert_with_log!(guard.is_some(), "acquired", true, guard.is_some());
        let reentry = ExecutionGuard::acquire(&flag);
        crate::assert_with_log!(reentry.is_none(), "reentry refused", true, reentry.is_none());
        drop(guard);
        let again = ExecutionGuard::acquire(&flag);
        crate::assert_with_log!(again.is_some(), "released", true, again.is_some());
        crate::test_complete!("execution_guard_detects_reentry");
    }
}
