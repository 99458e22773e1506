//! Reactor abstraction: the native event-polling engine behind a trait.
//!
//! The bridge never talks to an OS polling primitive directly. Everything it
//! needs from the native engine is expressed by [`Reactor`]:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       EventLoop                          │
//! │   watcher table · dispatcher · error sink · deferred q   │
//! └───────────────┬─────────────────────────────────────────┘
//!                 │ register / deregister / is_active
//!                 │ run_iteration(policy) -> [Firing]
//!                 │ wake()  (any thread)
//! ┌───────────────▼─────────────────────────────────────────┐
//! │                   Reactor (trait)                        │
//! │        epoll / kqueue / ... or LabReactor (tests)        │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Iteration contract
//!
//! One [`run_iteration`](Reactor::run_iteration) call is one reactor tick.
//! The returned batch is ordered: prepare-phase firings first, then ready
//! events in detection order, then check-phase firings. The loop dispatches
//! the whole batch before asking for the next tick, which is what gives the
//! deferred queue its "drained before the next blocking wait" guarantee.
//!
//! # Autonomous deactivation
//!
//! A reactor may deactivate a watcher on its own — a one-shot timer that
//! expired, or an event source that reported an unrecoverable error. It
//! must reflect that in [`is_active`](Reactor::is_active) *before* the
//! firing is handed out, so the dispatcher's auto-stop pass can release the
//! watcher's callback.

pub mod lab;
mod revents;

pub use lab::LabReactor;
pub use revents::Revents;

use crate::child::Disposition;
use crate::watcher::{WatcherId, WatcherKind};
use std::io;

/// How long an iteration may block waiting for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockingPolicy {
    /// Return immediately, reporting only already-ready events.
    NoWait,
    /// Block until at least one event is ready (or the reactor is woken).
    Once,
}

/// One fired watcher in an iteration batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Firing {
    /// The watcher that fired.
    pub id: WatcherId,
    /// Which condition(s) fired.
    pub revents: Revents,
}

impl Firing {
    /// Creates a firing.
    #[must_use]
    pub const fn new(id: WatcherId, revents: Revents) -> Self {
        Self { id, revents }
    }
}

/// The native single-threaded event-polling engine.
///
/// Implementations are shared as `Arc<dyn Reactor>`; all methods take
/// `&self` and must be callable from the loop thread. Only
/// [`wake`](Self::wake) may be called from any thread.
pub trait Reactor: Send + Sync {
    /// Registers an event source under the watcher's id.
    ///
    /// # Errors
    ///
    /// `io::ErrorKind::AlreadyExists` if the id is already registered, or a
    /// backend-specific error.
    fn register(&self, id: WatcherId, kind: WatcherKind, interest: Revents) -> io::Result<()>;

    /// Removes a registration. Deregistering an unknown id is a no-op —
    /// stop must always be legal, including after the reactor already
    /// dropped the registration on its own.
    ///
    /// # Errors
    ///
    /// Backend-specific errors only.
    fn deregister(&self, id: WatcherId) -> io::Result<()>;

    /// Reports whether the registration is still active.
    ///
    /// Returns `false` for unknown ids and for registrations the reactor
    /// deactivated autonomously (one-shot expiry, error condition).
    fn is_active(&self, id: WatcherId) -> bool;

    /// Runs one tick: prepare phase, wait-for-events per `policy`, check
    /// phase. Returns the ordered firing batch.
    ///
    /// # Errors
    ///
    /// Backend-specific errors; `io::ErrorKind::Interrupted` when a signal
    /// cut the wait short.
    fn run_iteration(&self, policy: BlockingPolicy) -> io::Result<Vec<Firing>>;

    /// Wakes a blocking [`run_iteration`](Self::run_iteration) promptly.
    /// Callable from any thread; multiple wakes coalesce.
    fn wake(&self);

    /// Re-creates internal state that does not survive `fork(2)`.
    ///
    /// The default does nothing; backends with kernel-side state (an epoll
    /// fd, a wake pipe) replace it here.
    ///
    /// # Errors
    ///
    /// Backend-specific errors.
    fn after_fork(&self) -> io::Result<()> {
        Ok(())
    }

    /// The child-exit signal disposition this reactor installs when its
    /// default loop is created, if it watches child processes at all.
    ///
    /// The child-signal guard records and re-applies this; `None` (the
    /// default) means the reactor leaves the process disposition alone.
    fn child_disposition(&self) -> Option<Disposition> {
        None
    }
}
