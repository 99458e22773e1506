//! Evbridge: watcher/callback bridge between a native event reactor and
//! managed callback execution.
//!
//! # Overview
//!
//! A native event reactor is a single-threaded poll/dispatch engine: it
//! watches timers, I/O readiness, idle/prepare/check phases, child-process
//! exits, and cross-thread wake signals, and reports each firing as nothing
//! more than an identifier and an event bitmask. This crate is the layer
//! that turns those firings into managed callback executions — and keeps
//! the reactor safe from everything a callback can do, including failing,
//! panicking, stopping its own watcher, or tearing down the thing that
//! fired.
//!
//! # Core Guarantees
//!
//! - **One dispatch path**: every watcher kind goes through the same entry
//!   point; a record's kind tag selects behavior, never its layout
//! - **Four-state result protocol**: each dispatch ends in exactly one of
//!   CONTINUE, STOP, ERROR, or DEAD, in that strict order of decoding
//! - **Failure is contained**: a failing callback reaches the error sink,
//!   never the reactor; a failing I/O callback is force-stopped so it
//!   cannot error-loop
//! - **Teardown-tolerant**: a watcher may be stopped or replaced during its
//!   own callback; the dispatch frame owns the callback until the result is
//!   decoded
//! - **Unsafe contexts defer**: signal-handler-like contexts enqueue;
//!   execution happens on the loop thread, FIFO, before the next blocking
//!   wait
//! - **Fork-correct child reaping**: a three-state guard preserves the
//!   embedder's child-exit disposition across default-loop creation and
//!   fork
//!
//! # Module Structure
//!
//! - [`reactor`]: the [`Reactor`] trait, event bitmask, and the
//!   deterministic [`LabReactor`] test backend
//! - [`watcher`]: watcher kinds, generational ids, argument bundles, and
//!   handles
//! - [`dispatch`]: the dispatch protocol and [`DispatchOutcome`]
//! - [`event_loop`]: [`EventLoop`], its configuration, and the cross-thread
//!   handles
//! - [`deferred`]: the deferred callback queue
//! - [`child`]: the child-signal guard
//! - [`sink`]: error origins and the pluggable handler contract
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use evbridge::{BlockingPolicy, CallbackArgs, EventLoop, LabReactor, Revents};
//! use std::sync::Arc;
//!
//! let reactor = Arc::new(LabReactor::new());
//! let event_loop = EventLoop::new(reactor.clone())?;
//!
//! let timer = event_loop.timer();
//! timer.start(|_| Ok(()), CallbackArgs::new())?;
//!
//! reactor.fire(timer.id(), Revents::TIMER);
//! event_loop.run_iteration(BlockingPolicy::Once)?;
//! assert!(!timer.is_active()); // one-shot: auto-stopped, callback released
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod child;
pub mod deferred;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod reactor;
pub mod sink;
pub mod watcher;

#[cfg(test)]
pub(crate) mod test_utils;

pub use child::{
    ChildGuardState, ChildSignalBackend, ChildSignalGuard, Disposition, MemoryDispositions,
};
pub use deferred::DeferredHandle;
pub use dispatch::DispatchOutcome;
pub use error::{BridgeError, CallbackError, Result};
pub use event_loop::{AsyncNotifier, EventLoop, InterruptHandle, LoopConfig};
pub use reactor::{BlockingPolicy, Firing, LabReactor, Reactor, Revents};
pub use sink::{ErrorHandler, ErrorOrigin};
pub use watcher::{Arg, CallbackArgs, DeferredCallback, WatcherCallback, WatcherHandle, WatcherId, WatcherKind};
