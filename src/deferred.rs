//! Deferred callback queue: moves callback execution out of unsafe
//! execution contexts into an ordinary reactor tick.
//!
//! Some code must not run user callbacks where it stands — a signal-handler
//! context, a foreign thread, or reactor-internal code that must not be
//! re-entered. Such code *enqueues*: one lock-free push, nothing else. The
//! loop's drain watcher (a check-phase hook, firing once per reactor
//! iteration) pops and executes entries strictly in FIFO order on the loop
//! thread.
//!
//! # Guarantees
//!
//! - FIFO: entries execute in submission order.
//! - Exactly once: the callback is a `FnOnce` moved out of the queue; no
//!   entry can run twice.
//! - Prompt: enqueueing wakes the reactor, so a blocking wait does not sit
//!   on queued work; entries submitted during iteration *N* run before the
//!   loop blocks for iteration *N + 1*.
//! - Bounded per tick: at most `drain_budget` entries run per iteration;
//!   a non-empty remainder re-wakes the reactor instead of starving the
//!   poll phase.

use crate::reactor::{Reactor, Revents};
use crate::watcher::{CallbackArgs, DeferredCallback, WatcherId};
use crossbeam_queue::SegQueue;
use std::sync::{Arc, Weak};

/// One queued callback execution.
pub(crate) struct DeferredEntry {
    pub(crate) watcher: Option<WatcherId>,
    pub(crate) callback: DeferredCallback,
    pub(crate) args: CallbackArgs,
    pub(crate) revents: Revents,
}

/// FIFO of deferred callback executions.
///
/// The producer side is a single lock-free push and is safe from foreign
/// threads and signal-handler-like contexts; the consumer side runs only on
/// the loop thread.
pub(crate) struct DeferredQueue {
    entries: SegQueue<DeferredEntry>,
}

impl DeferredQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: SegQueue::new(),
        }
    }

    pub(crate) fn push(&self, entry: DeferredEntry) {
        self.entries.push(entry);
    }

    pub(crate) fn pop(&self) -> Option<DeferredEntry> {
        self.entries.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// `Send + Sync` producer handle for the deferred queue.
///
/// Obtained from [`EventLoop::deferred_handle`](crate::EventLoop); may be
/// used from any thread or from signal-handler-like contexts. Each enqueue
/// wakes the reactor so a blocking iteration returns promptly.
#[derive(Clone)]
pub struct DeferredHandle {
    queue: Arc<DeferredQueue>,
    reactor: Weak<dyn Reactor>,
}

impl DeferredHandle {
    pub(crate) fn new(queue: Arc<DeferredQueue>, reactor: Weak<dyn Reactor>) -> Self {
        Self { queue, reactor }
    }

    /// Enqueues a callback for execution on the loop thread.
    ///
    /// `watcher` associates the entry with a watcher for error reporting;
    /// `revents` is substituted into the bundle's leading events sentinel
    /// exactly as in a direct dispatch.
    pub fn enqueue<F>(
        &self,
        watcher: Option<WatcherId>,
        callback: F,
        args: CallbackArgs,
        revents: Revents,
    ) where
        F: FnOnce(&CallbackArgs) -> Result<(), crate::CallbackError> + Send + 'static,
    {
        self.queue.push(DeferredEntry {
            watcher,
            callback: Box::new(callback),
            args,
            revents,
        });
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.wake();
        }
    }

    /// Number of entries waiting to run.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

impl std::fmt::Debug for DeferredHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredHandle")
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallbackError;
    use crate::test_utils::init_test_logging;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    fn entry(tag: i64) -> DeferredEntry {
        DeferredEntry {
            watcher: None,
            callback: Box::new(move |_args| {
                let _ = tag;
                Ok::<(), CallbackError>(())
            }),
            args: CallbackArgs::new(),
            revents: Revents::NONE,
        }
    }

    #[test]
    fn fifo_order() {
        init_test("fifo_order");
        let queue = DeferredQueue::new();
        queue.push(entry(1));
        queue.push(entry(2));
        queue.push(entry(3));
        crate::assert_with_log!(queue.len() == 3, "len", 3usize, queue.len());
        // SegQueue pops in push order.
        let mut popped = 0;
        while queue.pop().is_some() {
            popped += 1;
        }
        crate::assert_with_log!(popped == 3, "all popped", 3usize, popped);
        crate::assert_with_log!(queue.is_empty(), "drained", true, queue.is_empty());
        crate::test_complete!("fifo_order");
    }

    #[test]
    fn cross_thread_enqueue() {
        init_test("cross_thread_enqueue");
        let queue = Arc::new(DeferredQueue::new());
        let producer = Arc::clone(&queue);
        std::thread::spawn(move || {
            producer.push(entry(1));
            producer.push(entry(2));
        })
        .join()
        .expect("producer thread");
        crate::assert_with_log!(queue.len() == 2, "both queued", 2usize, queue.len());
        crate::test_complete!("cross_thread_enqueue");
    }
}
