//! The event loop: one reactor, one watcher table, one dispatch thread.
//!
//! [`EventLoop`] owns everything a reactor tick touches:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         EventLoop                              │
//! │  ┌──────────────┐ ┌───────────┐ ┌──────────┐ ┌─────────────┐  │
//! │  │ WatcherTable │ │ ErrorSink │ │ Deferred │ │ ChildSignal │  │
//! │  │ (gen. slab)  │ │           │ │  Queue   │ │   Guard     │  │
//! │  └──────┬───────┘ └─────┬─────┘ └────┬─────┘ └─────────────┘  │
//! │         └───────────────┴────────────┘                        │
//! │                    dispatch (one path, all kinds)             │
//! └───────────────────────────┬───────────────────────────────────┘
//!                             │ run_iteration / wake
//!                     ┌───────▼────────┐
//!                     │ Arc<dyn Reactor>│
//!                     └────────────────┘
//! ```
//!
//! The loop is deliberately `!Send`: exactly one per execution context,
//! with all cross-thread interaction funneled through three `Send + Sync`
//! handles — [`AsyncNotifier`], [`InterruptHandle`], and
//! [`DeferredHandle`](crate::DeferredHandle) — none of which touch watcher
//! state directly.
//!
//! # Auxiliary watchers
//!
//! Construction installs two internal check-phase watchers: the
//! signal-check watcher (forces an interrupt poll on otherwise-idle
//! iterations) and the drain watcher (runs the deferred queue once per
//! tick, after the tick's event callbacks). With
//! [`LoopConfig::reap_children`] a third, child-kind watcher claims the
//! child-exit disposition through the guard. Internal watchers do not keep
//! [`run`](EventLoop::run) alive.

use crate::child::{ChildGuardState, ChildSignalBackend, ChildSignalGuard, MemoryDispositions};
use crate::deferred::{DeferredEntry, DeferredHandle, DeferredQueue};
use crate::dispatch::{dispatch, DispatchOutcome};
use crate::error::{BridgeError, CallbackError, Result};
use crate::reactor::{BlockingPolicy, Firing, Reactor, Revents};
use crate::sink::{ErrorOrigin, ErrorSink};
use crate::watcher::{
    CallbackArgs, WatcherCallback, WatcherHandle, WatcherId, WatcherKind, WatcherSlot,
    WatcherTable,
};
use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Configuration for an [`EventLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Treat this as the process's default loop: run the child-signal
    /// guard's snapshot/restore protocol at construction.
    pub default_loop: bool,
    /// Install a loop-owned child-exit watcher (for reactors that must poll
    /// for child exits) and claim the child disposition immediately.
    pub reap_children: bool,
    /// Maximum deferred-queue entries executed per iteration; a non-empty
    /// remainder re-wakes the reactor.
    pub drain_budget: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            default_loop: false,
            reap_children: false,
            drain_budget: 1000,
        }
    }
}

impl LoopConfig {
    /// Sets the default-loop flag.
    #[must_use]
    pub fn with_default_loop(mut self, default_loop: bool) -> Self {
        self.default_loop = default_loop;
        self
    }

    /// Sets the child-reaping flag.
    #[must_use]
    pub fn with_child_reaping(mut self, reap_children: bool) -> Self {
        self.reap_children = reap_children;
        self
    }

    /// Sets the per-iteration drain budget.
    #[must_use]
    pub fn with_drain_budget(mut self, drain_budget: usize) -> Self {
        self.drain_budget = drain_budget;
        self
    }
}

/// Loop state shared between the loop, its handles, and the dispatcher.
pub(crate) struct LoopShared {
    pub(crate) reactor: Arc<dyn Reactor>,
    pub(crate) config: LoopConfig,
    pub(crate) watchers: RefCell<WatcherTable>,
    pub(crate) deferred: Arc<DeferredQueue>,
    pub(crate) sink: ErrorSink,
    pub(crate) interrupt: Arc<AtomicBool>,
    /// The execution lock: set while a native → managed crossing runs.
    pub(crate) dispatch_lock: Cell<bool>,
    pub(crate) guard: RefCell<ChildSignalGuard>,
    /// Async-wakeup watchers and their cross-thread flags.
    pub(crate) async_flags: RefCell<Vec<(WatcherId, Arc<AtomicBool>)>>,
    pub(crate) signal_check: Cell<WatcherId>,
    pub(crate) drain: Cell<WatcherId>,
    pub(crate) child_reap: Cell<WatcherId>,
}

impl LoopShared {
    /// Installs `callback`/`args` and registers with the reactor.
    /// Idempotent while active.
    pub(crate) fn start_watcher(
        &self,
        id: WatcherId,
        callback: WatcherCallback,
        args: CallbackArgs,
    ) -> Result<()> {
        let (kind, interest) = {
            let mut table = self.watchers.borrow_mut();
            let slot = table.get_mut(id).ok_or(BridgeError::WatcherClosed)?;
            if slot.active {
                return Ok(());
            }
            slot.callback = Some(callback);
            slot.args = args;
            (slot.kind, slot.interest)
        };

        if let Err(source) = self.reactor.register(id, kind, interest) {
            let mut table = self.watchers.borrow_mut();
            if let Some(slot) = table.get_mut(id) {
                slot.callback = None;
                slot.args.clear();
            }
            return Err(BridgeError::Reactor { source });
        }

        self.watchers.borrow_mut().set_active(id, true);
        if kind == WatcherKind::Child {
            self.guard.borrow_mut().install_handler();
        }
        tracing::debug!(?id, kind = kind.as_str(), "watcher started");
        Ok(())
    }

    /// Deregisters and releases callback/argument ownership. Always legal;
    /// idempotent; safe from inside the watcher's own callback.
    pub(crate) fn stop_watcher(&self, id: WatcherId) {
        let was_active;
        {
            let mut table = self.watchers.borrow_mut();
            let Some(slot) = table.get_mut(id) else {
                return;
            };
            slot.callback = None;
            slot.args.clear();
            slot.pending = false;
            let orphaned = slot.orphaned;
            was_active = slot.active;
            if was_active {
                table.set_active(id, false);
            }
            if orphaned {
                table.remove(id);
            }
        }
        if was_active {
            // The registration may already be gone (reactor-side teardown);
            // that is fine, stop must stay legal.
            let _ = self.reactor.deregister(id);
            tracing::debug!(?id, "watcher stopped");
        }
    }

    /// Releases the record when its last handle goes away: immediately if
    /// idle, at the next stop if still active (the table keeps a started
    /// watcher alive, handles or not).
    pub(crate) fn release_handle(&self, id: WatcherId) {
        let mut table = self.watchers.borrow_mut();
        let Some(slot) = table.get_mut(id) else {
            return;
        };
        if slot.active {
            slot.orphaned = true;
        } else {
            table.remove(id);
        }
    }

    /// Writes a dispatched callback back into its record — unless the
    /// record was stopped, released, or re-armed while the callback ran, in
    /// which case the dispatch frame's ownership was the last one and the
    /// callback is dropped here.
    pub(crate) fn restore_callback(
        &self,
        id: WatcherId,
        callback: WatcherCallback,
        args: CallbackArgs,
    ) {
        let mut table = self.watchers.borrow_mut();
        if let Some(slot) = table.get_mut(id) {
            if slot.active && slot.callback.is_none() {
                slot.callback = Some(callback);
                slot.args = args;
            }
        }
    }

    pub(crate) fn clear_pending(&self, id: WatcherId) {
        if let Some(slot) = self.watchers.borrow_mut().get_mut(id) {
            slot.pending = false;
        }
    }

    /// Polls the asynchronous interrupt flag; a set flag is a signal error.
    pub(crate) fn check_interrupt(&self) {
        if self.interrupt.swap(false, Ordering::SeqCst) {
            self.sink
                .report(ErrorOrigin::Signal, CallbackError::new("asynchronous interrupt"));
        }
    }

    /// Runs queued deferred entries in FIFO order, up to the budget.
    pub(crate) fn drain_deferred(&self) {
        let budget = self.config.drain_budget.max(1);
        let mut ran = 0usize;
        while ran < budget {
            let Some(entry) = self.deferred.pop() else {
                break;
            };
            ran += 1;
            let DeferredEntry {
                watcher,
                callback,
                args,
                revents,
            } = entry;
            let invoke_args = args.substituted(revents);
            let outcome = catch_unwind(AssertUnwindSafe(|| callback(&invoke_args)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error),
                Err(payload) => Some(CallbackError::from_panic(payload.as_ref())),
            };
            if let Some(error) = failure {
                self.sink.report(ErrorOrigin::Deferred { watcher }, error);
            }
        }
        if !self.deferred.is_empty() {
            // Leftover entries must not wait out a blocking poll.
            self.reactor.wake();
            tracing::debug!(
                remaining = self.deferred.len(),
                budget,
                "deferred drain budget exhausted"
            );
        }
    }

    /// Turns latched async-notifier flags into firings for this tick.
    pub(crate) fn collect_async_firings(&self, batch: &mut Vec<Firing>) {
        let mut flags = self.async_flags.borrow_mut();
        let table = self.watchers.borrow();
        flags.retain(|(id, flag)| {
            let Some(slot) = table.get(*id) else {
                // Record released; the notifier is orphaned.
                return false;
            };
            // A flag raised before start stays latched until the watcher is
            // actually watching.
            if slot.active && flag.swap(false, Ordering::SeqCst) {
                batch.push(Firing::new(*id, Revents::ASYNC));
            }
            true
        });
    }

    fn mark_pending(&self, batch: &[Firing]) {
        let mut table = self.watchers.borrow_mut();
        for firing in batch {
            if let Some(slot) = table.get_mut(firing.id) {
                if slot.callback.is_some() {
                    slot.pending = true;
                }
            }
        }
    }
}

/// Cross-thread wakeup handle for an async watcher.
///
/// `notify` may be called from any thread; it latches the watcher's flag
/// and wakes the reactor, so a blocking iteration returns promptly and
/// dispatches the watcher exactly once per latched batch.
#[derive(Clone)]
pub struct AsyncNotifier {
    flag: Arc<AtomicBool>,
    reactor: Weak<dyn Reactor>,
}

impl AsyncNotifier {
    /// Signals the async watcher. Multiple notifies before the next
    /// iteration coalesce into one dispatch.
    pub fn notify(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.wake();
        }
    }
}

impl std::fmt::Debug for AsyncNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncNotifier")
            .field("latched", &self.flag.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Cross-thread handle raising the loop's asynchronous interrupt condition.
///
/// The flag is polled at every dispatch entry and iteration boundary and is
/// reported as a signal error through the error sink.
#[derive(Clone)]
pub struct InterruptHandle {
    flag: Arc<AtomicBool>,
    reactor: Weak<dyn Reactor>,
}

impl InterruptHandle {
    /// Raises the interrupt condition and wakes the reactor.
    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Some(reactor) = self.reactor.upgrade() {
            reactor.wake();
        }
    }
}

impl std::fmt::Debug for InterruptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandle")
            .field("raised", &self.flag.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// A single-threaded event loop bridging a native reactor to managed
/// callbacks.
///
/// See the [module docs](self) for the overall shape. One loop per
/// execution context; the type is `!Send` and all watcher operations must
/// happen on the loop's thread.
pub struct EventLoop {
    shared: Rc<LoopShared>,
}

impl EventLoop {
    /// Creates a loop over `reactor` with the default configuration.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Reactor`] if installing the auxiliary watchers fails.
    pub fn new(reactor: Arc<dyn Reactor>) -> Result<Self> {
        Self::with_config(reactor, LoopConfig::default())
    }

    /// Creates a loop with an explicit configuration and an in-process
    /// child-signal backend.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Reactor`] if installing the auxiliary watchers fails.
    pub fn with_config(reactor: Arc<dyn Reactor>, config: LoopConfig) -> Result<Self> {
        Self::with_child_backend(reactor, config, Box::new(MemoryDispositions::new()))
    }

    /// Creates a loop with an explicit child-signal backend.
    ///
    /// With [`LoopConfig::default_loop`] set, the child-signal guard runs
    /// its snapshot/restore protocol here: whatever the embedding process
    /// had installed is back in place when this returns, and the reactor's
    /// disposition is recorded for the first child watcher to claim.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Reactor`] if installing the auxiliary watchers fails.
    pub fn with_child_backend(
        reactor: Arc<dyn Reactor>,
        config: LoopConfig,
        backend: Box<dyn ChildSignalBackend>,
    ) -> Result<Self> {
        let mut guard = ChildSignalGuard::new(backend);
        if config.default_loop {
            let reactor_ref = Arc::clone(&reactor);
            guard.adopt_default_loop(move |signal_backend| {
                if let Some(disposition) = reactor_ref.child_disposition() {
                    signal_backend.restore(&disposition);
                }
            });
        }

        let reap_children = config.reap_children;
        let event_loop = Self {
            shared: Rc::new(LoopShared {
                reactor,
                config,
                watchers: RefCell::new(WatcherTable::new()),
                deferred: Arc::new(DeferredQueue::new()),
                sink: ErrorSink::new(),
                interrupt: Arc::new(AtomicBool::new(false)),
                dispatch_lock: Cell::new(false),
                guard: RefCell::new(guard),
                async_flags: RefCell::new(Vec::new()),
                signal_check: Cell::new(WatcherId::INVALID),
                drain: Cell::new(WatcherId::INVALID),
                child_reap: Cell::new(WatcherId::INVALID),
            }),
        };

        // Auxiliary watchers, in a fixed order so the signal check runs
        // before the drain in the check phase.
        let signal_check = event_loop.start_internal(WatcherKind::Check)?;
        event_loop.shared.signal_check.set(signal_check);
        let drain = event_loop.start_internal(WatcherKind::Check)?;
        event_loop.shared.drain.set(drain);
        if reap_children {
            let child_reap = event_loop.start_internal(WatcherKind::Child)?;
            event_loop.shared.child_reap.set(child_reap);
        }
        Ok(event_loop)
    }

    fn start_internal(&self, kind: WatcherKind) -> Result<WatcherId> {
        let id = self
            .shared
            .watchers
            .borrow_mut()
            .insert(WatcherSlot::new(kind, kind.natural_revents(), true));
        self.shared
            .start_watcher(id, Box::new(|_| Ok(())), CallbackArgs::new())?;
        Ok(id)
    }

    fn make_watcher(&self, kind: WatcherKind, interest: Revents) -> WatcherHandle {
        let id = self
            .shared
            .watchers
            .borrow_mut()
            .insert(WatcherSlot::new(kind, interest, false));
        WatcherHandle::new(id, kind, Rc::downgrade(&self.shared))
    }

    /// Creates a watcher of the given kind with its natural event mask.
    ///
    /// For I/O watchers use [`io`](Self::io), which takes an explicit
    /// interest; for async watchers use
    /// [`async_watcher`](Self::async_watcher), which also yields the
    /// notifier.
    #[must_use]
    pub fn watcher(&self, kind: WatcherKind) -> WatcherHandle {
        self.make_watcher(kind, kind.natural_revents())
    }

    /// Creates an I/O watcher with an explicit readiness interest.
    #[must_use]
    pub fn io(&self, interest: Revents) -> WatcherHandle {
        self.make_watcher(WatcherKind::Io, interest)
    }

    /// Creates a timer watcher (one-shot under reactors that expire timers
    /// autonomously).
    #[must_use]
    pub fn timer(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Timer)
    }

    /// Creates an idle-phase watcher.
    #[must_use]
    pub fn idle(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Idle)
    }

    /// Creates a prepare-phase watcher.
    #[must_use]
    pub fn prepare(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Prepare)
    }

    /// Creates a check-phase watcher.
    #[must_use]
    pub fn check(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Check)
    }

    /// Creates a signal watcher.
    #[must_use]
    pub fn signal(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Signal)
    }

    /// Creates a child-exit watcher. Starting it claims the child-exit
    /// disposition through the guard.
    #[must_use]
    pub fn child(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Child)
    }

    /// Creates a filesystem-change watcher.
    #[must_use]
    pub fn fs(&self) -> WatcherHandle {
        self.watcher(WatcherKind::Fs)
    }

    /// Creates an async-wakeup watcher and its cross-thread notifier.
    #[must_use]
    pub fn async_watcher(&self) -> (WatcherHandle, AsyncNotifier) {
        let handle = self.watcher(WatcherKind::Async);
        let flag = Arc::new(AtomicBool::new(false));
        self.shared
            .async_flags
            .borrow_mut()
            .push((handle.id(), Arc::clone(&flag)));
        let notifier = AsyncNotifier {
            flag,
            reactor: Arc::downgrade(&self.shared.reactor),
        };
        (handle, notifier)
    }

    /// Dispatches one fired watcher: the single entry point the embedding
    /// scheduler drives for any watcher kind.
    pub fn on_event(&self, id: WatcherId, revents: Revents) -> DispatchOutcome {
        // A reentrant call will be refused by the dispatcher and must leave
        // no trace, not even a pending flag.
        if !self.shared.dispatch_lock.get() {
            self.shared.mark_pending(&[Firing::new(id, revents)]);
        }
        dispatch(&self.shared, id, revents)
    }

    /// Runs one reactor tick and dispatches its whole firing batch.
    /// Returns the number of dispatches driven.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Reactor`] if the reactor iteration fails. Callback
    /// failures never surface here; they go to the error sink.
    pub fn run_iteration(&self, policy: BlockingPolicy) -> Result<usize> {
        let shared = &self.shared;
        shared.check_interrupt();

        let mut batch = shared
            .reactor
            .run_iteration(policy)
            .map_err(|source| BridgeError::Reactor { source })?;

        // Async wakeups are events: they belong after the poll but before
        // the check phase, so the drain hook sees anything they enqueue.
        let mut async_firings = Vec::new();
        shared.collect_async_firings(&mut async_firings);
        if !async_firings.is_empty() {
            let check_start = batch
                .iter()
                .position(|firing| firing.revents == Revents::CHECK)
                .unwrap_or(batch.len());
            batch.splice(check_start..check_start, async_firings);
        }
        shared.mark_pending(&batch);

        for firing in &batch {
            let outcome = dispatch(shared, firing.id, firing.revents);
            tracing::trace!(
                id = ?firing.id,
                revents = ?firing.revents,
                outcome = ?outcome,
                "dispatched"
            );
        }
        Ok(batch.len())
    }

    /// Runs iterations until no non-internal watcher is active.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Reactor`] if an iteration fails.
    pub fn run(&self) -> Result<()> {
        while self.shared.watchers.borrow().active_user_count() > 0 {
            self.run_iteration(BlockingPolicy::Once)?;
        }
        Ok(())
    }

    /// Installs the pluggable error handler failures are routed to.
    pub fn set_error_handler<F>(&self, handler: F)
    where
        F: FnMut(&ErrorOrigin, &CallbackError) + 'static,
    {
        self.shared.sink.set_handler(Box::new(handler));
    }

    /// Removes the pluggable error handler; failures fall back to the
    /// last-resort report.
    pub fn clear_error_handler(&self) {
        self.shared.sink.clear_handler();
    }

    /// Returns a `Send + Sync` producer handle for the deferred queue.
    #[must_use]
    pub fn deferred_handle(&self) -> DeferredHandle {
        DeferredHandle::new(
            Arc::clone(&self.shared.deferred),
            Arc::downgrade(&self.shared.reactor),
        )
    }

    /// Enqueues a deferred callback from the loop thread. See
    /// [`DeferredHandle::enqueue`](crate::DeferredHandle::enqueue).
    pub fn enqueue_deferred<F>(
        &self,
        watcher: Option<WatcherId>,
        callback: F,
        args: CallbackArgs,
        revents: Revents,
    ) where
        F: FnOnce(&CallbackArgs) -> std::result::Result<(), CallbackError> + Send + 'static,
    {
        self.deferred_handle().enqueue(watcher, callback, args, revents);
    }

    /// Returns a `Send + Sync` handle raising the asynchronous interrupt
    /// condition.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            flag: Arc::clone(&self.shared.interrupt),
            reactor: Arc::downgrade(&self.shared.reactor),
        }
    }

    /// Snapshots child-signal state ahead of a fork.
    pub fn before_fork(&self) {
        self.shared.guard.borrow_mut().before_fork();
    }

    /// Post-fork hook: demotes child-signal ownership and re-creates
    /// reactor state that does not survive the fork.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Reactor`] if the reactor's fork recovery fails.
    pub fn after_fork(&self) -> Result<()> {
        self.shared.guard.borrow_mut().reset();
        self.shared
            .reactor
            .after_fork()
            .map_err(|source| BridgeError::Reactor { source })
    }

    /// Returns the child-signal guard's current state.
    #[must_use]
    pub fn child_guard_state(&self) -> ChildGuardState {
        self.shared.guard.borrow().state()
    }

    /// Number of active non-internal watchers (what keeps
    /// [`run`](Self::run) going).
    #[must_use]
    pub fn active_watchers(&self) -> usize {
        self.shared.watchers.borrow().active_user_count()
    }

    /// Total watcher records in the table, internal ones included.
    #[must_use]
    pub fn watcher_count(&self) -> usize {
        self.shared.watchers.borrow().len()
    }

    /// Total callback failures routed through the error sink.
    #[must_use]
    pub fn error_reports(&self) -> u64 {
        self.shared.sink.report_count()
    }

    /// Returns the underlying reactor.
    #[must_use]
    pub fn reactor(&self) -> &Arc<dyn Reactor> {
        &self.shared.reactor
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Release the auxiliary watchers so the reactor is not left holding
        // registrations for a dead loop.
        for id in [
            self.shared.signal_check.get(),
            self.shared.drain.get(),
            self.shared.child_reap.get(),
        ] {
            if id != WatcherId::INVALID {
                self.shared.stop_watcher(id);
            }
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("watchers", &self.watcher_count())
            .field("active", &self.active_watchers())
            .field("deferred", &self.shared.deferred.len())
            .finish_non_exhaustive()
    }
}
