//! Deterministic in-memory reactor for testing.
//!
//! [`LabReactor`] implements [`Reactor`] without touching the OS: tests
//! inject firings, the iteration batch is assembled in a fixed order
//! (prepare watchers, injected events, check watchers), and nothing ever
//! actually blocks — [`BlockingPolicy::Once`](super::BlockingPolicy) returns
//! an empty batch when there is nothing to deliver, so a test can never
//! hang on a wait.
//!
//! Autonomous deactivation is modeled two ways:
//!
//! - registrations marked one-shot (timers are, by default) deactivate when
//!   they fire;
//! - a firing carrying [`Revents::ERROR`] deactivates its registration, the
//!   way a native engine stops a watcher whose source went bad.
//!
//! # Example
//!
//! ```ignore
//! let reactor = Arc::new(LabReactor::new());
//! let event_loop = EventLoop::new(reactor.clone())?;
//! let timer = event_loop.timer();
//! timer.start(|_| Ok(()), CallbackArgs::new())?;
//!
//! reactor.fire(timer.id(), Revents::TIMER);
//! event_loop.run_iteration(BlockingPolicy::NoWait)?;
//! assert!(!timer.is_active()); // one-shot: auto-stopped
//! ```

use super::{BlockingPolicy, Firing, Reactor, Revents};
use crate::child::Disposition;
use crate::watcher::{WatcherId, WatcherKind};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug)]
struct LabRegistration {
    kind: WatcherKind,
    #[allow(dead_code)]
    interest: Revents,
    active: bool,
    one_shot: bool,
}

#[derive(Default)]
struct LabState {
    /// Keyed by id for deterministic phase-firing order.
    registrations: BTreeMap<WatcherId, LabRegistration>,
    /// Injected ready events, in injection order.
    injected: VecDeque<Firing>,
}

/// Deterministic [`Reactor`] for tests.
pub struct LabReactor {
    state: Mutex<LabState>,
    woken: AtomicBool,
    iterations: AtomicU64,
}

impl LabReactor {
    /// Disposition token the lab "installs" for child-exit handling.
    pub const CHILD_DISPOSITION: u64 = 0xC41D;

    /// Creates an empty lab reactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LabState::default()),
            woken: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
        }
    }

    /// Injects a ready event for `id`, delivered on the next iteration.
    ///
    /// Injections for unregistered or inactive ids are dropped at delivery
    /// time, the way a native engine never fires a stopped watcher.
    pub fn fire(&self, id: WatcherId, revents: Revents) {
        self.state.lock().injected.push_back(Firing::new(id, revents));
    }

    /// Overrides the one-shot flag for a registration.
    ///
    /// Timers register one-shot by default; everything else repeats.
    pub fn set_one_shot(&self, id: WatcherId, one_shot: bool) {
        if let Some(reg) = self.state.lock().registrations.get_mut(&id) {
            reg.one_shot = one_shot;
        }
    }

    /// Returns how many iterations have run.
    #[must_use]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// Returns how many injected events are waiting for delivery.
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.state.lock().injected.len()
    }

    /// Returns true if a wake is latched for the next iteration.
    #[must_use]
    pub fn wake_latched(&self) -> bool {
        self.woken.load(Ordering::SeqCst)
    }

    fn phase_firings(state: &LabState, kind: WatcherKind, revents: Revents) -> Vec<Firing> {
        state
            .registrations
            .iter()
            .filter(|(_, reg)| reg.active && reg.kind == kind)
            .map(|(id, _)| Firing::new(*id, revents))
            .collect()
    }
}

impl Default for LabReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor for LabReactor {
    fn register(&self, id: WatcherId, kind: WatcherKind, interest: Revents) -> io::Result<()> {
        let mut state = self.state.lock();
        if state.registrations.contains_key(&id) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "watcher already registered",
            ));
        }
        state.registrations.insert(
            id,
            LabRegistration {
                kind,
                interest,
                active: true,
                one_shot: kind == WatcherKind::Timer,
            },
        );
        Ok(())
    }

    fn deregister(&self, id: WatcherId) -> io::Result<()> {
        self.state.lock().registrations.remove(&id);
        Ok(())
    }

    fn is_active(&self, id: WatcherId) -> bool {
        self.state
            .lock()
            .registrations
            .get(&id)
            .is_some_and(|reg| reg.active)
    }

    fn run_iteration(&self, _policy: BlockingPolicy) -> io::Result<Vec<Firing>> {
        let mut state = self.state.lock();
        self.iterations.fetch_add(1, Ordering::SeqCst);

        let mut batch = Self::phase_firings(&state, WatcherKind::Prepare, Revents::PREPARE);

        // Deliver injected events in detection order, dropping those whose
        // registration is gone or inactive.
        let injected: Vec<Firing> = state.injected.drain(..).collect();
        for firing in injected {
            let Some(reg) = state.registrations.get_mut(&firing.id) else {
                continue;
            };
            if !reg.active {
                continue;
            }
            if reg.one_shot || firing.revents.is_error() {
                reg.active = false;
            }
            batch.push(firing);
        }

        batch.extend(Self::phase_firings(&state, WatcherKind::Check, Revents::CHECK));

        self.woken.store(false, Ordering::SeqCst);
        Ok(batch)
    }

    fn wake(&self) {
        self.woken.store(true, Ordering::SeqCst);
    }

    fn after_fork(&self) -> io::Result<()> {
        // Injected-but-undelivered events belong to the parent's tick.
        self.state.lock().injected.clear();
        self.woken.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn child_disposition(&self) -> Option<Disposition> {
        Some(Disposition::new(Self::CHILD_DISPOSITION))
    }
}
