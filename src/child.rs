//! Child-exit signal bookkeeping across loop creation and fork.
//!
//! A reactor that watches child processes installs its own child-exit
//! signal disposition when its default loop is created. An embedding
//! process may have installed one first, and a fork duplicates whatever is
//! installed at that moment. The guard keeps those three parties from
//! clobbering each other:
//!
//! ```text
//! Unmanaged ──default loop created──▶ Pending ──first child watcher──▶ Owned
//!     │                                  ▲                               │
//!     └── (stays Unmanaged on reset) ────┴────────── reset (post-fork) ──┘
//! ```
//!
//! - **Unmanaged**: no default loop, no child watcher; the guard touches
//!   nothing.
//! - **Pending**: a default loop exists. Its creation would have replaced
//!   the embedder's disposition, so the guard snapshots before, records
//!   what the reactor wants, and restores the embedder's disposition
//!   afterwards.
//! - **Owned**: a child watcher was requested, so the reactor's recorded
//!   disposition is applied and is now authoritative.
//!
//! `reset` demotes `Owned` to `Pending` after a fork: the disposition was
//! duplicated into the child process, but ownership must be reacquired, not
//! assumed.
//!
//! Dispositions are opaque snapshots behind [`ChildSignalBackend`]; the
//! in-process [`MemoryDispositions`] backend makes the protocol observable
//! without touching real process signal state.

use std::cell::Cell;

/// Opaque snapshot of a child-exit signal disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disposition(u64);

impl Disposition {
    /// Creates a disposition token.
    #[must_use]
    pub const fn new(token: u64) -> Self {
        Self(token)
    }

    /// Returns the raw token.
    #[must_use]
    pub const fn token(self) -> u64 {
        self.0
    }
}

/// Access to the process's child-exit signal disposition.
///
/// Implementations snapshot and restore opaque [`Disposition`] values. A
/// production backend wraps the platform's signal-action calls; that is a
/// platform shim outside this crate.
pub trait ChildSignalBackend {
    /// Returns the currently-installed disposition.
    fn snapshot(&self) -> Disposition;

    /// Installs a previously-snapshotted disposition.
    fn restore(&self, disposition: &Disposition);
}

/// In-process [`ChildSignalBackend`] modeling dispositions as tokens.
#[derive(Debug)]
pub struct MemoryDispositions {
    current: Cell<u64>,
    restores: Cell<u64>,
}

impl MemoryDispositions {
    /// Creates a backend with disposition token 0 installed.
    #[must_use]
    pub fn new() -> Self {
        Self::with_initial(Disposition::new(0))
    }

    /// Creates a backend with the given disposition installed.
    #[must_use]
    pub fn with_initial(disposition: Disposition) -> Self {
        Self {
            current: Cell::new(disposition.token()),
            restores: Cell::new(0),
        }
    }

    /// Installs a disposition directly, as an embedder or a reactor would.
    pub fn install(&self, disposition: Disposition) {
        self.current.set(disposition.token());
    }

    /// Returns the installed disposition.
    #[must_use]
    pub fn installed(&self) -> Disposition {
        Disposition::new(self.current.get())
    }

    /// Number of restore calls observed.
    #[must_use]
    pub fn restore_count(&self) -> u64 {
        self.restores.get()
    }
}

impl Default for MemoryDispositions {
    fn default() -> Self {
        Self::new()
    }
}

impl ChildSignalBackend for MemoryDispositions {
    fn snapshot(&self) -> Disposition {
        Disposition::new(self.current.get())
    }

    fn restore(&self, disposition: &Disposition) {
        self.current.set(disposition.token());
        self.restores.set(self.restores.get() + 1);
    }
}

/// Ownership state of the child-exit disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildGuardState {
    /// No child-exit watcher was ever installed; nothing is touched.
    Unmanaged,
    /// A default loop exists; the reactor's disposition is recorded but the
    /// embedder's is installed.
    Pending,
    /// The reactor's disposition is installed and authoritative.
    Owned,
}

/// Preserves and restores the child-exit disposition across default-loop
/// creation and fork.
pub struct ChildSignalGuard {
    state: ChildGuardState,
    backend: Box<dyn ChildSignalBackend>,
    /// What the reactor wants installed while it owns child watching.
    reactor_disposition: Option<Disposition>,
    /// Snapshot taken by the last `before_fork` call.
    pre_fork: Option<Disposition>,
}

impl ChildSignalGuard {
    /// Creates a guard in the `Unmanaged` state.
    #[must_use]
    pub fn new(backend: Box<dyn ChildSignalBackend>) -> Self {
        Self {
            state: ChildGuardState::Unmanaged,
            backend,
            reactor_disposition: None,
            pre_fork: None,
        }
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> ChildGuardState {
        self.state
    }

    /// Runs the default-loop creation protocol around `install_reactor`.
    ///
    /// Snapshots the embedder's disposition, lets the closure perform
    /// whatever installation the reactor does at creation (it receives the
    /// backend for that purpose), records the result, then restores the
    /// embedder's disposition. Transitions `Unmanaged → Pending`; in any
    /// other state the closure still runs but the bookkeeping is already
    /// settled and dispositions are untouched.
    pub fn adopt_default_loop<R>(
        &mut self,
        install_reactor: impl FnOnce(&dyn ChildSignalBackend) -> R,
    ) -> R {
        if self.state != ChildGuardState::Unmanaged {
            return install_reactor(self.backend.as_ref());
        }
        let prior = self.backend.snapshot();
        let result = install_reactor(self.backend.as_ref());
        let reactor_disposition = self.backend.snapshot();
        self.backend.restore(&prior);
        self.reactor_disposition = Some(reactor_disposition);
        self.state = ChildGuardState::Pending;
        tracing::debug!(
            prior = prior.token(),
            reactor = reactor_disposition.token(),
            "child-signal guard pending"
        );
        result
    }

    /// Applies the reactor's disposition: called when a caller actually
    /// requests child-exit watching. `Pending → Owned`; a no-op otherwise.
    pub fn install_handler(&mut self) {
        if self.state != ChildGuardState::Pending {
            return;
        }
        if let Some(disposition) = self.reactor_disposition {
            self.backend.restore(&disposition);
        }
        self.state = ChildGuardState::Owned;
        tracing::debug!("child-signal guard owned");
    }

    /// Snapshots the installed disposition ahead of a fork.
    pub fn before_fork(&mut self) {
        self.pre_fork = Some(self.backend.snapshot());
    }

    /// Returns the snapshot taken by the last [`before_fork`](Self::before_fork).
    #[must_use]
    pub fn pre_fork_disposition(&self) -> Option<Disposition> {
        self.pre_fork
    }

    /// Demotes bookkeeping after a fork: the disposition was duplicated,
    /// but ownership must be reacquired. `Owned → Pending`; `Pending`
    /// stays; `Unmanaged` stays and touches nothing.
    pub fn reset(&mut self) {
        if self.state != ChildGuardState::Unmanaged {
            self.state = ChildGuardState::Pending;
        }
    }
}

impl std::fmt::Debug for ChildSignalGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildSignalGuard")
            .field("state", &self.state)
            .field("reactor_disposition", &self.reactor_disposition)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::rc::Rc;

    fn init_test(name: &str) {
        init_test_logging();
        crate::test_phase!(name);
    }

    /// Backend shared between the test and the guard.
    struct SharedBackend(Rc<MemoryDispositions>);

    impl ChildSignalBackend for SharedBackend {
        fn snapshot(&self) -> Disposition {
            self.0.snapshot()
        }
        fn restore(&self, disposition: &Disposition) {
            self.0.restore(disposition);
        }
    }

    fn guard_with_backend() -> (ChildSignalGuard, Rc<MemoryDispositions>) {
        let backend = Rc::new(MemoryDispositions::with_initial(Disposition::new(7)));
        let guard = ChildSignalGuard::new(Box::new(SharedBackend(Rc::clone(&backend))));
        (guard, backend)
    }

    #[test]
    fn default_loop_restores_embedder_disposition() {
        init_test("default_loop_restores_embedder_disposition");
        let (mut guard, backend) = guard_with_backend();

        guard.adopt_default_loop(|b| {
            // The reactor installs its own disposition at creation.
            b.restore(&Disposition::new(42));
        });

        crate::assert_with_log!(
            guard.state() == ChildGuardState::Pending,
            "pending",
            ChildGuardState::Pending,
            guard.state()
        );
        // The embedder's disposition is back in place...
        crate::assert_with_log!(
            backend.installed() == Disposition::new(7),
            "embedder restored",
            Disposition::new(7),
            backend.installed()
        );

        // ...until child watching is requested.
        guard.install_handler();
        crate::assert_with_log!(
            guard.state() == ChildGuardState::Owned,
            "owned",
            ChildGuardState::Owned,
            guard.state()
        );
        crate::assert_with_log!(
            backend.installed() == Disposition::new(42),
            "reactor disposition applied",
            Disposition::new(42),
            backend.installed()
        );
        crate::test_complete!("default_loop_restores_embedder_disposition");
    }

    #[test]
    fn second_default_loop_is_a_plain_passthrough() {
        init_test("second_default_loop_is_a_plain_passthrough");
        let (mut guard, backend) = guard_with_backend();
        guard.adopt_default_loop(|b| b.restore(&Disposition::new(42)));
        let restores_before = backend.restore_count();

        // Re-creating the default loop after the first adoption must not
        // re-run the snapshot/restore dance.
        guard.adopt_default_loop(|_| ());
        crate::assert_with_log!(
            backend.restore_count() == restores_before,
            "no extra restores",
            restores_before,
            backend.restore_count()
        );
        crate::assert_with_log!(
            guard.state() == ChildGuardState::Pending,
            "still pending",
            ChildGuardState::Pending,
            guard.state()
        );
        crate::test_complete!("second_default_loop_is_a_plain_passthrough");
    }

    #[test]
    fn install_handler_requires_pending() {
        init_test("install_handler_requires_pending");
        let (mut guard, backend) = guard_with_backend();
        guard.install_handler();
        crate::assert_with_log!(
            guard.state() == ChildGuardState::Unmanaged,
            "unmanaged untouched",
            ChildGuardState::Unmanaged,
            guard.state()
        );
        crate::assert_with_log!(
            backend.restore_count() == 0,
            "no restores",
            0u64,
            backend.restore_count()
        );
        crate::test_complete!("install_handler_requires_pending");
    }

    #[test]
    fn fork_cycle_without_child_watching_touches_nothing() {
        init_test("fork_cycle_without_child_watching_touches_nothing");
        let (mut guard, backend) = guard_with_backend();
        guard.before_fork();
        guard.reset();
        crate::assert_with_log!(
            guard.state() == ChildGuardState::Unmanaged,
            "stays unmanaged",
            ChildGuardState::Unmanaged,
            guard.state()
        );
        crate::assert_with_log!(
            backend.restore_count() == 0,
            "disposition untouched",
            0u64,
            backend.restore_count()
        );
        crate::assert_with_log!(
            guard.pre_fork_disposition() == Some(Disposition::new(7)),
            "snapshot recorded",
            Some(Disposition::new(7)),
            guard.pre_fork_disposition()
        );
        crate::test_complete!("fork_cycle_without_child_watching_touches_nothing");
    }

    #[test]
    fn reset_demotes_owned_to_pending() {
        init_test("reset_demotes_owned_to_pending");
        let (mut guard, backend) = guard_with_backend();
        guard.adopt_default_loop(|b| b.restore(&Disposition::new(42)));
        guard.install_handler();
        guard.reset();
        crate::assert_with_log!(
            guard.state() == ChildGuardState::Pending,
            "demoted",
            ChildGuardState::Pending,
            guard.state()
        );
        // Ownership can be reacquired.
        guard.install_handler();
        crate::assert_with_log!(
            guard.state() == ChildGuardState::Owned,
            "reacquired",
            ChildGuardState::Owned,
            guard.state()
        );
        crate::test_complete!("reset_demotes_owned_to_pending");
    }
}
