//! Watcher records, the table that owns them, and user-facing handles.
//!
//! Every observed event source is one **watcher**: a tagged record holding
//! its kind, lifecycle state (`active`/`pending`), callback slot, and
//! argument bundle. All records live in the owning loop's [`WatcherTable`],
//! a generational slab — the table, not the handle, keeps a started watcher
//! alive, so the common pattern of starting a watcher and immediately
//! dropping the handle keeps firing.
//!
//! # Identity
//!
//! A [`WatcherId`] is a slab index plus a generation counter. Stale ids
//! (slot reused after the record was released) fail to resolve instead of
//! reaching the wrong record, which is what lets the dispatcher answer
//! "already dead" for events that outlive their watcher.
//!
//! # Lifecycle
//!
//! ```text
//! IDLE ──start──▶ ACTIVE ──fire──▶ PENDING ──dispatch──▶ ACTIVE
//!   ▲                │                                      │
//!   └────── stop ────┴───── stop / auto-stop ───────────────┘
//! ```
//!
//! `stop` is always legal — including from inside the watcher's own
//! callback — and releases the callback and argument bundle.

mod args;

pub use args::{Arg, CallbackArgs, DeferredCallback, WatcherCallback};

use crate::error::{CallbackError, Result};
use crate::event_loop::LoopShared;
use crate::reactor::Revents;
use std::rc::{Rc, Weak};

/// The kind of event source a watcher observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatcherKind {
    /// File descriptor readiness.
    Io,
    /// Timer expiry.
    Timer,
    /// Signal delivery.
    Signal,
    /// Idle phase (fires when the loop has nothing else to do).
    Idle,
    /// Prepare phase (fires just before the blocking wait).
    Prepare,
    /// Check phase (fires just after the blocking wait).
    Check,
    /// Cross-thread async wakeup.
    Async,
    /// Child process exit.
    Child,
    /// Filesystem change.
    Fs,
}

impl WatcherKind {
    /// Returns true for the I/O class, which the dispatcher force-stops on
    /// callback error.
    #[must_use]
    pub const fn is_io(self) -> bool {
        matches!(self, Self::Io)
    }

    /// The event bitmask naturally reported for this kind.
    ///
    /// I/O watchers have no natural mask; their interest is explicit.
    #[must_use]
    pub const fn natural_revents(self) -> Revents {
        match self {
            Self::Io => Revents::NONE,
            Self::Timer => Revents::TIMER,
            Self::Signal => Revents::SIGNAL,
            Self::Idle => Revents::IDLE,
            Self::Prepare => Revents::PREPARE,
            Self::Check => Revents::CHECK,
            Self::Async => Revents::ASYNC,
            Self::Child => Revents::CHILD,
            Self::Fs => Revents::FS,
        }
    }

    /// Short name for logging.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Io => "io",
            Self::Timer => "timer",
            Self::Signal => "signal",
            Self::Idle => "idle",
            Self::Prepare => "prepare",
            Self::Check => "check",
            Self::Async => "async",
            Self::Child => "child",
            Self::Fs => "fs",
        }
    }
}

/// Identifier of a watcher record: slab index plus generation.
///
/// The generation catches stale ids after a slot is released and reused, so
/// an event raced against watcher teardown resolves to "dead" rather than a
/// different watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatcherId {
    index: u32,
    generation: u32,
}

impl WatcherId {
    /// An id that never resolves.
    pub const INVALID: WatcherId = WatcherId {
        index: u32::MAX,
        generation: u32::MAX,
    };

    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Returns the slab index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Returns the generation counter.
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Packs the id into a single integer (generation in the upper bits),
    /// for embedders that carry watcher identity through a native reactor.
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        ((self.generation as u64) << 32) | (self.index as u64)
    }

    /// Unpacks an id produced by [`to_raw`](Self::to_raw).
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

/// One watcher record. Owned by the table; never handed out by reference
/// across a callback invocation.
pub(crate) struct WatcherSlot {
    pub(crate) kind: WatcherKind,
    pub(crate) interest: Revents,
    pub(crate) active: bool,
    pub(crate) pending: bool,
    /// Loop-owned auxiliary watcher: excluded from the keepalive count and
    /// special-cased by the dispatcher.
    pub(crate) internal: bool,
    /// No live handle refers to this record; release the slot at next stop.
    pub(crate) orphaned: bool,
    pub(crate) callback: Option<WatcherCallback>,
    pub(crate) args: CallbackArgs,
}

impl WatcherSlot {
    pub(crate) fn new(kind: WatcherKind, interest: Revents, internal: bool) -> Self {
        Self {
            kind,
            interest,
            active: false,
            pending: false,
            internal,
            orphaned: false,
            callback: None,
            args: CallbackArgs::new(),
        }
    }
}

enum TableEntry {
    Occupied { generation: u32, slot: WatcherSlot },
    Vacant { generation: u32, next_free: u32 },
}

const FREE_LIST_END: u32 = u32::MAX;

/// Generational slab owning every watcher record of one loop.
///
/// O(1) insert, resolve, and remove; a free list recycles slots and the
/// per-slot generation invalidates ids for released records.
pub(crate) struct WatcherTable {
    entries: Vec<TableEntry>,
    free_head: u32,
    occupied: usize,
    /// Count of active non-internal watchers; drives `EventLoop::run`.
    active_user: usize,
}

impl WatcherTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_head: FREE_LIST_END,
            occupied: 0,
            active_user: 0,
        }
    }

    pub(crate) fn insert(&mut self, slot: WatcherSlot) -> WatcherId {
        self.occupied += 1;
        if self.free_head != FREE_LIST_END {
            let index = self.free_head as usize;
            let generation = match self.entries[index] {
                TableEntry::Vacant {
                    generation,
                    next_free,
                } => {
                    self.free_head = next_free;
                    generation
                }
                TableEntry::Occupied { .. } => unreachable!("free list points at occupied slot"),
            };
            self.entries[index] = TableEntry::Occupied { generation, slot };
            WatcherId::new(index as u32, generation)
        } else {
            let index = self.entries.len() as u32;
            self.entries.push(TableEntry::Occupied {
                generation: 0,
                slot,
            });
            WatcherId::new(index, 0)
        }
    }

    pub(crate) fn get(&self, id: WatcherId) -> Option<&WatcherSlot> {
        match self.entries.get(id.index() as usize) {
            Some(TableEntry::Occupied { generation, slot }) if *generation == id.generation() => {
                Some(slot)
            }
            _ => None,
        }
    }

    pub(crate) fn get_mut(&mut self, id: WatcherId) -> Option<&mut WatcherSlot> {
        match self.entries.get_mut(id.index() as usize) {
            Some(TableEntry::Occupied { generation, slot }) if *generation == id.generation() => {
                Some(slot)
            }
            _ => None,
        }
    }

    /// Releases the record, bumping the slot generation so the id (and any
    /// copies of it still in flight) stops resolving.
    pub(crate) fn remove(&mut self, id: WatcherId) -> Option<WatcherSlot> {
        let index = id.index() as usize;
        let resolves = matches!(
            self.entries.get(index),
            Some(TableEntry::Occupied { generation, .. }) if *generation == id.generation()
        );
        if !resolves {
            return None;
        }
        let entry = std::mem::replace(
            &mut self.entries[index],
            TableEntry::Vacant {
                generation: id.generation().wrapping_add(1),
                next_free: self.free_head,
            },
        );
        self.free_head = index as u32;
        self.occupied -= 1;
        match entry {
            TableEntry::Occupied { slot, .. } => {
                if slot.active && !slot.internal {
                    self.active_user -= 1;
                }
                Some(slot)
            }
            TableEntry::Vacant { .. } => unreachable!("entry was occupied"),
        }
    }

    /// Flips `active`, keeping the keepalive count in sync. Returns true if
    /// the flag changed.
    pub(crate) fn set_active(&mut self, id: WatcherId, active: bool) -> bool {
        let Some(slot) = self.get_mut(id) else {
            return false;
        };
        if slot.active == active {
            return false;
        }
        slot.active = active;
        let internal = slot.internal;
        if !internal {
            if active {
                self.active_user += 1;
            } else {
                self.active_user -= 1;
            }
        }
        true
    }

    pub(crate) fn active_user_count(&self) -> usize {
        self.active_user
    }

    pub(crate) fn len(&self) -> usize {
        self.occupied
    }
}

struct HandleCore {
    id: WatcherId,
    kind: WatcherKind,
    owner: Weak<LoopShared>,
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        if let Some(shared) = self.owner.upgrade() {
            shared.release_handle(self.id);
        }
    }
}

/// Cloneable handle to a watcher owned by an event loop.
///
/// The handle does **not** keep the watcher running — a started watcher
/// stays alive in the loop's table until stopped, even with no handles left.
/// Dropping the last handle of a *stopped* watcher releases the record;
/// dropping it while active marks the record for release at the next stop.
///
/// All methods are soft against teardown: once the owning loop is gone,
/// operations fail with [`BridgeError::LoopGone`](crate::BridgeError) or
/// report inert state.
pub struct WatcherHandle {
    core: Rc<HandleCore>,
}

impl Clone for WatcherHandle {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

impl WatcherHandle {
    pub(crate) fn new(id: WatcherId, kind: WatcherKind, owner: Weak<LoopShared>) -> Self {
        Self {
            core: Rc::new(HandleCore { id, kind, owner }),
        }
    }

    /// Returns the watcher's id.
    #[must_use]
    pub fn id(&self) -> WatcherId {
        self.core.id
    }

    /// Returns the watcher's kind.
    #[must_use]
    pub fn kind(&self) -> WatcherKind {
        self.core.kind
    }

    /// Starts observing: installs the callback and argument bundle and
    /// registers the event source with the reactor.
    ///
    /// Idempotent while active — a second `start` keeps the installed
    /// callback and arguments.
    ///
    /// # Errors
    ///
    /// [`BridgeError::LoopGone`](crate::BridgeError) if the owning loop was
    /// dropped, [`BridgeError::WatcherClosed`](crate::BridgeError) if the
    /// record was released, or
    /// [`BridgeError::Reactor`](crate::BridgeError) if registration fails
    /// (the callback is not installed in that case).
    pub fn start<F>(&self, callback: F, args: CallbackArgs) -> Result<()>
    where
        F: FnMut(&CallbackArgs) -> std::result::Result<(), CallbackError> + 'static,
    {
        let shared = self.core.owner.upgrade().ok_or(crate::BridgeError::LoopGone)?;
        shared.start_watcher(self.core.id, Box::new(callback), args)
    }

    /// Stops observing: deregisters from the reactor and releases the
    /// callback and argument bundle.
    ///
    /// Always legal — on a never-started watcher, from inside the watcher's
    /// own callback, or after the loop is gone — and idempotent.
    pub fn stop(&self) {
        if let Some(shared) = self.core.owner.upgrade() {
            shared.stop_watcher(self.core.id);
        }
    }

    /// Returns true if the watcher is started.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.with_slot(|slot| slot.active).unwrap_or(false)
    }

    /// Returns true if an event fired but its callback has not begun.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.with_slot(|slot| slot.pending).unwrap_or(false)
    }

    /// Returns true if the record still resolves (loop alive, slot not
    /// released).
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.with_slot(|_| true).unwrap_or(false)
    }

    fn with_slot<T>(&self, f: impl FnOnce(&WatcherSlot) -> T) -> Option<T> {
        let shared = self.core.owner.upgrade()?;
        let table = shared.watchers.borrow();
        table.get(self.core.id).map(f)
    }
}

impl std::fmt::Debug for WatcherHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatcherHandle")
            .field("id", &self.core.id)
            .field("kind", &self.core.kind)
            .field("active", &self.is_active())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
