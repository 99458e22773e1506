//! Argument bundles passed to watcher callbacks.
//!
//! A watcher carries an ordered bundle of values that is handed to its
//! callback on every dispatch. By convention, when the first slot is the
//! [`Arg::Events`] sentinel, the dispatcher substitutes the fired event
//! bitmask into that slot for the invocation — the stored bundle keeps the
//! sentinel, so the substitution repeats on every fire. This lets a callback
//! opt into receiving the bitmask without changing its declared shape.

use crate::error::CallbackError;
use crate::reactor::Revents;
use smallvec::SmallVec;

/// One value in a callback argument bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    /// Sentinel: replaced by the fired event bitmask at dispatch time.
    Events,
    /// A substituted event bitmask (what [`Arg::Events`] becomes).
    Revents(Revents),
    /// An integer value.
    Int(i64),
    /// A file descriptor.
    Fd(i32),
    /// A text value.
    Text(String),
}

/// Ordered argument bundle for a watcher callback. May be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackArgs {
    values: SmallVec<[Arg; 4]>,
}

impl CallbackArgs {
    /// Creates an empty bundle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a bundle whose first slot is the events sentinel.
    #[must_use]
    pub fn with_events() -> Self {
        let mut args = Self::new();
        args.push(Arg::Events);
        args
    }

    /// Appends a value.
    pub fn push(&mut self, value: Arg) {
        self.values.push(value);
    }

    /// Appends a value, builder style.
    #[must_use]
    pub fn and(mut self, value: Arg) -> Self {
        self.push(value);
        self
    }

    /// Returns the value at `index`, if present.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Arg> {
        self.values.get(index)
    }

    /// Returns the number of values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the bundle is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Removes every value.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Iterates over the values in order.
    pub fn iter(&self) -> std::slice::Iter<'_, Arg> {
        self.values.iter()
    }

    /// Returns the bundle as invoked for `revents`: if the first slot is the
    /// [`Arg::Events`] sentinel it is replaced by `Arg::Revents(revents)`,
    /// otherwise the bundle is returned unchanged.
    #[must_use]
    pub fn substituted(&self, revents: Revents) -> CallbackArgs {
        let mut invoked = self.clone();
        if matches!(invoked.values.first(), Some(Arg::Events)) {
            invoked.values[0] = Arg::Revents(revents);
        }
        invoked
    }
}

impl FromIterator<Arg> for CallbackArgs {
    fn from_iter<I: IntoIterator<Item = Arg>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a CallbackArgs {
    type Item = &'a Arg;
    type IntoIter = std::slice::Iter<'a, Arg>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Callback invoked when a watcher fires.
///
/// Runs on the loop thread; failure is reported by returning `Err`, which
/// the dispatcher routes to the error sink. Stopping the watcher (or any
/// other watcher) from inside the callback is legal.
pub type WatcherCallback = Box<dyn FnMut(&CallbackArgs) -> Result<(), CallbackError>>;

/// One-shot callback executed by the deferred queue's drain hook.
///
/// `Send` because deferred entries may be produced from foreign threads or
/// signal-handler-like contexts.
pub type DeferredCallback = Box<dyn FnOnce(&CallbackArgs) -> Result<(), CallbackError> + Send>;
