//! Event bitmask describing which condition(s) fired for a watcher.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Bitmask of fired (or watched-for) event conditions.
///
/// Every dispatch carries one of these: the reactor reports *what* fired,
/// and a callback whose argument bundle leads with the events sentinel
/// receives it in slot 0.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Revents(u16);

impl Revents {
    /// No conditions.
    pub const NONE: Revents = Revents(0);
    /// File descriptor readable.
    pub const READ: Revents = Revents(1 << 0);
    /// File descriptor writable.
    pub const WRITE: Revents = Revents(1 << 1);
    /// Timer expired.
    pub const TIMER: Revents = Revents(1 << 2);
    /// Signal delivered.
    pub const SIGNAL: Revents = Revents(1 << 3);
    /// Idle phase reached.
    pub const IDLE: Revents = Revents(1 << 4);
    /// Prepare phase (just before the blocking wait).
    pub const PREPARE: Revents = Revents(1 << 5);
    /// Check phase (just after the blocking wait).
    pub const CHECK: Revents = Revents(1 << 6);
    /// Cross-thread async wakeup.
    pub const ASYNC: Revents = Revents(1 << 7);
    /// Child process exited.
    pub const CHILD: Revents = Revents(1 << 8);
    /// Filesystem change observed.
    pub const FS: Revents = Revents(1 << 9);
    /// Reactor-detected error condition on the event source.
    pub const ERROR: Revents = Revents(1 << 10);

    /// Returns true if no bits are set.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns true if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Revents) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if any bit of `other` is set in `self`.
    #[must_use]
    pub const fn intersects(self, other: Revents) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if the readable bit is set.
    #[must_use]
    pub const fn is_read(self) -> bool {
        self.contains(Self::READ)
    }

    /// Returns true if the writable bit is set.
    #[must_use]
    pub const fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Returns true if the error bit is set.
    #[must_use]
    pub const fn is_error(self) -> bool {
        self.contains(Self::ERROR)
    }

    /// Combines two masks.
    #[must_use]
    pub const fn union(self, other: Revents) -> Self {
        Revents(self.0 | other.0)
    }

    /// Removes the bits of `other`.
    #[must_use]
    pub const fn difference(self, other: Revents) -> Self {
        Revents(self.0 & !other.0)
    }

    /// Returns the raw bit representation.
    #[must_use]
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Builds a mask from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u16) -> Self {
        Revents(bits)
    }
}

impl BitOr for Revents {
    type Output = Revents;

    fn bitor(self, rhs: Revents) -> Revents {
        self.union(rhs)
    }
}

impl BitOrAssign for Revents {
    fn bitor_assign(&mut self, rhs: Revents) {
        *self = self.union(rhs);
    }
}

impl fmt::Debug for Revents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Revents, &str); 11] = [
            (Revents::READ, "READ"),
            (Revents::WRITE, "WRITE"),
            (Revents::TIMER, "TIMER"),
            (Revents::SIGNAL, "SIGNAL"),
            (Revents::IDLE, "IDLE"),
            (Revents::PREPARE, "PREPARE"),
            (Revents::CHECK, "CHECK"),
            (Revents::ASYNC, "ASYNC"),
            (Revents::CHILD, "CHILD"),
            (Revents::FS, "FS"),
            (Revents::ERROR, "ERROR"),
        ];
        if self.is_empty() {
            return write!(f, "Revents(NONE)");
        }
        write!(f, "Revents(")?;
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "|")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        write!(f, ")")
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
    fn contains_and_intersects() {
        init_test("contains_and_intersects");
        let mask = Revents::READ | Revents::WRITE;
        crate::assert_with_log!(
            mask.contains(Revents::READ),
            "contains read",
            true,
            mask.contains(Revents::READ)
        );
        crate::assert_with_log!(
            !mask.contains(Revents::READ | Revents::TIMER),
            "partial contains is false",
            false,
            mask.contains(Revents::READ | Revents::TIMER)
        );
        crate::assert_with_log!(
            mask.intersects(Revents::READ | Revents::TIMER),
            "intersects",
            true,
            mask.intersects(Revents::READ | Revents::TIMER)
        );
        crate::test_complete!("contains_and_intersects");
    }

    #[test]
    fn difference_removes_bits() {
        init_test("difference_removes_bits");
        let mask = (Revents::READ | Revents::WRITE).difference(Revents::WRITE);
        crate::assert_with_log!(mask == Revents::READ, "read remains", Revents::READ, mask);
        crate::test_complete!("difference_removes_bits");
    }

    #[test]
    fn debug_names_flags() {
        init_test("debug_names_flags");
        let text = format!("{:?}", Revents::READ | Revents::ERROR);
        crate::assert_with_log!(
            text.contains("READ") && text.contains("ERROR"),
            "debug names",
            true,
            text
        );
        let none = format!("{:?}", Revents::NONE);
        crate::assert_with_log!(none.contains("NONE"), "none named", true, none);
        crate::test_complete!("debug_names_flags");
    }

    #[test]
    fn bits_round_trip() {
        init_test("bits_round_trip");
        let mask = Revents::TIMER | Revents::CHILD;
        let back = Revents::from_bits(mask.bits());
        crate::assert_with_log!(back == mask, "round trip", mask, back);
        crate::test_complete!("bits_round_trip");
    }
}
