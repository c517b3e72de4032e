//! Pulse selection flags.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Selects which parts of a pulse an operation touches.
///
/// Flags combine with `|`:
///
/// ```rust
/// use pulseflow_core::pulse::Flags;
///
/// let flags = Flags::ADD | Flags::SOURCE;
/// assert!(flags.contains(Flags::ADD));
/// assert!(!flags.contains(Flags::REM));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    /// Added tuples.
    pub const ADD: Flags = Flags(1 << 0);
    /// Removed tuples.
    pub const REM: Flags = Flags(1 << 1);
    /// Modified tuples.
    pub const MOD: Flags = Flags(1 << 2);
    pub const ADD_REM: Flags = Flags(Self::ADD.0 | Self::REM.0);
    pub const ADD_MOD: Flags = Flags(Self::ADD.0 | Self::MOD.0);
    /// Added, removed and modified tuples.
    pub const ALL: Flags = Flags(Self::ADD.0 | Self::REM.0 | Self::MOD.0);
    /// Source tuples that are neither added, removed nor modified.
    pub const REFLOW: Flags = Flags(1 << 3);
    /// The full materialized source set.
    pub const SOURCE: Flags = Flags(1 << 4);
    /// On fork: drop the source reference.
    pub const NO_SOURCE: Flags = Flags(1 << 5);
    /// On fork: drop the modified-field set.
    pub const NO_FIELDS: Flags = Flags(1 << 6);

    /// Whether every bit of `other` is set.
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any bit of `other` is set.
    pub const fn intersects(self, other: Flags) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: Flags) -> Flags {
        Flags(self.0 | other.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        self.union(rhs)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Flags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(Flags, &str); 7] = [
            (Flags::ADD, "ADD"),
            (Flags::REM, "REM"),
            (Flags::MOD, "MOD"),
            (Flags::REFLOW, "REFLOW"),
            (Flags::SOURCE, "SOURCE"),
            (Flags::NO_SOURCE, "NO_SOURCE"),
            (Flags::NO_FIELDS, "NO_FIELDS"),
        ];
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        f.write_str(&names.join(" | "))
    }
}
