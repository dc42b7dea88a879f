//! # Ready Set
//!
//! Two-level priority bitmap of EPAs with pending events. Priorities are
//! split into groups of 32; each group has a word with one bit per
//! priority, and a top word has one bit per non-empty group:
//!
//! ```text
//!   top:      ........ ........ ........ ......1.   (group 1 non-empty)
//!   group[1]: ........ ........ ...1.... ........   (priority 32 + 12 = 44)
//! ```
//!
//! Insert, remove and highest-priority lookup are all O(1). Larger
//! priority numbers are more urgent, so lookup uses find-last-set, which
//! `leading_zeros` lowers to a single CLZ on Cortex-M4.

use crate::config::MAX_EPA;
use crate::contract::require;
use crate::epa::Priority;

const GROUPS: usize = MAX_EPA / 32;

/// Index of the most significant set bit. `word` must be non-zero.
#[inline]
pub fn find_highest_set_bit(word: u32) -> u32 {
    31 - word.leading_zeros()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadySet {
    top: u32,
    groups: [u32; GROUPS],
}

impl ReadySet {
    pub const fn new() -> Self {
        Self {
            top: 0,
            groups: [0; GROUPS],
        }
    }

    #[inline]
    fn locate(p: Priority) -> (usize, u32) {
        let p = p as usize;
        require!(p < MAX_EPA, "priority out of range");
        (p / 32 % GROUPS, 1 << (p % 32))
    }

    pub fn insert(&mut self, p: Priority) {
        let (g, bit) = Self::locate(p);
        self.groups[g] |= bit;
        self.top |= 1 << g;
    }

    pub fn remove(&mut self, p: Priority) {
        let (g, bit) = Self::locate(p);
        self.groups[g] &= !bit;
        if self.groups[g] == 0 {
            self.top &= !(1 << g);
        }
    }

    pub fn contains(&self, p: Priority) -> bool {
        let (g, bit) = Self::locate(p);
        self.groups[g] & bit != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top == 0
    }

    /// Most urgent ready priority, if any.
    pub fn highest(&self) -> Option<Priority> {
        if self.top == 0 {
            return None;
        }
        let g = find_highest_set_bit(self.top);
        let b = find_highest_set_bit(self.groups[g as usize]);
        Some((g * 32 + b) as Priority)
    }
}

impl Default for ReadySet {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_find_highest_set_bit() {
        assert_eq!(find_highest_set_bit(1), 0);
        assert_eq!(find_highest_set_bit(0b1011_0000), 7);
        assert_eq!(find_highest_set_bit(u32::MAX), 31);
    }

    #[test]
    fn test_empty_set() {
        let set = ReadySet::new();
        assert!(set.is_empty());
        assert_eq!(set.highest(), None);
    }

    #[test]
    fn test_highest_across_groups() {
        let mut set = ReadySet::new();
        set.insert(3);
        set.insert(40);
        set.insert(31);
        assert_eq!(set.highest(), Some(40));
        set.remove(40);
        assert_eq!(set.highest(), Some(31));
        set.remove(31);
        assert_eq!(set.highest(), Some(3));
        set.remove(3);
        assert!(set.is_empty());
    }

    #[test]
    fn test_group_bit_cleared_only_when_group_empties() {
        let mut set = ReadySet::new();
        set.insert(33);
        set.insert(34);
        set.remove(33);
        assert!(!set.is_empty());
        assert!(set.contains(34));
        assert!(!set.contains(33));
        set.remove(34);
        assert!(set.is_empty());
    }

    #[test]
    fn test_priority_zero_is_valid() {
        let mut set = ReadySet::new();
        set.insert(0);
        assert_eq!(set.highest(), Some(0));
    }

    #[test]
    #[should_panic(expected = "priority out of range")]
    fn test_out_of_range_priority() {
        let mut set = ReadySet::new();
        set.insert(MAX_EPA as Priority);
    }

    proptest! {
        #[test]
        fn highest_matches_model(
            ops in proptest::collection::vec((any::<bool>(), 0u8..64), 0..200),
        ) {
            let mut set = ReadySet::new();
            let mut model = BTreeSet::new();
            for (mark, p) in ops {
                if mark {
                    set.insert(p);
                    model.insert(p);
                } else {
                    set.remove(p);
                    model.remove(&p);
                }
                prop_assert_eq!(set.highest(), model.iter().next_back().copied());
                prop_assert_eq!(set.is_empty(), model.is_empty());
            }
            for p in 0u8..64 {
                set.remove(p);
            }
            prop_assert_eq!(set.highest(), None);
            prop_assert!(set.is_empty());
        }
    }
}
