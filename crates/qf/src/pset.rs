//! Priority sets.
//!
//! A [`PrioSet`] holds priorities `1..=MAX_ACTIVE` in a single `u64`, giving
//! O(1) insert, remove and highest-member lookup. The kernel uses one as its
//! ready set and one per published signal as the subscriber list.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::MAX_ACTIVE;

const MODULE: &str = "qf_pset";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PrioSet {
    bits: u64,
}

impl PrioSet {
    pub const fn new() -> Self {
        Self { bits: 0 }
    }

    pub fn insert(&mut self, prio: u8) {
        Self::check(prio);
        self.bits |= 1u64 << prio;
    }

    pub fn remove(&mut self, prio: u8) {
        Self::check(prio);
        self.bits &= !(1u64 << prio);
    }

    pub fn contains(&self, prio: u8) -> bool {
        Self::check(prio);
        (self.bits & (1u64 << prio)) != 0
    }

    /// Highest priority in the set.
    pub fn find_max(&self) -> Option<u8> {
        if self.bits == 0 {
            None
        } else {
            Some(63 - self.bits.leading_zeros() as u8)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    pub fn clear(&mut self) {
        self.bits = 0;
    }

    /// Members from the highest priority down.
    pub fn iter_desc(&self) -> impl Iterator<Item = u8> {
        let mut rest = *self;
        core::iter::from_fn(move || {
            let prio = rest.find_max()?;
            rest.remove(prio);
            Some(prio)
        })
    }

    fn check(prio: u8) {
        q_require!(100, (1..=MAX_ACTIVE).contains(&prio));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeSet;

    #[test]
    fn find_max_tracks_highest() {
        let mut set = PrioSet::new();
        assert_eq!(set.find_max(), None);
        set.insert(3);
        set.insert(63);
        set.insert(17);
        assert_eq!(set.find_max(), Some(63));
        set.remove(63);
        assert_eq!(set.find_max(), Some(17));
        assert_eq!(set.iter_desc().collect::<Vec<_>>(), vec![17, 3]);
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    #[should_panic(expected = "qf_pset:100")]
    fn idle_priority_is_rejected() {
        PrioSet::new().insert(0);
    }

    #[test]
    #[should_panic(expected = "qf_pset:100")]
    fn priority_above_range_is_rejected() {
        PrioSet::new().insert(64);
    }

    /// Interprets `bytecode` as insert/remove commands and compares the set
    /// against a `BTreeSet` after every step.
    #[quickcheck]
    fn matches_reference_model(bytecode: Vec<u8>) {
        let _ = env_logger::try_init();

        let mut subject = PrioSet::new();
        let mut reference = BTreeSet::new();

        for cmd in bytecode {
            let prio = cmd % MAX_ACTIVE + 1;
            if cmd & 0x80 == 0 {
                log::trace!("insert {prio}");
                subject.insert(prio);
                reference.insert(prio);
            } else {
                log::trace!("remove {prio}");
                subject.remove(prio);
                reference.remove(&prio);
            }

            assert_eq!(subject.find_max(), reference.iter().next_back().copied());
            assert_eq!(subject.len(), reference.len());
            assert!(reference.iter().all(|&p| subject.contains(p)));
        }

        assert_eq!(
            subject.iter_desc().collect::<Vec<_>>(),
            reference.iter().rev().copied().collect::<Vec<_>>()
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn plain_data_types_are_serializable() {
        fn serializable<T: Serialize + serde::de::DeserializeOwned>() {}
        serializable::<PrioSet>();
        serializable::<crate::Signal>();
        serializable::<crate::QueueStats>();
    }
}
