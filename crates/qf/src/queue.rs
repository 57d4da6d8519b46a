//! Bounded event queues.
//!
//! An [`EventQueue`] keeps the next event to be processed in a dedicated
//! front slot and the remaining ones in a ring buffer, so a queue created
//! with length `len` holds up to `len + 1` events. The queue itself is a
//! plain data structure: the owner places it inside a critical-section
//! cell, and every mutation happens with a [`CriticalSection`] token in
//! hand so the reference counters of posted events stay consistent.
//!
//! The same type serves as an active object's built-in queue and as a
//! private queue for deferred events.

use critical_section::CriticalSection;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::event::EventRef;

const MODULE: &str = "qf_eq";

/// How many free slots a post must leave behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Margin {
    /// The post must succeed; a full queue is a fatal configuration error.
    Guaranteed,
    /// The post succeeds only if more than this many slots are free before
    /// insertion. Otherwise it is rejected and the caller decides what to do.
    Slots(u16),
}

/// Snapshot of queue occupancy.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: u16,
    pub free: u16,
    /// Low-water mark of `free` since the queue was created.
    pub min_free: u16,
}

pub struct EventQueue {
    front: Option<EventRef>,
    ring: Box<[Option<EventRef>]>,
    head: usize,
    tail: usize,
    n_free: u16,
    n_min: u16,
}

impl EventQueue {
    /// Creates a queue with a ring of `len` entries.
    pub fn new(len: u16) -> Self {
        q_require!(100, len < u16::MAX);
        Self {
            front: None,
            ring: (0..len).map(|_| None).collect(),
            head: 0,
            tail: 0,
            n_free: len + 1,
            n_min: len + 1,
        }
    }

    /// FIFO insert.
    ///
    /// Returns `false` when `margin` cannot be honored; the event is then
    /// left untouched. A [`Margin::Guaranteed`] post into a full queue is
    /// fatal.
    pub fn post(&mut self, cs: CriticalSection<'_>, event: &EventRef, margin: Margin) -> bool {
        let accepted = match margin {
            Margin::Guaranteed => {
                q_assert!(110, self.n_free > 0);
                true
            }
            Margin::Slots(margin) => self.n_free > margin,
        };
        if !accepted {
            return false;
        }

        event.inc_ref(cs);
        self.take_slot();

        if self.front.is_none() {
            self.front = Some(event.clone());
        } else {
            self.ring[self.head] = Some(event.clone());
            self.head = self.next_index(self.head);
        }
        true
    }

    /// LIFO insert: `event` becomes the next one returned by [`get`].
    ///
    /// [`get`]: EventQueue::get
    pub fn post_lifo(&mut self, cs: CriticalSection<'_>, event: &EventRef) {
        q_require!(200, self.n_free != 0);

        event.inc_ref(cs);
        self.take_slot();

        if let Some(previous) = self.front.take() {
            self.tail = self.prev_index(self.tail);
            self.ring[self.tail] = Some(previous);
        }
        self.front = Some(event.clone());
    }

    /// Removes the head event. The caller becomes responsible for the
    /// reference the queue held.
    pub fn get(&mut self) -> Option<EventRef> {
        let event = self.front.take()?;
        self.n_free += 1;

        if usize::from(self.n_free) <= self.ring.len() {
            let next = self.ring[self.tail].take();
            q_assert!(310, next.is_some());
            self.front = next;
            self.tail = self.next_index(self.tail);
        }
        Some(event)
    }

    /// Removes every queued event, oldest first.
    pub fn drain(&mut self) -> Vec<EventRef> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(event) = self.get() {
            drained.push(event);
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.front.is_none()
    }

    pub fn len(&self) -> usize {
        usize::from(self.capacity() - self.n_free)
    }

    pub fn capacity(&self) -> u16 {
        self.ring.len() as u16 + 1
    }

    pub fn n_free(&self) -> u16 {
        self.n_free
    }

    pub fn n_min(&self) -> u16 {
        self.n_min
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity(),
            free: self.n_free,
            min_free: self.n_min,
        }
    }

    fn take_slot(&mut self) {
        self.n_free -= 1;
        if self.n_free < self.n_min {
            self.n_min = self.n_free;
        }
    }

    fn next_index(&self, idx: usize) -> usize {
        if idx + 1 == self.ring.len() {
            0
        } else {
            idx + 1
        }
    }

    fn prev_index(&self, idx: usize) -> usize {
        if idx == 0 {
            self.ring.len() - 1
        } else {
            idx - 1
        }
    }
}

impl core::fmt::Debug for EventQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("n_min", &self.n_min)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critical;
    use crate::event::Signal;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    fn sig(n: u16) -> EventRef {
        EventRef::immutable(Signal(n))
    }

    fn drain_signals(queue: &mut EventQueue) -> Vec<u16> {
        queue.drain().iter().map(|e| e.signal().0).collect()
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut queue = EventQueue::new(3);
        critical::with(|cs| {
            for n in 1..=3 {
                assert!(queue.post(cs, &sig(n), Margin::Guaranteed));
            }
        });
        assert_eq!(drain_signals(&mut queue), vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn lifo_insert_goes_to_the_head() {
        let mut queue = EventQueue::new(3);
        critical::with(|cs| {
            queue.post(cs, &sig(1), Margin::Guaranteed);
            queue.post(cs, &sig(2), Margin::Guaranteed);
            queue.post_lifo(cs, &sig(9));
        });
        assert_eq!(drain_signals(&mut queue), vec![9, 1, 2]);
    }

    #[test]
    fn capacity_counts_the_front_slot() {
        let mut queue = EventQueue::new(2);
        assert_eq!(queue.capacity(), 3);
        critical::with(|cs| {
            for n in 0..3 {
                assert!(queue.post(cs, &sig(n), Margin::Slots(0)));
            }
            assert!(!queue.post(cs, &sig(3), Margin::Slots(0)));
        });
        assert_eq!(queue.stats(), QueueStats { capacity: 3, free: 0, min_free: 0 });
    }

    #[test]
    fn margin_requires_more_free_slots_than_requested() {
        let mut queue = EventQueue::new(3);
        critical::with(|cs| {
            assert!(queue.post(cs, &sig(1), Margin::Slots(2)));
            assert!(queue.post(cs, &sig(2), Margin::Slots(2)));
            assert_eq!(queue.n_free(), 2);
            assert!(!queue.post(cs, &sig(3), Margin::Slots(2)));
            assert!(queue.post(cs, &sig(3), Margin::Slots(1)));
        });
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn rejected_post_leaves_reference_count_alone() {
        use crate::pool::{MemPool, PoolTable};
        use std::sync::Arc;

        let mut pools = PoolTable::new(1);
        pools.register(Arc::new(MemPool::new(0, 1))).unwrap();
        let e = pools.new_signal(Signal(5), Margin::Guaranteed).unwrap();

        let mut queue = EventQueue::new(0);
        critical::with(|cs| {
            assert!(queue.post(cs, &sig(1), Margin::Guaranteed));
            assert!(!queue.post(cs, &e, Margin::Slots(0)));
        });
        assert_eq!(e.ref_count(), 0);
    }

    #[test]
    #[should_panic(expected = "qf_eq:110")]
    fn guaranteed_post_into_full_queue_is_fatal() {
        let mut queue = EventQueue::new(0);
        critical::with(|cs| {
            queue.post(cs, &sig(1), Margin::Guaranteed);
            queue.post(cs, &sig(2), Margin::Guaranteed);
        });
    }

    #[test]
    #[should_panic(expected = "qf_eq:200")]
    fn lifo_into_full_queue_is_fatal() {
        let mut queue = EventQueue::new(1);
        critical::with(|cs| {
            queue.post(cs, &sig(1), Margin::Guaranteed);
            queue.post(cs, &sig(2), Margin::Guaranteed);
            queue.post_lifo(cs, &sig(3));
        });
    }

    /// Drives random post/post_lifo/get sequences against a `VecDeque`.
    #[quickcheck]
    fn matches_reference_model(len: u8, bytecode: Vec<u8>) {
        let len = u16::from(len % 8);
        let mut queue = EventQueue::new(len);
        let mut reference: VecDeque<u16> = VecDeque::new();
        let capacity = usize::from(len) + 1;

        for (step, cmd) in bytecode.into_iter().enumerate() {
            let n = step as u16;
            match cmd % 4 {
                0 | 1 => {
                    let margin = u16::from(cmd >> 4) % 3;
                    let free = capacity - reference.len();
                    let posted =
                        critical::with(|cs| queue.post(cs, &sig(n), Margin::Slots(margin)));
                    assert_eq!(posted, free > usize::from(margin));
                    if posted {
                        reference.push_back(n);
                    }
                }
                2 => {
                    if reference.len() < capacity {
                        critical::with(|cs| queue.post_lifo(cs, &sig(n)));
                        reference.push_front(n);
                    }
                }
                _ => {
                    let got = queue.get().map(|e| e.signal().0);
                    assert_eq!(got, reference.pop_front());
                }
            }

            assert_eq!(queue.len(), reference.len());
            assert_eq!(queue.is_empty(), reference.is_empty());
            assert!(usize::from(queue.n_min()) <= capacity - reference.len());
        }
    }
}
