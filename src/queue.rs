//! # Event Queue
//!
//! Fixed-capacity ring of event handles owned by one EPA. `push_back` is
//! the ordinary FIFO post, `push_front` the LIFO "post-ahead" used to jump
//! the queue. The queue never grows: a full push is reported to the caller.
//!
//! The ring is stored inline at `QUEUE_MAX` slots; the EPA's configured
//! depth selects how many are usable. A low-water mark of free slots is
//! kept for capacity planning.

use crate::config::QUEUE_MAX;
use crate::contract::require;
use crate::event::EventRef;

/// Returned by a push on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Full;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub capacity: usize,
    pub used: usize,
    /// Fewest free slots ever observed.
    pub min_free: usize,
}

pub struct EventQueue {
    ring: [Option<EventRef>; QUEUE_MAX],
    head: usize,
    len: usize,
    capacity: usize,
    min_free: usize,
}

impl EventQueue {
    pub const fn new(capacity: usize) -> Self {
        Self {
            ring: [None; QUEUE_MAX],
            head: 0,
            len: 0,
            capacity,
            min_free: capacity,
        }
    }

    /// Queue sized for an EPA. `depth` must be in `1..=QUEUE_MAX`.
    pub fn with_depth(depth: usize) -> Self {
        require!(depth >= 1 && depth <= QUEUE_MAX, "queue depth out of range");
        Self::new(depth.clamp(1, QUEUE_MAX))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.capacity - self.len
    }

    pub fn min_free(&self) -> usize {
        self.min_free
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity,
            used: self.len,
            min_free: self.min_free,
        }
    }

    fn slot(&self, i: usize) -> usize {
        (self.head + i) % self.capacity
    }

    fn grew(&mut self) -> bool {
        self.len += 1;
        self.min_free = self.min_free.min(self.free());
        self.len == 1
    }

    /// FIFO insert. Returns `true` if the queue was empty before.
    pub fn push_back(&mut self, ev: EventRef) -> Result<bool, Full> {
        if self.len == self.capacity {
            return Err(Full);
        }
        let tail = self.slot(self.len);
        self.ring[tail] = Some(ev);
        Ok(self.grew())
    }

    /// LIFO insert ahead of everything pending. Returns `true` if the queue
    /// was empty before.
    pub fn push_front(&mut self, ev: EventRef) -> Result<bool, Full> {
        if self.len == self.capacity {
            return Err(Full);
        }
        self.head = (self.head + self.capacity - 1) % self.capacity;
        self.ring[self.head] = Some(ev);
        Ok(self.grew())
    }

    pub fn pop_front(&mut self) -> Option<EventRef> {
        if self.len == 0 {
            return None;
        }
        let ev = self.ring[self.head].take();
        self.head = (self.head + 1) % self.capacity;
        self.len -= 1;
        ev
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventId, EventPool};
    use crate::heap::Heap;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    /// `n` distinct live events to use as queue markers.
    fn markers(n: usize) -> (EventPool<Heap<4096>>, Vec<EventRef>) {
        let mut pool = EventPool::new(Heap::new());
        let evs = (0..n)
            .map(|i| pool.create(0, EventId(100 + i as u16), None, 0).unwrap())
            .collect();
        (pool, evs)
    }

    #[test]
    fn test_fifo_order() {
        let (_pool, evs) = markers(4);
        let mut q = EventQueue::new(4);
        assert_eq!(q.push_back(evs[0]), Ok(true));
        assert_eq!(q.push_back(evs[1]), Ok(false));
        q.push_back(evs[2]).unwrap();
        let out: Vec<_> = core::iter::from_fn(|| q.pop_front()).collect();
        assert_eq!(out, &evs[..3]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_post_ahead_jumps_queue() {
        let (_pool, evs) = markers(4);
        let mut q = EventQueue::new(4);
        q.push_back(evs[0]).unwrap();
        q.push_back(evs[1]).unwrap();
        assert_eq!(q.push_front(evs[2]), Ok(false));
        assert_eq!(q.pop_front(), Some(evs[2]));
        assert_eq!(q.pop_front(), Some(evs[0]));
        assert_eq!(q.pop_front(), Some(evs[1]));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn test_full_queue_rejects_both_ends() {
        let (_pool, evs) = markers(3);
        let mut q = EventQueue::new(2);
        q.push_back(evs[0]).unwrap();
        q.push_front(evs[1]).unwrap();
        assert_eq!(q.push_back(evs[2]), Err(Full));
        assert_eq!(q.push_front(evs[2]), Err(Full));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_low_water_mark() {
        let (_pool, evs) = markers(3);
        let mut q = EventQueue::new(5);
        for &ev in &evs {
            q.push_back(ev).unwrap();
        }
        while q.pop_front().is_some() {}
        assert_eq!(
            q.stats(),
            QueueStats {
                capacity: 5,
                used: 0,
                min_free: 2
            }
        );
    }

    #[test]
    fn test_wraparound() {
        let (_pool, evs) = markers(3);
        let mut q = EventQueue::new(2);
        for round in 0..5 {
            q.push_back(evs[round % 3]).unwrap();
            q.push_back(evs[(round + 1) % 3]).unwrap();
            assert_eq!(q.pop_front(), Some(evs[round % 3]));
            assert_eq!(q.pop_front(), Some(evs[(round + 1) % 3]));
        }
    }

    #[test]
    #[should_panic(expected = "queue depth")]
    fn test_zero_depth_is_rejected() {
        let _ = EventQueue::with_depth(0);
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Post,
        PostAhead,
        Fetch,
    }

    proptest! {
        #[test]
        fn queue_matches_reference_model(
            ops in proptest::collection::vec(
                prop_oneof![Just(Op::Post), Just(Op::PostAhead), Just(Op::Fetch)],
                0..100,
            ),
        ) {
            let (_pool, evs) = markers(100);
            let mut q = EventQueue::new(QUEUE_MAX);
            let mut model = VecDeque::new();

            for (i, op) in ops.into_iter().enumerate() {
                let ev = evs[i];
                match op {
                    Op::Post => {
                        let r = q.push_back(ev);
                        if model.len() == QUEUE_MAX {
                            prop_assert_eq!(r, Err(Full));
                        } else {
                            prop_assert_eq!(r, Ok(model.is_empty()));
                            model.push_back(ev);
                        }
                    }
                    Op::PostAhead => {
                        let r = q.push_front(ev);
                        if model.len() == QUEUE_MAX {
                            prop_assert_eq!(r, Err(Full));
                        } else {
                            prop_assert_eq!(r, Ok(model.is_empty()));
                            model.push_front(ev);
                        }
                    }
                    Op::Fetch => prop_assert_eq!(q.pop_front(), model.pop_front()),
                }
                prop_assert_eq!(q.len(), model.len());
            }
            while let Some(ev) = model.pop_front() {
                prop_assert_eq!(q.pop_front(), Some(ev));
            }
            prop_assert!(q.is_empty());
        }
    }
}
