// src/heap.rs

//! Array-backed binary min-heap of events keyed by deadline.
//!
//! Every swap writes the moved events' `heap_index` back, so the base can
//! remove an arbitrary member in O(log n) without searching. Ordering among
//! equal deadlines is unspecified (sift order is not stable).

use crate::event::EventRef;

pub(crate) struct DeadlineHeap {
    slots: Vec<EventRef>,
}

impl DeadlineHeap {
    pub(crate) fn new() -> Self {
        DeadlineHeap { slots: Vec::new() }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn peek(&self) -> Option<EventRef> {
        self.slots.first().cloned()
    }

    /// Inserts the event and records its position in `heap_index`.
    pub(crate) fn push(&mut self, ev: &EventRef) {
        self.slots.push(ev.clone());
        let index = self.slots.len() - 1;
        ev.borrow_mut().heap_index = Some(index);
        self.sift_up(index);
    }

    /// Removes the member at `index`: swap with the last slot, shrink, then
    /// sift the swapped-in member whichever way restores the heap property.
    pub(crate) fn remove_at(&mut self, index: usize) -> EventRef {
        let last = self.slots.len() - 1;
        if last != index {
            self.swap(index, last);
            if !self.sift_down(index, last) {
                self.sift_up(index);
            }
        }
        let ev = self.slots.pop().expect("remove_at called on an empty heap");
        ev.borrow_mut().heap_index = None;
        ev
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.slots[i].borrow().deadline < self.slots[j].borrow().deadline
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.slots.swap(i, j);
        self.slots[i].borrow_mut().heap_index = Some(i);
        self.slots[j].borrow_mut().heap_index = Some(j);
    }

    fn sift_up(&mut self, mut j: usize) {
        while j > 0 {
            let i = (j - 1) / 2;
            if !self.less(j, i) {
                break;
            }
            self.swap(i, j);
            j = i;
        }
    }

    /// Returns true if the member moved down at all.
    fn sift_down(&mut self, start: usize, n: usize) -> bool {
        let mut i = start;
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                child = right;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
        i > start
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventInner, Interest, Membership, Priority};
    use crate::list::Links;
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};
    use std::time::{Duration, Instant};

    fn timer(at: Instant) -> EventRef {
        Rc::new(RefCell::new(EventInner {
            base: Weak::new(),
            fd: -1,
            interest: Interest::TIMEOUT,
            callback: None,
            priority: Priority::default(),
            active_priority: Priority::default(),
            timeout: Duration::ZERO,
            deadline: at,
            fired: Interest::empty(),
            membership: Membership::empty(),
            registry_link: Links::default(),
            active_link: Links::default(),
            heap_index: None,
        }))
    }

    fn assert_heap_valid(heap: &DeadlineHeap) {
        for i in 1..heap.slots.len() {
            let parent = (i - 1) / 2;
            assert!(
                heap.slots[parent].borrow().deadline <= heap.slots[i].borrow().deadline,
                "heap property violated at index {i}"
            );
        }
        for (i, ev) in heap.slots.iter().enumerate() {
            assert_eq!(ev.borrow().heap_index, Some(i), "stale index at slot {i}");
        }
    }

    #[test]
    fn push_keeps_min_at_root() {
        let origin = Instant::now();
        let mut heap = DeadlineHeap::new();
        // Deterministic scramble of 0..=22 in 7-step strides.
        for k in 0..23u64 {
            heap.push(&timer(origin + Duration::from_millis((k * 7) % 23)));
            assert_heap_valid(&heap);
        }
        let min = heap.peek().unwrap();
        assert_eq!(min.borrow().deadline, origin);
    }

    #[test]
    fn remove_at_arbitrary_positions() {
        let origin = Instant::now();
        let mut heap = DeadlineHeap::new();
        let evs: Vec<_> = (0..16u64)
            .map(|k| timer(origin + Duration::from_millis((k * 5) % 16)))
            .collect();
        for ev in &evs {
            heap.push(ev);
        }

        // Remove from the middle by each event's own recorded index.
        for ev in evs.iter().step_by(3) {
            let index = ev.borrow().heap_index.unwrap();
            let removed = heap.remove_at(index);
            assert!(Rc::ptr_eq(&removed, ev));
            assert_eq!(removed.borrow().heap_index, None);
            assert_heap_valid(&heap);
        }
    }

    #[test]
    fn drain_yields_nondecreasing_deadlines() {
        let origin = Instant::now();
        let mut heap = DeadlineHeap::new();
        for k in 0..31u64 {
            heap.push(&timer(origin + Duration::from_millis((k * 11) % 31)));
        }

        let mut last = origin;
        while !heap.is_empty() {
            let ev = heap.remove_at(0);
            let deadline = ev.borrow().deadline;
            assert!(deadline >= last);
            last = deadline;
        }
        assert_eq!(heap.len(), 0);
    }
}
