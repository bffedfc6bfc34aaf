// src/list.rs

//! Membership lanes: doubly-linked lists whose link cells live inside the
//! events themselves, so enqueue and removal are O(1) from any position and
//! dispatch allocates nothing.
//!
//! Forward links are strong handles, back links are weak, so a lane never
//! keeps a detached event alive. Traversal snapshots the next handle before
//! a callback runs; see `base::handle_active`.

use std::rc::Weak;

use crate::event::{EventInner, EventRef};

/// One pair of link cells. Every event embeds one per lane it can join.
#[derive(Default)]
pub(crate) struct Links {
    next: Option<EventRef>,
    prev: Option<Weak<std::cell::RefCell<EventInner>>>,
}

/// Selects which embedded link pair a list threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lane {
    /// The registry of all attached events.
    Registry,
    /// One of the priority-segmented active lists.
    Active,
}

impl Lane {
    fn links(self, inner: &mut EventInner) -> &mut Links {
        match self {
            Lane::Registry => &mut inner.registry_link,
            Lane::Active => &mut inner.active_link,
        }
    }

    fn next_of(self, inner: &EventInner) -> Option<EventRef> {
        match self {
            Lane::Registry => inner.registry_link.next.clone(),
            Lane::Active => inner.active_link.next.clone(),
        }
    }
}

/// A FIFO list over one lane of embedded links.
///
/// Callers are responsible for never pushing an event that is already a
/// member of this lane; the base guards that with its membership bits.
pub(crate) struct EventList {
    lane: Lane,
    head: Option<EventRef>,
    tail: Option<EventRef>,
    len: usize,
}

impl EventList {
    pub(crate) fn new(lane: Lane) -> Self {
        EventList {
            lane,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn push_back(&mut self, ev: &EventRef) {
        match self.tail.take() {
            Some(tail) => {
                self.lane.links(&mut tail.borrow_mut()).next = Some(ev.clone());
                self.lane.links(&mut ev.borrow_mut()).prev =
                    Some(std::rc::Rc::downgrade(&tail));
                self.tail = Some(ev.clone());
            }
            None => {
                self.head = Some(ev.clone());
                self.tail = Some(ev.clone());
            }
        }
        self.len += 1;
    }

    /// Unlinks `ev` wherever it sits. The event's link cells are cleared so
    /// a traversal holding it as its snapshot stops instead of walking into
    /// a stale chain.
    pub(crate) fn remove(&mut self, ev: &EventRef) {
        let (prev_weak, next) = {
            let mut inner = ev.borrow_mut();
            let links = self.lane.links(&mut inner);
            (links.prev.take(), links.next.take())
        };
        let prev = prev_weak.as_ref().and_then(Weak::upgrade);

        match &prev {
            Some(p) => self.lane.links(&mut p.borrow_mut()).next = next.clone(),
            None => self.head = next.clone(),
        }
        match &next {
            Some(n) => self.lane.links(&mut n.borrow_mut()).prev = prev_weak,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    pub(crate) fn front(&self) -> Option<EventRef> {
        self.head.clone()
    }

    /// The member after `ev`, or `None` at the tail or once `ev` has been
    /// unlinked.
    pub(crate) fn next_of(&self, ev: &EventRef) -> Option<EventRef> {
        self.lane.next_of(&ev.borrow())
    }
}
