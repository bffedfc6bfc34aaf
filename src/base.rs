// src/base.rs

//! The event base: one readiness poller, the registry of attached events,
//! three priority-segmented active queues and the deadline heap, driven by a
//! single-threaded dispatch loop.
//!
//! Callbacks run inline on the dispatching thread and may attach or detach
//! any event (including their own) or shut the base down; the active-queue
//! walk snapshots its next handle before every invocation to survive that.
//! Callbacks must not re-enter [`EventBase::run`].

use bitflags::bitflags;
use log::{debug, warn};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::event::{EventRef, Interest, Membership};
use crate::heap::DeadlineHeap;
use crate::list::{EventList, Lane};
use crate::poller::Poller;

bitflags! {
    /// Loop-control flags for [`EventBase::run`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LoopFlags: u32 {
        /// Return after a single dispatch pass.
        const ONCE = 0x01;
        /// Never block in the poller, even with no pending deadline.
        const NONBLOCK = 0x02;
    }
}

/// A handle to the reactor. Cloning is cheap and every clone refers to the
/// same base, which is how callbacks get to call [`EventBase::shutdown`] or
/// attach further events from inside dispatch.
///
/// The base is single-threaded by construction (`!Send`): all attach,
/// detach and run calls happen on the owning thread.
#[derive(Clone)]
pub struct EventBase {
    pub(crate) inner: Rc<BaseInner>,
}

pub(crate) struct BaseInner {
    poller: RefCell<Poller>,
    registry: RefCell<EventList>,
    /// Index 0 is the highest priority; each drains fully before the next.
    active: [RefCell<EventList>; 3],
    heap: RefCell<DeadlineHeap>,
    /// One wall-clock reading shared by everything within a loop iteration,
    /// so a slow callback does not skew deadline comparisons against the
    /// timers behind it.
    now_cache: Cell<Option<Instant>>,
}

impl EventBase {
    /// Creates the poller and empty bookkeeping structures.
    pub fn new() -> Result<EventBase> {
        let poller = Poller::new()?;
        debug!("event base created");
        Ok(EventBase {
            inner: Rc::new(BaseInner {
                poller: RefCell::new(poller),
                registry: RefCell::new(EventList::new(Lane::Registry)),
                active: [
                    RefCell::new(EventList::new(Lane::Active)),
                    RefCell::new(EventList::new(Lane::Active)),
                    RefCell::new(EventList::new(Lane::Active)),
                ],
                heap: RefCell::new(DeadlineHeap::new()),
                now_cache: Cell::new(None),
            }),
        })
    }

    /// Runs the dispatch loop.
    ///
    /// Each iteration blocks in the poller no longer than the nearest
    /// deadline allows, drains expired timers into the active queues, then
    /// invokes callbacks in priority order. With [`LoopFlags::ONCE`] the
    /// loop returns after one pass; with [`LoopFlags::NONBLOCK`] the poller
    /// is only ever polled.
    ///
    /// # Errors
    ///
    /// Poller failures abort the loop. [`crate::Error::BadFileDescriptor`]
    /// is the expected outcome when a callback shuts the base down
    /// mid-dispatch.
    pub fn run(&self, flags: LoopFlags) -> Result<()> {
        loop {
            self.inner.now_cache.set(None);
            let budget = self
                .inner
                .wait_budget(flags.contains(LoopFlags::NONBLOCK));

            {
                let inner = &self.inner;
                let mut poller = inner.poller.borrow_mut();
                poller.wait(&mut |ev, reason| inner.activate(ev, reason), budget)?;
            }

            self.inner.now_cache.set(Some(Instant::now()));
            self.inner.drain_expired();
            self.inner.handle_active();

            if flags.contains(LoopFlags::ONCE) {
                return Ok(());
            }
        }
    }

    /// Blocks dispatching events until a poller error or an in-callback
    /// [`EventBase::shutdown`]. Equivalent to `run(LoopFlags::empty())`.
    pub fn dispatch(&self) -> Result<()> {
        self.run(LoopFlags::empty())
    }

    /// Closes the poller, which stops the signal relay and releases the
    /// kernel handles. Attached events are not detached; a loop blocked in
    /// the poller observes the closure as `BadFileDescriptor`.
    pub fn shutdown(&self) -> Result<()> {
        debug!("event base shutting down");
        self.inner.poller.borrow_mut().close()
    }

    pub(crate) fn downgrade(&self) -> Weak<BaseInner> {
        Rc::downgrade(&self.inner)
    }
}

impl BaseInner {
    /// Registers an attached event in every structure its interest calls
    /// for. On poller failure the registration is rolled back so a failed
    /// attach leaves no trace.
    pub(crate) fn add_event(&self, ev: &EventRef) -> Result<()> {
        let interest = ev.borrow().interest;

        if interest.contains(Interest::TIMEOUT) {
            let deadline = self.now() + ev.borrow().timeout;
            ev.borrow_mut().deadline = deadline;
            self.queue_insert(ev, Membership::HEAP);
        }

        self.queue_insert(ev, Membership::REGISTRY);

        if interest.needs_poller() {
            if let Err(err) = self.poller.borrow_mut().add(ev) {
                self.queue_remove(ev, Membership::HEAP);
                self.queue_remove(ev, Membership::REGISTRY);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Withdraws an event from every structure it currently sits in.
    pub(crate) fn del_event(&self, ev: &EventRef) -> Result<()> {
        self.queue_remove(ev, Membership::HEAP);
        self.queue_remove(ev, Membership::ACTIVE);
        self.queue_remove(ev, Membership::REGISTRY);

        if ev.borrow().interest.needs_poller() {
            return self.poller.borrow_mut().del(ev);
        }
        Ok(())
    }

    /// Queues an event for callback invocation. Activating an already
    /// active event only ORs the new reason in; the callback still runs
    /// once per activation cycle.
    pub(crate) fn activate(&self, ev: &EventRef, reason: Interest) {
        if ev.borrow().membership.contains(Membership::ACTIVE) {
            ev.borrow_mut().fired |= reason;
            return;
        }
        ev.borrow_mut().fired = reason;
        self.queue_insert(ev, Membership::ACTIVE);
    }

    /// How long the poller may sleep: zero when non-blocking or a deadline
    /// has already passed, unbounded when no deadline is pending.
    fn wait_budget(&self, nonblock: bool) -> Option<Duration> {
        if nonblock {
            return Some(Duration::ZERO);
        }
        let head = self.heap.borrow().peek()?;
        let deadline = head.borrow().deadline;
        Some(deadline.saturating_duration_since(self.now()))
    }

    /// Moves every expired deadline from the heap into the active queues.
    fn drain_expired(&self) {
        let now = self.now();
        loop {
            let head = match self.heap.borrow().peek() {
                Some(ev) => ev,
                None => break,
            };
            if head.borrow().deadline > now {
                break;
            }
            self.queue_remove(&head, Membership::HEAP);
            self.activate(&head, Interest::TIMEOUT);
        }
    }

    /// Drains the active queues in priority order and invokes callbacks.
    ///
    /// The next handle is snapshotted before each invocation; if the
    /// callback detaches that snapshot, the walk restarts from the lane
    /// head, which only ever holds events not yet serviced this pass
    /// (every event leaves the lane before its callback runs). Persistent
    /// events are re-armed (deadline recomputed, heap re-entered) before
    /// their callback runs, so a detach from inside the callback wins;
    /// one-shot events are fully detached before their callback runs.
    fn handle_active(&self) {
        for queue in &self.active {
            let mut cursor = queue.borrow().front();
            while let Some(ev) = cursor {
                let next = queue.borrow().next_of(&ev);

                let (interest, fd) = {
                    let inner = ev.borrow();
                    (inner.interest, inner.fd)
                };

                if interest.contains(Interest::PERSIST) {
                    self.queue_remove(&ev, Membership::ACTIVE);
                    if interest.contains(Interest::TIMEOUT) {
                        let deadline = self.now() + ev.borrow().timeout;
                        ev.borrow_mut().deadline = deadline;
                        self.queue_insert(&ev, Membership::HEAP);
                    }
                } else if let Err(err) = self.del_event(&ev) {
                    warn!("one-shot cleanup for fd {} failed: {}", fd, err);
                }

                let fired = ev.borrow().fired;
                let callback = ev.borrow_mut().callback.take();
                if let Some(mut callback) = callback {
                    callback(fd, fired);
                    ev.borrow_mut().callback = Some(callback);
                }

                cursor = match next {
                    Some(n) if n.borrow().membership.contains(Membership::ACTIVE) => Some(n),
                    // The callback detached the snapshot; its links are
                    // gone, but every event still active is reachable from
                    // the head.
                    Some(_) => queue.borrow().front(),
                    None => None,
                };
            }
        }
    }

    fn queue_insert(&self, ev: &EventRef, which: Membership) {
        if ev.borrow().membership.contains(which) {
            return;
        }
        ev.borrow_mut().membership.insert(which);

        if which == Membership::REGISTRY {
            self.registry.borrow_mut().push_back(ev);
        } else if which == Membership::ACTIVE {
            let priority = ev.borrow().priority;
            ev.borrow_mut().active_priority = priority;
            self.active[priority.index()].borrow_mut().push_back(ev);
        } else if which == Membership::HEAP {
            self.heap.borrow_mut().push(ev);
        }
    }

    fn queue_remove(&self, ev: &EventRef, which: Membership) {
        if !ev.borrow().membership.contains(which) {
            return;
        }
        ev.borrow_mut().membership.remove(which);

        if which == Membership::REGISTRY {
            self.registry.borrow_mut().remove(ev);
        } else if which == Membership::ACTIVE {
            let priority = ev.borrow().active_priority;
            self.active[priority.index()].borrow_mut().remove(ev);
        } else if which == Membership::HEAP {
            let index = ev.borrow().heap_index;
            if let Some(index) = index {
                self.heap.borrow_mut().remove_at(index);
            }
        }
    }

    /// The cached iteration-wide clock reading, or a fresh one outside the
    /// cached window.
    pub(crate) fn now(&self) -> Instant {
        match self.now_cache.get() {
            Some(now) => now,
            None => Instant::now(),
        }
    }

    #[cfg(test)]
    fn active_len(&self, priority: crate::event::Priority) -> usize {
        self.active[priority.index()].borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Priority};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn attach_detach_round_trip_restores_structure() {
        let base = EventBase::new().unwrap();
        let (reader, _writer) = UnixStream::pair().unwrap();

        let ev = Event::new(&base, reader.as_raw_fd(), Interest::READ, |_, _| {});
        ev.attach(Duration::from_millis(50)).unwrap();

        assert_eq!(base.inner.registry.borrow().len(), 1);
        assert_eq!(base.inner.heap.borrow().len(), 0);
        assert_eq!(base.inner.poller.borrow().record_count(), 1);

        ev.detach().unwrap();

        assert!(base.inner.registry.borrow().is_empty());
        assert!(base.inner.heap.borrow().is_empty());
        assert_eq!(base.inner.poller.borrow().record_count(), 0);
        assert!(ev.inner.borrow().membership.is_empty());

        // The event is attachable again afterwards.
        ev.attach(Duration::ZERO).unwrap();
        ev.detach().unwrap();
    }

    #[test]
    fn timeout_interest_enters_the_heap() {
        let base = EventBase::new().unwrap();
        let ev = Event::timer(&base, |_, _| {});
        ev.attach(Duration::from_millis(10)).unwrap();

        assert_eq!(base.inner.heap.borrow().len(), 1);
        let inner = ev.inner.borrow();
        assert!(inner.membership.contains(Membership::HEAP));
        assert!(inner.membership.contains(Membership::REGISTRY));
        assert_eq!(inner.heap_index, Some(0));
    }

    #[test]
    fn activation_is_idempotent_and_merges_reasons() {
        let base = EventBase::new().unwrap();
        let (reader, _writer) = UnixStream::pair().unwrap();

        let ev = Event::new(
            &base,
            reader.as_raw_fd(),
            Interest::READ | Interest::WRITE,
            |_, _| {},
        );
        ev.attach(Duration::ZERO).unwrap();

        base.inner.activate(&ev.inner, Interest::READ);
        base.inner.activate(&ev.inner, Interest::WRITE);

        assert_eq!(
            ev.inner.borrow().fired,
            Interest::READ | Interest::WRITE
        );
        assert_eq!(base.inner.active_len(Priority::Middle), 1);

        // Active membership implies registry membership.
        let membership = ev.inner.borrow().membership;
        assert!(membership.contains(Membership::ACTIVE));
        assert!(membership.contains(Membership::REGISTRY));
    }

    #[test]
    fn detach_while_active_clears_every_lane() {
        let base = EventBase::new().unwrap();
        let (reader, _writer) = UnixStream::pair().unwrap();

        let ev = Event::new(
            &base,
            reader.as_raw_fd(),
            Interest::READ | Interest::TIMEOUT,
            |_, _| {},
        );
        ev.attach(Duration::from_millis(100)).unwrap();
        base.inner.activate(&ev.inner, Interest::READ);

        ev.detach().unwrap();
        assert!(ev.inner.borrow().membership.is_empty());
        assert!(base.inner.registry.borrow().is_empty());
        assert!(base.inner.heap.borrow().is_empty());
        assert_eq!(base.inner.active_len(Priority::Middle), 0);
        assert_eq!(base.inner.poller.borrow().record_count(), 0);
    }

    #[test]
    fn wait_budget_tracks_nearest_deadline() {
        let base = EventBase::new().unwrap();
        assert_eq!(base.inner.wait_budget(true), Some(Duration::ZERO));
        assert_eq!(base.inner.wait_budget(false), None);

        let ev = Event::timer(&base, |_, _| {});
        ev.attach(Duration::from_millis(250)).unwrap();

        let budget = base.inner.wait_budget(false).unwrap();
        assert!(budget <= Duration::from_millis(250));
        assert!(budget > Duration::from_millis(200));
    }
}
