// src/event.rs

//! The unit of subscription: a file descriptor, deadline or signal paired
//! with a callback, plus the interest bits describing when it fires.

use bitflags::bitflags;
use log::trace;
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::base::{BaseInner, EventBase};
use crate::error::{Error, Result};
use crate::list::Links;

bitflags! {
    /// What an event is interested in, and how it behaves once it fires.
    ///
    /// `READ`, `WRITE` and `CLOSE` are fd readiness bits and may be combined.
    /// `SIGNAL` reuses the fd slot as a signal number and is exclusive with
    /// the readiness bits. `TIMEOUT` combines with anything. `PERSIST` and
    /// `EDGE_TRIGGERED` are behavior options, not activation reasons.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Interest: u32 {
        /// The descriptor is readable.
        const READ = 0x01;
        /// The descriptor is writable.
        const WRITE = 0x02;
        /// The deadline expired.
        const TIMEOUT = 0x04;
        /// The peer closed its end (RDHUP-like).
        const CLOSE = 0x08;
        /// The fd field is a signal number; fire on delivery.
        const SIGNAL = 0x10;
        /// Stay registered after firing.
        const PERSIST = 0x20;
        /// Request edge-triggered delivery from the kernel.
        const EDGE_TRIGGERED = 0x40;
    }
}

impl Interest {
    /// The fd readiness bits this interest carries.
    pub(crate) fn readiness(self) -> Interest {
        self & (Interest::READ | Interest::WRITE | Interest::CLOSE)
    }

    /// True if the poller needs to hear about this event at all.
    pub(crate) fn needs_poller(self) -> bool {
        self.intersects(
            Interest::READ | Interest::WRITE | Interest::CLOSE | Interest::SIGNAL,
        )
    }
}

bitflags! {
    /// Which base containers an event currently sits in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Membership: u8 {
        /// In the registry list of all attached events.
        const REGISTRY = 0x01;
        /// In one of the priority-segmented active lists.
        const ACTIVE = 0x02;
        /// In the deadline heap.
        const HEAP = 0x04;
    }
}

/// Dispatch priority. Active events drain `High` before `Middle` before
/// `Low` within one loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    High,
    #[default]
    Middle,
    Low,
}

impl Priority {
    pub(crate) fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Middle => 1,
            Priority::Low => 2,
        }
    }
}

pub(crate) type Callback = Box<dyn FnMut(RawFd, Interest)>;

/// Shared event state. The base holds extra handles to this cell only while
/// the event is attached; the user-facing [`Event`] is just another handle.
pub(crate) struct EventInner {
    pub(crate) base: Weak<BaseInner>,

    pub(crate) fd: RawFd,
    pub(crate) interest: Interest,
    /// Taken out of the cell for the duration of an invocation so the
    /// callback may re-borrow its own event.
    pub(crate) callback: Option<Callback>,

    pub(crate) priority: Priority,
    /// Priority captured at activation time; the active-list removal must
    /// target the list the event was actually pushed onto.
    pub(crate) active_priority: Priority,

    pub(crate) timeout: Duration,
    /// Meaningful only while `membership` contains `HEAP`.
    pub(crate) deadline: Instant,

    /// OR-accumulated reasons since the event was last activated.
    pub(crate) fired: Interest,
    pub(crate) membership: Membership,

    pub(crate) registry_link: Links,
    pub(crate) active_link: Links,
    /// Position in the deadline heap, kept in sync by every heap swap.
    pub(crate) heap_index: Option<usize>,
}

pub(crate) type EventRef = Rc<RefCell<EventInner>>;

/// A subscription handle. Cloning is cheap; all clones refer to the same
/// underlying event.
///
/// The event is owned by the caller: dropping every handle while the event
/// is attached leaves it attached until the base itself goes away, and
/// detaching never frees user state (it lives in the callback closure).
#[derive(Clone)]
pub struct Event {
    pub(crate) inner: EventRef,
}

impl Event {
    /// Creates an event watching `fd` for `interest`, dispatching to
    /// `callback`. Priority defaults to [`Priority::Middle`].
    ///
    /// Pass `fd = -1` for pure timers. For signal events the fd slot carries
    /// the signal number instead.
    pub fn new(
        base: &EventBase,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut(RawFd, Interest) + 'static,
    ) -> Event {
        Event {
            inner: Rc::new(RefCell::new(EventInner {
                base: base.downgrade(),
                fd,
                interest,
                callback: Some(Box::new(callback)),
                priority: Priority::default(),
                active_priority: Priority::default(),
                timeout: Duration::ZERO,
                deadline: Instant::now(),
                fired: Interest::empty(),
                membership: Membership::empty(),
                registry_link: Links::default(),
                active_link: Links::default(),
                heap_index: None,
            })),
        }
    }

    /// A one-shot timer. Attach with the desired delay as timeout.
    pub fn timer(base: &EventBase, callback: impl FnMut(RawFd, Interest) + 'static) -> Event {
        Event::new(base, -1, Interest::TIMEOUT, callback)
    }

    /// A periodic timer: re-arms itself on every expiry.
    pub fn ticker(base: &EventBase, callback: impl FnMut(RawFd, Interest) + 'static) -> Event {
        Event::new(base, -1, Interest::TIMEOUT | Interest::PERSIST, callback)
    }

    /// A persistent subscription to a process signal.
    pub fn signal(
        base: &EventBase,
        signum: i32,
        callback: impl FnMut(RawFd, Interest) + 'static,
    ) -> Event {
        Event::new(
            base,
            signum as RawFd,
            Interest::SIGNAL | Interest::PERSIST,
            callback,
        )
    }

    /// Registers the event with its base.
    ///
    /// With `TIMEOUT` interest the event expires `timeout` from now; a zero
    /// timeout expires on the next loop iteration. Without `TIMEOUT` the
    /// argument is ignored.
    ///
    /// # Errors
    ///
    /// [`Error::EventInvalid`] when the interest bits are empty or mix
    /// `SIGNAL` with fd readiness, [`Error::EventExists`] when the event is
    /// already attached or the backend treats the (fd, kind) pair as taken.
    pub fn attach(&self, timeout: Duration) -> Result<()> {
        let base = self.upgrade_base()?;

        {
            let mut inner = self.inner.borrow_mut();
            let interest = inner.interest;
            if !interest.intersects(
                Interest::READ
                    | Interest::WRITE
                    | Interest::CLOSE
                    | Interest::TIMEOUT
                    | Interest::SIGNAL,
            ) {
                return Err(Error::EventInvalid);
            }
            if interest.contains(Interest::SIGNAL) && !interest.readiness().is_empty() {
                return Err(Error::EventInvalid);
            }
            if inner.membership.contains(Membership::REGISTRY) {
                return Err(Error::EventExists);
            }
            inner.timeout = timeout;
        }

        base.add_event(&self.inner)?;
        trace!(
            "attached event on fd {} (interest {:?}, timeout {:?})",
            self.fd(),
            self.interest(),
            timeout
        );
        Ok(())
    }

    /// Withdraws the event from its base. The callback will not run again
    /// unless the event is re-attached.
    ///
    /// # Errors
    ///
    /// [`Error::EventNotExists`] when the event is not attached.
    pub fn detach(&self) -> Result<()> {
        let base = self.upgrade_base()?;

        if !self
            .inner
            .borrow()
            .membership
            .contains(Membership::REGISTRY)
        {
            return Err(Error::EventNotExists);
        }

        base.del_event(&self.inner)?;
        trace!("detached event on fd {}", self.fd());
        Ok(())
    }

    /// Sets the dispatch priority. Takes effect from the next activation.
    pub fn set_priority(&self, priority: Priority) {
        self.inner.borrow_mut().priority = priority;
    }

    /// The watched descriptor, or -1 for pure timers, or the signal number
    /// for signal events.
    pub fn fd(&self) -> RawFd {
        self.inner.borrow().fd
    }

    /// The interest bits this event was created with.
    pub fn interest(&self) -> Interest {
        self.inner.borrow().interest
    }

    /// The current dispatch priority.
    pub fn priority(&self) -> Priority {
        self.inner.borrow().priority
    }

    /// The timeout passed to the most recent [`Event::attach`].
    pub fn timeout(&self) -> Duration {
        self.inner.borrow().timeout
    }

    fn upgrade_base(&self) -> Result<Rc<BaseInner>> {
        // A base that has been dropped behaves like one that was shut down.
        self.inner.borrow().base.upgrade().ok_or(Error::EventInvalid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_masks_behavior_bits() {
        let all = Interest::READ | Interest::TIMEOUT | Interest::PERSIST | Interest::EDGE_TRIGGERED;
        assert_eq!(all.readiness(), Interest::READ);
        assert!(all.needs_poller());
        assert!(!(Interest::TIMEOUT | Interest::PERSIST).needs_poller());
        assert!(Interest::SIGNAL.needs_poller());
    }

    #[test]
    fn priority_indices_are_dispatch_order() {
        assert!(Priority::High.index() < Priority::Middle.index());
        assert!(Priority::Middle.index() < Priority::Low.index());
        assert_eq!(Priority::default(), Priority::Middle);
    }
}
