// src/poller/epoll.rs

//! Linux readiness backend over raw `epoll` FFI.
//!
//! Interest is aggregated per descriptor in an [`FdRecord`]: one designated
//! event per kind (read/write/close), reference counts per kind, and the
//! kernel mask synthesized from those counts. The epoll user-data slot
//! carries the fd, which keys the record map on dispatch.
//!
//! Signals ride a socketpair self-pipe: the relay thread writes the signal
//! number as a single byte to one end, the other end is registered here like
//! any read interest and resolved through a signal-number map.

use bitflags::bitflags;
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{EventRef, Interest};
use crate::poller::signal::SignalRelay;

/// Initial harvest-buffer size; doubled after any saturated wait.
const INITIAL_READY: usize = 32;
/// Harvest buffer growth cap.
const MAX_READY: usize = 4096;

const EMPTY_EVENT: libc::epoll_event = libc::epoll_event { events: 0, u64: 0 };

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct EpollFlags: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLOUT = libc::EPOLLOUT as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
        const EPOLLRDHUP = libc::EPOLLRDHUP as u32;
        const EPOLLET = libc::EPOLLET as u32;
    }
}

/// Per-fd aggregate of every subscriber on that descriptor.
///
/// Each kind has at most one subscriber; a second add for an occupied kind
/// is rejected before any state changes.
#[derive(Default)]
struct FdRecord {
    read: Option<EventRef>,
    write: Option<EventRef>,
    close: Option<EventRef>,
    nread: u8,
    nwrite: u8,
    nclose: u8,
    nedge: u8,
    /// Kernel mask last synthesized from the counts.
    mask: EpollFlags,
}

impl FdRecord {
    fn occupied(&self) -> Interest {
        let mut bits = Interest::empty();
        if self.read.is_some() {
            bits |= Interest::READ;
        }
        if self.write.is_some() {
            bits |= Interest::WRITE;
        }
        if self.close.is_some() {
            bits |= Interest::CLOSE;
        }
        bits
    }

    fn is_idle(&self) -> bool {
        self.nread == 0 && self.nwrite == 0 && self.nclose == 0
    }

    /// Derives the kernel mask from the counts. EPOLLET is never asserted on
    /// an otherwise empty mask.
    fn recompute_mask(&mut self) {
        let mut mask = EpollFlags::empty();
        if self.nread > 0 {
            mask |= EpollFlags::EPOLLIN;
        }
        if self.nwrite > 0 {
            mask |= EpollFlags::EPOLLOUT;
        }
        if self.nclose > 0 {
            mask |= EpollFlags::EPOLLRDHUP;
        }
        if !mask.is_empty() && self.nedge > 0 {
            mask |= EpollFlags::EPOLLET;
        }
        self.mask = mask;
    }

    fn apply(&mut self, ev: &EventRef, interest: Interest) {
        if interest.contains(Interest::READ) {
            self.read = Some(ev.clone());
            self.nread += 1;
        }
        if interest.contains(Interest::WRITE) {
            self.write = Some(ev.clone());
            self.nwrite += 1;
        }
        if interest.contains(Interest::CLOSE) {
            self.close = Some(ev.clone());
            self.nclose += 1;
        }
        if interest.contains(Interest::EDGE_TRIGGERED) {
            self.nedge += 1;
        }
        self.recompute_mask();
    }

    fn retract(&mut self, interest: Interest) {
        if interest.contains(Interest::READ) {
            self.read = None;
            self.nread -= 1;
        }
        if interest.contains(Interest::WRITE) {
            self.write = None;
            self.nwrite -= 1;
        }
        if interest.contains(Interest::CLOSE) {
            self.close = None;
            self.nclose -= 1;
        }
        if interest.contains(Interest::EDGE_TRIGGERED) {
            self.nedge -= 1;
        }
        self.recompute_mask();
    }
}

pub(crate) struct Poller {
    /// `None` once closed; every later call answers `BadFileDescriptor`.
    epfd: Option<OwnedFd>,
    records: HashMap<RawFd, FdRecord>,
    ready: Vec<libc::epoll_event>,
    signal_rd: Option<OwnedFd>,
    signal_events: HashMap<i32, EventRef>,
    relay: Option<SignalRelay>,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller> {
        let raw = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if raw == -1 {
            return Err(Error::from_os(io::Error::last_os_error()));
        }
        let epfd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mut pair = [0 as libc::c_int; 2];
        if unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_CLOEXEC,
                0,
                pair.as_mut_ptr(),
            )
        } == -1
        {
            return Err(Error::from_os(io::Error::last_os_error()));
        }
        let signal_rd = unsafe { OwnedFd::from_raw_fd(pair[0]) };
        let signal_wr = unsafe { OwnedFd::from_raw_fd(pair[1]) };

        let mut ep_ev = libc::epoll_event {
            events: EpollFlags::EPOLLIN.bits(),
            u64: pair[0] as u64,
        };
        if unsafe { libc::epoll_ctl(raw, libc::EPOLL_CTL_ADD, pair[0], &mut ep_ev) } == -1 {
            return Err(Error::from_os(io::Error::last_os_error()));
        }

        let relay = SignalRelay::spawn(signal_wr)?;

        debug!(
            "epoll poller created (epfd {}, signal pipe read end {})",
            raw, pair[0]
        );

        Ok(Poller {
            epfd: Some(epfd),
            records: HashMap::new(),
            ready: vec![EMPTY_EVENT; INITIAL_READY],
            signal_rd: Some(signal_rd),
            signal_events: HashMap::new(),
            relay: Some(relay),
        })
    }

    /// Registers the event's interest, creating or updating its fd record.
    pub(crate) fn add(&mut self, ev: &EventRef) -> Result<()> {
        let (fd, interest) = {
            let inner = ev.borrow();
            (inner.fd, inner.interest)
        };

        if interest.contains(Interest::SIGNAL) {
            return self.add_signal(fd as i32, ev);
        }

        let epfd = self.epfd_raw()?;
        let created = !self.records.contains_key(&fd);
        let record = self.records.entry(fd).or_default();

        if record.occupied().intersects(interest) {
            if created {
                self.records.remove(&fd);
            }
            return Err(Error::EventExists);
        }

        record.apply(ev, interest);
        let mask = record.mask;

        let op = if created {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_ev = libc::epoll_event {
            events: mask.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, op, fd, &mut ep_ev) } == -1 {
            let err = io::Error::last_os_error();
            let mut idle = false;
            if let Some(record) = self.records.get_mut(&fd) {
                record.retract(interest);
                idle = record.is_idle();
            }
            if idle {
                self.records.remove(&fd);
            }
            return Err(Error::from_os(err));
        }

        trace!("fd {}: interest {:?} added, kernel mask {:?}", fd, interest, mask);
        Ok(())
    }

    /// Withdraws the event's contribution; unregisters the fd once idle.
    pub(crate) fn del(&mut self, ev: &EventRef) -> Result<()> {
        let (fd, interest) = {
            let inner = ev.borrow();
            (inner.fd, inner.interest)
        };

        if interest.contains(Interest::SIGNAL) {
            return self.del_signal(fd as i32);
        }

        let epfd = self.epfd_raw()?;
        let record = self.records.get_mut(&fd).ok_or(Error::EventNotExists)?;
        record.retract(interest);

        let idle = record.is_idle();
        let mask = record.mask;
        if idle {
            self.records.remove(&fd);
        }

        let op = if idle {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ep_ev = libc::epoll_event {
            events: mask.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(epfd, op, fd, &mut ep_ev) } == -1 {
            return Err(Error::from_os(io::Error::last_os_error()));
        }

        trace!("fd {}: interest {:?} removed, kernel mask {:?}", fd, interest, mask);
        Ok(())
    }

    /// Blocks up to `budget`, reporting every readiness hit through `cb`.
    ///
    /// Kernel error/hangup conditions fan out to both the read and write
    /// subscribers so each side observes the failure. EINTR is swallowed;
    /// the loop simply comes around again.
    pub(crate) fn wait(
        &mut self,
        cb: &mut dyn FnMut(&EventRef, Interest),
        budget: Option<Duration>,
    ) -> Result<()> {
        let epfd = self.epfd_raw()?;
        let timeout_ms = budget_to_ms(budget);

        let n = unsafe {
            libc::epoll_wait(
                epfd,
                self.ready.as_mut_ptr(),
                self.ready.len() as libc::c_int,
                timeout_ms,
            )
        };
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("epoll_wait interrupted, retrying next iteration");
                return Ok(());
            }
            return Err(Error::from_os(err));
        }
        let n = n as usize;

        let signal_fd = self.signal_rd.as_ref().map(AsRawFd::as_raw_fd);
        for i in 0..n {
            let token = self.ready[i].u64;
            let flags = EpollFlags::from_bits_truncate(self.ready[i].events);

            if Some(token as RawFd) == signal_fd {
                self.dispatch_signal(cb);
                continue;
            }
            let Some(record) = self.records.get(&(token as RawFd)) else {
                // Raced with a del issued between the wait and this hit.
                continue;
            };

            let failure = flags.contains(EpollFlags::EPOLLERR)
                || (flags.contains(EpollFlags::EPOLLHUP)
                    && !flags.contains(EpollFlags::EPOLLRDHUP));

            let mut read = None;
            let mut write = None;
            let mut close = None;
            if failure {
                read = record.read.clone();
                write = record.write.clone();
            } else {
                if flags.contains(EpollFlags::EPOLLIN) {
                    read = record.read.clone();
                }
                if flags.contains(EpollFlags::EPOLLOUT) {
                    write = record.write.clone();
                }
                if flags.contains(EpollFlags::EPOLLRDHUP) {
                    close = record.close.clone();
                }
            }

            for (target, bit) in [
                (read, Interest::READ),
                (write, Interest::WRITE),
                (close, Interest::CLOSE),
            ] {
                if let Some(target) = target {
                    let mut fired = bit;
                    if target.borrow().interest.contains(Interest::EDGE_TRIGGERED) {
                        fired |= Interest::EDGE_TRIGGERED;
                    }
                    cb(&target, fired);
                }
            }
        }

        if n == self.ready.len() && self.ready.len() < MAX_READY {
            let grown = self.ready.len() * 2;
            trace!("harvest buffer saturated at {}, growing to {}", n, grown);
            self.ready.resize(grown, EMPTY_EVENT);
        }

        Ok(())
    }

    /// Releases the kernel handle. The relay goes down first since it holds
    /// the write end of the signal pipe.
    pub(crate) fn close(&mut self) -> Result<()> {
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
        if let Some(rd) = self.signal_rd.take() {
            close_fd(rd)?;
        }
        match self.epfd.take() {
            Some(epfd) => {
                debug!("closing epoll fd {}", epfd.as_raw_fd());
                close_fd(epfd)
            }
            None => Err(Error::BadFileDescriptor),
        }
    }

    fn add_signal(&mut self, signum: i32, ev: &EventRef) -> Result<()> {
        if self.signal_events.contains_key(&signum) {
            return Err(Error::EventExists);
        }
        let relay = self.relay.as_ref().ok_or(Error::BadFileDescriptor)?;
        relay.subscribe(signum)?;
        self.signal_events.insert(signum, ev.clone());
        debug!("subscribed to signal {}", signum);
        Ok(())
    }

    fn del_signal(&mut self, signum: i32) -> Result<()> {
        if self.signal_events.remove(&signum).is_none() {
            return Err(Error::EventNotExists);
        }
        let relay = self.relay.as_ref().ok_or(Error::BadFileDescriptor)?;
        relay.unsubscribe(signum)
    }

    /// One byte on the self-pipe is one delivered signal number.
    fn dispatch_signal(&self, cb: &mut dyn FnMut(&EventRef, Interest)) {
        let Some(rd) = self.signal_rd.as_ref() else {
            return;
        };
        let mut buf = [0u8; 1];
        let n = unsafe { libc::read(rd.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        if n != 1 {
            warn!(
                "short read on signal pipe: {}",
                io::Error::last_os_error()
            );
            return;
        }
        if let Some(ev) = self.signal_events.get(&(buf[0] as i32)) {
            cb(ev, Interest::SIGNAL);
        }
    }

    fn epfd_raw(&self) -> Result<RawFd> {
        self.epfd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::BadFileDescriptor)
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        // Joins the relay thread; the fds close themselves.
        if let Some(relay) = self.relay.take() {
            relay.close();
        }
    }
}

fn close_fd(fd: OwnedFd) -> Result<()> {
    let raw = fd.into_raw_fd();
    if unsafe { libc::close(raw) } == -1 {
        return Err(Error::from_os(io::Error::last_os_error()));
    }
    Ok(())
}

fn budget_to_ms(budget: Option<Duration>) -> libc::c_int {
    match budget {
        None => -1,
        // Round up: sleeping short of the deadline would spin the loop for
        // the final fraction of a millisecond.
        Some(d) => d
            .as_nanos()
            .div_ceil(1_000_000)
            .min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventInner, Membership, Priority};
    use crate::list::Links;
    use std::cell::RefCell;
    use std::rc::{Rc, Weak};
    use std::time::Instant;

    fn subscriber(fd: RawFd, interest: Interest) -> EventRef {
        Rc::new(RefCell::new(EventInner {
            base: Weak::new(),
            fd,
            interest,
            callback: None,
            priority: Priority::default(),
            active_priority: Priority::default(),
            timeout: Duration::ZERO,
            deadline: Instant::now(),
            fired: Interest::empty(),
            membership: Membership::empty(),
            registry_link: Links::default(),
            active_link: Links::default(),
            heap_index: None,
        }))
    }

    #[test]
    fn mask_synthesis_from_counts() {
        let mut record = FdRecord::default();
        record.apply(&subscriber(3, Interest::READ), Interest::READ);
        assert_eq!(record.mask, EpollFlags::EPOLLIN);

        record.apply(&subscriber(3, Interest::WRITE), Interest::WRITE);
        assert_eq!(record.mask, EpollFlags::EPOLLIN | EpollFlags::EPOLLOUT);

        record.retract(Interest::READ);
        assert_eq!(record.mask, EpollFlags::EPOLLOUT);
        record.retract(Interest::WRITE);
        assert!(record.mask.is_empty());
        assert!(record.is_idle());
    }

    #[test]
    fn edge_bit_needs_a_base_mask() {
        let mut record = FdRecord::default();
        // An ET request with no readiness interest must not reach the kernel.
        record.apply(&subscriber(3, Interest::EDGE_TRIGGERED), Interest::EDGE_TRIGGERED);
        assert!(record.mask.is_empty());

        record.apply(
            &subscriber(3, Interest::READ | Interest::EDGE_TRIGGERED),
            Interest::READ | Interest::EDGE_TRIGGERED,
        );
        assert_eq!(record.mask, EpollFlags::EPOLLIN | EpollFlags::EPOLLET);
    }

    #[test]
    fn budget_conversion_rounds_up() {
        assert_eq!(budget_to_ms(None), -1);
        assert_eq!(budget_to_ms(Some(Duration::ZERO)), 0);
        assert_eq!(budget_to_ms(Some(Duration::from_micros(1))), 1);
        assert_eq!(budget_to_ms(Some(Duration::from_millis(10))), 10);
        assert_eq!(
            budget_to_ms(Some(Duration::from_micros(10_500))),
            11
        );
    }
}
