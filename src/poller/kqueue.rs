// src/poller/kqueue.rs

//! BSD readiness backend over `kqueue`.
//!
//! Interest changes are appended to a changelist and submitted with the next
//! `kevent` wait, which also harvests ready events; the changelist is then
//! truncated. Change failures come back in-band as `EV_ERROR` entries.
//!
//! Signal events are Linux-only for now.
// TODO: wire EVFILT_SIGNAL so signal events work without the relay.

use log::{debug, trace};
use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{EventRef, Interest};

/// Initial harvest-buffer size; doubled after any saturated wait.
const INITIAL_READY: usize = 32;
/// Harvest buffer growth cap.
const MAX_READY: usize = 4096;

fn empty_kevent() -> libc::kevent {
    // kevent has no meaningful all-zeros constant; zeroed is the idiom.
    unsafe { std::mem::zeroed() }
}

/// Per-fd filter slots. At most one subscriber per filter.
#[derive(Default)]
struct FdRecord {
    read: Option<EventRef>,
    write: Option<EventRef>,
}

impl FdRecord {
    fn is_idle(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

pub(crate) struct Poller {
    /// `None` once closed; every later call answers `BadFileDescriptor`.
    kq: Option<OwnedFd>,
    records: HashMap<RawFd, FdRecord>,
    changes: Vec<libc::kevent>,
    ready: Vec<libc::kevent>,
}

impl Poller {
    pub(crate) fn new() -> Result<Poller> {
        let raw = unsafe { libc::kqueue() };
        if raw == -1 {
            return Err(Error::from_os(io::Error::last_os_error()));
        }
        let kq = unsafe { OwnedFd::from_raw_fd(raw) };

        debug!("kqueue poller created (kq {})", raw);

        Ok(Poller {
            kq: Some(kq),
            records: HashMap::new(),
            changes: Vec::new(),
            ready: vec![empty_kevent(); INITIAL_READY],
        })
    }

    /// Queues EV_ADD changes for the event's filters.
    pub(crate) fn add(&mut self, ev: &EventRef) -> Result<()> {
        let (fd, interest) = {
            let inner = ev.borrow();
            (inner.fd, inner.interest)
        };

        if interest.contains(Interest::SIGNAL) {
            return Err(Error::EventInvalid);
        }
        self.kq_raw()?;

        // No kqueue filter backs CLOSE; peer-close surfaces as readability.
        if !interest.intersects(Interest::READ | Interest::WRITE) {
            return Ok(());
        }

        let record = self.records.entry(fd).or_default();
        if (interest.contains(Interest::READ) && record.read.is_some())
            || (interest.contains(Interest::WRITE) && record.write.is_some())
        {
            return Err(Error::EventExists);
        }

        let mut flags = libc::EV_ADD;
        if interest.contains(Interest::EDGE_TRIGGERED) {
            flags |= libc::EV_CLEAR;
        }

        if interest.contains(Interest::READ) {
            record.read = Some(ev.clone());
            self.changes.push(change(fd, libc::EVFILT_READ, flags));
        }
        if interest.contains(Interest::WRITE) {
            record.write = Some(ev.clone());
            self.changes.push(change(fd, libc::EVFILT_WRITE, flags));
        }

        trace!("fd {}: interest {:?} queued for add", fd, interest);
        Ok(())
    }

    /// Queues EV_DELETE changes for the event's filters.
    pub(crate) fn del(&mut self, ev: &EventRef) -> Result<()> {
        let (fd, interest) = {
            let inner = ev.borrow();
            (inner.fd, inner.interest)
        };

        if interest.contains(Interest::SIGNAL) {
            return Err(Error::EventInvalid);
        }
        self.kq_raw()?;

        if !interest.intersects(Interest::READ | Interest::WRITE) {
            return Ok(());
        }

        let record = self.records.get_mut(&fd).ok_or(Error::EventNotExists)?;
        if interest.contains(Interest::READ) {
            record.read = None;
            self.changes.push(change(fd, libc::EVFILT_READ, libc::EV_DELETE));
        }
        if interest.contains(Interest::WRITE) {
            record.write = None;
            self.changes.push(change(fd, libc::EVFILT_WRITE, libc::EV_DELETE));
        }
        if record.is_idle() {
            self.records.remove(&fd);
        }

        trace!("fd {}: interest {:?} queued for delete", fd, interest);
        Ok(())
    }

    /// Submits pending changes, then blocks up to `budget` harvesting ready
    /// filters. EINTR is swallowed; the loop simply comes around again.
    pub(crate) fn wait(
        &mut self,
        cb: &mut dyn FnMut(&EventRef, Interest),
        budget: Option<Duration>,
    ) -> Result<()> {
        let kq = self.kq_raw()?;

        let timespec = budget.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = timespec
            .as_ref()
            .map_or(std::ptr::null(), |ts| ts as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                kq,
                self.changes.as_ptr(),
                self.changes.len() as libc::c_int,
                self.ready.as_mut_ptr(),
                self.ready.len() as libc::c_int,
                ts_ptr,
            )
        };
        self.changes.clear();
        if n == -1 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                trace!("kevent interrupted, retrying next iteration");
                return Ok(());
            }
            return Err(Error::from_os(err));
        }
        let n = n as usize;

        for i in 0..n {
            let hit = self.ready[i];

            if hit.flags & libc::EV_ERROR != 0 {
                let errno = hit.data as i32;
                match errno {
                    // The change itself failed for a closed or unknown fd;
                    // nothing to deliver.
                    libc::EBADF | libc::ENOENT | libc::EINVAL => continue,
                    _ => return Err(Error::Poller(io::Error::from_raw_os_error(errno))),
                }
            }

            let Some(record) = self.records.get(&(hit.ident as RawFd)) else {
                continue;
            };
            let (target, bit) = match hit.filter {
                libc::EVFILT_READ => (record.read.clone(), Interest::READ),
                libc::EVFILT_WRITE => (record.write.clone(), Interest::WRITE),
                _ => (None, Interest::empty()),
            };
            if let Some(target) = target {
                let mut fired = bit;
                if target.borrow().interest.contains(Interest::EDGE_TRIGGERED) {
                    fired |= Interest::EDGE_TRIGGERED;
                }
                cb(&target, fired);
            }
        }

        if n == self.ready.len() && self.ready.len() < MAX_READY {
            let grown = self.ready.len() * 2;
            trace!("harvest buffer saturated at {}, growing to {}", n, grown);
            self.ready.resize(grown, empty_kevent());
        }

        Ok(())
    }

    /// Releases the kernel queue.
    pub(crate) fn close(&mut self) -> Result<()> {
        match self.kq.take() {
            Some(kq) => {
                debug!("closing kqueue fd {}", kq.as_raw_fd());
                let raw = kq.into_raw_fd();
                if unsafe { libc::close(raw) } == -1 {
                    return Err(Error::from_os(io::Error::last_os_error()));
                }
                Ok(())
            }
            None => Err(Error::BadFileDescriptor),
        }
    }

    fn kq_raw(&self) -> Result<RawFd> {
        self.kq
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or(Error::BadFileDescriptor)
    }

    #[cfg(test)]
    pub(crate) fn record_count(&self) -> usize {
        self.records.len()
    }
}

fn change(fd: RawFd, filter: i16, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}
