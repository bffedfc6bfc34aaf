// src/error.rs

//! Error kinds reported by the reactor.

use std::io;
use thiserror::Error;

/// Errors surfaced by event registration and the dispatch loop.
#[derive(Debug, Error)]
pub enum Error {
    /// The event's interest bits make no sense: empty, or a signal interest
    /// combined with fd readiness bits.
    #[error("event interest is empty or inconsistent")]
    EventInvalid,

    /// The event is already attached, or another event already subscribes to
    /// the same (fd, kind) pair.
    #[error("event already exists")]
    EventExists,

    /// Detach or lookup of an event that is not attached.
    #[error("event does not exist")]
    EventNotExists,

    /// The kernel reported a closed descriptor. This is the normal way a
    /// dispatch loop observes `EventBase::shutdown` called from a callback,
    /// so callers usually treat it as a graceful exit.
    #[error("bad file descriptor")]
    BadFileDescriptor,

    /// Any other kernel failure from the readiness poller, verbatim.
    #[error("poller failure: {0}")]
    Poller(#[from] io::Error),
}

impl Error {
    /// Classifies an OS error, splitting `EBADF` out from the generic
    /// poller-failure bucket.
    pub(crate) fn from_os(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EBADF) => Error::BadFileDescriptor,
            _ => Error::Poller(err),
        }
    }

    /// True when the error is the graceful loop-exit condition produced by
    /// shutting the base down while it is dispatching.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::BadFileDescriptor)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
