// src/poller/mod.rs

//! Kernel readiness multiplexer backends.
//!
//! The base depends on one concrete `Poller` type per platform, all with the
//! same surface:
//!
//! - `add(ev)` registers the interest derived from the event's bits on its fd
//! - `del(ev)` withdraws that contribution, unregistering the fd once idle
//! - `wait(cb, budget)` blocks up to `budget` (`None` = unbounded,
//!   zero = non-blocking) and reports each ready event through `cb`
//! - `close()` releases the kernel handle and stops the signal relay
//!
//! `cb` receives a subset of {READ, WRITE, CLOSE} (plus EDGE_TRIGGERED when
//! the event asked for it, or SIGNAL for relayed signals) already filtered
//! by the event's interest.

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(target_os = "linux")]
mod signal;
#[cfg(target_os = "linux")]
pub(crate) use epoll::Poller;

#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub(crate) use kqueue::Poller;
