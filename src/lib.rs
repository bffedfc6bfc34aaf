// src/lib.rs

//! A single-threaded readiness reactor in the libevent mold.
//!
//! One [`EventBase`] multiplexes three sources of activation over a single
//! dispatch loop:
//!
//! - **Fd readiness** via the platform poller (epoll on Linux, kqueue on the
//!   BSDs), level- or edge-triggered
//! - **Deadlines** from a min-heap of timeouts, one-shot or periodic
//! - **Process signals** (Linux), relayed through a self-pipe so they arrive
//!   like any other readiness event
//!
//! Each [`Event`] pairs an interest set with a callback closure. Activated
//! events queue up in three priority lanes and are dispatched High → Middle
//! → Low; persistent events stay registered after firing, one-shot events
//! are detached before their callback runs. Callbacks run inline on the
//! dispatching thread and are free to attach, detach or shut the base down
//! — everything except re-entering the loop itself.
//!
//! The base is deliberately `!Send`: one base belongs to one thread, and
//! the only concurrency inside is the signal-relay thread behind the
//! self-pipe.
//!
//! # Example
//!
//! ```
//! # fn main() -> event_base::Result<()> {
//! use event_base::{Event, EventBase, Interest};
//! use std::time::Duration;
//!
//! let base = EventBase::new()?;
//!
//! let handle = base.clone();
//! let timer = Event::timer(&base, move |_, fired| {
//!     assert!(fired.contains(Interest::TIMEOUT));
//!     let _ = handle.shutdown();
//! });
//! timer.attach(Duration::from_millis(10))?;
//!
//! match base.dispatch() {
//!     // Shutdown from inside a callback surfaces as a closed poller.
//!     Err(err) if err.is_shutdown() => {}
//!     other => other?,
//! }
//! # Ok(())
//! # }
//! ```

mod base;
mod error;
mod event;
mod heap;
mod list;
mod poller;

pub use base::{EventBase, LoopFlags};
pub use error::{Error, Result};
pub use event::{Event, Interest, Priority};
