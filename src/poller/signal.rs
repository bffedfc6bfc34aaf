// src/poller/signal.rs

//! The signal relay: a dedicated thread that turns asynchronous signal
//! delivery into bytes on the poller's self-pipe.
//!
//! Each delivered signal number is written as a single byte, which limits
//! relayed signals to numbers below 256. Unsubscribing only stops the
//! forwarding; the process-level handler installed by `signal-hook` stays in
//! place until the relay is closed.

use log::{debug, error};
use signal_hook::iterator::backend::Handle;
use signal_hook::iterator::Signals;
use std::collections::HashSet;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use crate::error::{Error, Result};

pub(crate) struct SignalRelay {
    handle: Handle,
    /// Signals currently forwarded down the pipe. Shared with the relay
    /// thread, which drops deliveries for anything not in the set.
    forwarding: Arc<Mutex<HashSet<i32>>>,
    thread: Option<JoinHandle<()>>,
}

impl SignalRelay {
    /// Spawns the relay thread owning the write end of the self-pipe.
    pub(crate) fn spawn(pipe_wr: OwnedFd) -> Result<SignalRelay> {
        let mut signals = Signals::new(Vec::<i32>::new()).map_err(Error::Poller)?;
        let handle = signals.handle();
        let forwarding = Arc::new(Mutex::new(HashSet::new()));
        let subscribed = Arc::clone(&forwarding);

        let thread = std::thread::Builder::new()
            .name("signal-relay".to_string())
            .spawn(move || {
                for signum in signals.forever() {
                    let wanted = subscribed
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .contains(&signum);
                    if !wanted {
                        continue;
                    }
                    let byte = [signum as u8];
                    let n = unsafe {
                        libc::write(pipe_wr.as_raw_fd(), byte.as_ptr().cast(), 1)
                    };
                    if n != 1 {
                        error!(
                            "signal relay write failed for signal {}: {}",
                            signum,
                            io::Error::last_os_error()
                        );
                        break;
                    }
                }
                debug!("signal relay thread exited");
                // pipe_wr drops here, closing the write end.
            })
            .map_err(Error::Poller)?;

        Ok(SignalRelay {
            handle,
            forwarding,
            thread: Some(thread),
        })
    }

    /// Starts forwarding `signum`.
    ///
    /// # Errors
    ///
    /// [`Error::EventExists`] when already subscribed; the poller error kind
    /// when the signal cannot be grabbed (forbidden signals, for one).
    pub(crate) fn subscribe(&self, signum: i32) -> Result<()> {
        {
            let set = self
                .forwarding
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if set.contains(&signum) {
                return Err(Error::EventExists);
            }
        }
        self.handle.add_signal(signum).map_err(Error::Poller)?;
        self.forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(signum);
        Ok(())
    }

    /// Stops forwarding `signum`. The process-level registration is left in
    /// place; stray deliveries are filtered out by the relay thread.
    pub(crate) fn unsubscribe(&self, signum: i32) -> Result<()> {
        let removed = self
            .forwarding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&signum);
        if !removed {
            return Err(Error::EventNotExists);
        }
        Ok(())
    }

    /// Terminates the relay thread and joins it.
    pub(crate) fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.shutdown();
    }
}
