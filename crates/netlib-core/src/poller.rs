//! Readiness multiplexer abstraction.
//!
//! # Implementors
//!
//! - `EpollPoller` (netlib-module, Linux): level-triggered epoll.
//! - `PollPoller` (netlib-module, other unix): `poll(2)` over a registration map.
//! - `MockPoller` (netlib-module, feature = "mock"): scripted batches.
//!
//! **Contract:**
//! - `poll()` is the only call that may block, and only up to `timeout`.
//! - Entries come back in the order the OS reported them.
//! - A poller may report a handle that was deregistered moments ago;
//!   the reactor tolerates that.

use std::time::Duration;

use nix::errno::Errno;

use crate::handle::Handle;
use crate::interest::{Interest, Readiness};

pub trait Poller {
    fn register(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno>;

    /// Replace the interest set of an already registered handle.
    fn reregister(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno>;

    fn deregister(&mut self, handle: Handle) -> Result<(), Errno>;

    /// Wait for readiness. Clears `events` and fills it with this batch.
    /// `None` waits indefinitely. An interrupted wait returns an empty batch.
    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<(), Errno>;
}
