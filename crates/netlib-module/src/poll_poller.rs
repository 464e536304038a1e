//! `PollPoller` — portable `poll(2)` fallback.
//!
//! Keeps the registrations in a map and rebuilds the `pollfd` array on every
//! wait. O(n) per poll; fine for the handful of sockets a fallback platform
//! is expected to carry.
//!
//! When more descriptors are ready than fit in one batch, the next poll
//! starts scanning at the first one left out, so a stable map order cannot
//! starve the tail.

use std::collections::HashMap;
use std::time::Duration;

use netlib_core::{Errno, Handle, Interest, Poller, Readiness};

pub struct PollPoller {
    interests: HashMap<Handle, Interest>,
    fds: Vec<libc::pollfd>,
    max_events: usize,
    /// Scan start for the next batch.
    cursor: usize,
}

impl PollPoller {
    pub fn new(max_events: usize) -> Result<Self, Errno> {
        Ok(Self {
            interests: HashMap::new(),
            fds: Vec::new(),
            max_events: max_events.max(1),
            cursor: 0,
        })
    }

    /// Number of registered handles.
    pub fn len(&self) -> usize {
        self.interests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interests.is_empty()
    }
}

fn to_poll(interest: Interest) -> libc::c_short {
    let mut events: libc::c_short = 0;
    if interest.is_readable() {
        events |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.is_writable() {
        events |= libc::POLLOUT;
    }
    events
}

fn from_poll(revents: libc::c_short) -> Interest {
    let mut ready = Interest::NONE;
    if revents & (libc::POLLIN | libc::POLLPRI) != 0 {
        ready |= Interest::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Interest::WRITABLE;
    }
    if revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
        ready |= Interest::ERROR;
    }
    ready
}

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => d.as_micros().div_ceil(1000).min(libc::c_int::MAX as u128) as libc::c_int,
    }
}

impl Poller for PollPoller {
    fn register(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno> {
        if self.interests.contains_key(&handle) {
            return Err(Errno::EEXIST);
        }
        self.interests.insert(handle, interest);
        Ok(())
    }

    fn reregister(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno> {
        match self.interests.get_mut(&handle) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn deregister(&mut self, handle: Handle) -> Result<(), Errno> {
        self.interests.remove(&handle).map(drop).ok_or(Errno::ENOENT)
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<(), Errno> {
        events.clear();
        self.fds.clear();
        self.fds.extend(self.interests.iter().map(|(h, i)| libc::pollfd {
            fd: h.raw(),
            events: to_poll(*i),
            revents: 0,
        }));

        let n = unsafe {
            libc::poll(
                self.fds.as_mut_ptr(),
                self.fds.len() as libc::nfds_t,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let errno = Errno::last();
            return if errno == Errno::EINTR { Ok(()) } else { Err(errno) };
        }

        let len = self.fds.len();
        if len == 0 {
            return Ok(());
        }
        let first = self.cursor % len;
        for i in 0..len {
            let idx = (first + i) % len;
            let pfd = &self.fds[idx];
            if pfd.revents == 0 {
                continue;
            }
            if events.len() == self.max_events {
                self.cursor = idx;
                break;
            }
            events.push(Readiness::new(Handle(pfd.fd), from_poll(pfd.revents)));
        }
        Ok(())
    }
}
