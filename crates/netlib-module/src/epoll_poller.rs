//! `EpollPoller` — default `Poller` implementation on Linux.
//!
//! Level-triggered epoll. The handle travels in the event's `u64` slot, so
//! a batch maps back to handles without a lookup.

use std::os::unix::io::RawFd;
use std::time::Duration;

use netlib_core::{Errno, Handle, Interest, Poller, Readiness};

pub struct EpollPoller {
    epfd: RawFd,
    buf: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new(max_events: usize) -> Result<Self, Errno> {
        let epfd = Errno::result(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            epfd,
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; max_events.max(1)],
        })
    }

    fn ctl(&self, op: libc::c_int, handle: Handle, interest: Interest) -> Result<(), Errno> {
        let mut ev = libc::epoll_event {
            events: to_epoll(interest),
            u64: handle.raw() as u32 as u64,
        };
        Errno::result(unsafe { libc::epoll_ctl(self.epfd, op, handle.raw(), &mut ev) }).map(drop)
    }
}

fn to_epoll(interest: Interest) -> u32 {
    let mut events = 0u32;
    if interest.is_readable() {
        events |= (libc::EPOLLIN | libc::EPOLLPRI) as u32;
    }
    if interest.is_writable() {
        events |= libc::EPOLLOUT as u32;
    }
    // EPOLLERR/EPOLLHUP are always reported; asking is harmless.
    if interest.is_error() {
        events |= (libc::EPOLLERR | libc::EPOLLHUP) as u32;
    }
    events
}

fn from_epoll(events: u32) -> Interest {
    let mut ready = Interest::NONE;
    if events & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0 {
        ready |= Interest::READABLE;
    }
    if events & libc::EPOLLOUT as u32 != 0 {
        ready |= Interest::WRITABLE;
    }
    if events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
        ready |= Interest::ERROR;
    }
    ready
}

pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        // Round up so a sub-millisecond deadline does not become a busy poll.
        Some(d) => {
            let ms = d.as_micros().div_ceil(1000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

impl Poller for EpollPoller {
    fn register(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_ADD, handle, interest)
    }

    fn reregister(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_MOD, handle, interest)
    }

    fn deregister(&mut self, handle: Handle) -> Result<(), Errno> {
        self.ctl(libc::EPOLL_CTL_DEL, handle, Interest::NONE)
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<(), Errno> {
        events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            let errno = Errno::last();
            return if errno == Errno::EINTR { Ok(()) } else { Err(errno) };
        }
        for ev in &self.buf[..n as usize] {
            let bits = ev.events;
            let data = ev.u64;
            events.push(Readiness::new(Handle(data as u32 as i32), from_epoll(bits)));
        }
        Ok(())
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe {
                libc::close(self.epfd);
            }
            self.epfd = -1;
        }
    }
}
