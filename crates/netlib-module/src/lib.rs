//! # netlib-module — Default implementations
//!
//! This crate provides the default implementation for every netlib-core
//! trait. Each impl prioritizes correctness and simplicity over speed.
//!
//! ## Default stack
//!
//! | Trait     | Default Impl              | Alternative                    |
//! |-----------|---------------------------|--------------------------------|
//! | Transport | SysTransport              | MockTransport (mock)           |
//! | Poller    | EpollPoller (linux)       | PollPoller (other unix), MockPoller (mock) |

pub mod sys_transport;
pub mod poll_poller;

#[cfg(feature = "mock")]
pub mod mock;

pub use sys_transport::SysTransport;

use netlib_core::Errno;

// Platform-specific poller
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        pub mod epoll_poller;
        pub use epoll_poller::EpollPoller as PlatformPoller;
    } else {
        pub use poll_poller::PollPoller as PlatformPoller;
    }
}

/// Create the platform-appropriate poller.
pub fn new_poller(max_events: usize) -> Result<PlatformPoller, Errno> {
    PlatformPoller::new(max_events)
}
