//! netlib configuration
//!
//! Library defaults with runtime overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder setters (programmatic)
//! 2. Values from a [`ConfigSource`] (the environment for `from_env()`)
//! 3. Library defaults (`defaults`)
//!
//! # Example
//!
//! ```rust,ignore
//! use netlib_core::config::NetConfig;
//! use std::time::Duration;
//!
//! let config = NetConfig::from_env()
//!     .backlog(256)
//!     .poll_timeout(Duration::from_millis(20));
//! ```

pub mod defaults;
mod source;

pub use source::{get_value, ConfigSource, EnvSource, MapSource};

use std::time::Duration;

/// Reactor tunables.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Listen backlog
    pub backlog: i32,
    /// Bytes read by one `recv`
    pub recv_chunk: usize,
    /// SO_SNDBUF for new connections (0 = OS default)
    pub send_buf_size: u32,
    /// SO_RCVBUF for new connections (0 = OS default)
    pub recv_buf_size: u32,
    /// Longest wait per dispatch pass
    pub poll_timeout: Duration,
    /// Readiness entries per poll
    pub max_events: usize,
    /// Listener pause after EMFILE/ENFILE
    pub accept_backoff: Duration,
    /// Cross-thread command queue capacity
    pub command_queue_capacity: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            backlog: defaults::BACKLOG,
            recv_chunk: defaults::RECV_CHUNK,
            send_buf_size: defaults::SEND_BUF_SIZE,
            recv_buf_size: defaults::RECV_BUF_SIZE,
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            max_events: defaults::MAX_EVENTS,
            accept_backoff: Duration::from_millis(defaults::ACCEPT_BACKOFF_MS),
            command_queue_capacity: defaults::COMMAND_QUEUE_CAPACITY,
        }
    }
}

impl NetConfig {
    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `NETLIB_BACKLOG` - Listen backlog
    /// - `NETLIB_RECV_CHUNK` - Bytes per `recv`
    /// - `NETLIB_SEND_BUF_SIZE` - SO_SNDBUF for new connections
    /// - `NETLIB_RECV_BUF_SIZE` - SO_RCVBUF for new connections
    /// - `NETLIB_POLL_TIMEOUT_MS` - Poll timeout in milliseconds
    /// - `NETLIB_MAX_EVENTS` - Readiness entries per poll
    /// - `NETLIB_ACCEPT_BACKOFF_MS` - Listener pause after EMFILE/ENFILE
    /// - `NETLIB_COMMAND_QUEUE` - Cross-thread command queue capacity
    pub fn from_env() -> Self {
        Self::from_source(&EnvSource)
    }

    /// Library defaults with overrides from `source`.
    pub fn from_source<S: ConfigSource + ?Sized>(source: &S) -> Self {
        Self {
            backlog: get_value(source, "NETLIB_BACKLOG", defaults::BACKLOG),
            recv_chunk: get_value(source, "NETLIB_RECV_CHUNK", defaults::RECV_CHUNK).max(1),
            send_buf_size: clamp_buf_size(get_value(
                source,
                "NETLIB_SEND_BUF_SIZE",
                defaults::SEND_BUF_SIZE,
            )),
            recv_buf_size: clamp_buf_size(get_value(
                source,
                "NETLIB_RECV_BUF_SIZE",
                defaults::RECV_BUF_SIZE,
            )),
            poll_timeout: Duration::from_millis(get_value(
                source,
                "NETLIB_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
            max_events: get_value(source, "NETLIB_MAX_EVENTS", defaults::MAX_EVENTS).max(1),
            accept_backoff: Duration::from_millis(get_value(
                source,
                "NETLIB_ACCEPT_BACKOFF_MS",
                defaults::ACCEPT_BACKOFF_MS,
            )),
            command_queue_capacity: get_value(
                source,
                "NETLIB_COMMAND_QUEUE",
                defaults::COMMAND_QUEUE_CAPACITY,
            )
            .max(1),
        }
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn recv_chunk(mut self, bytes: usize) -> Self {
        self.recv_chunk = bytes.max(1);
        self
    }

    pub fn send_buf_size(mut self, size: u32) -> Self {
        self.send_buf_size = clamp_buf_size(size);
        self
    }

    pub fn recv_buf_size(mut self, size: u32) -> Self {
        self.recv_buf_size = clamp_buf_size(size);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn max_events(mut self, n: usize) -> Self {
        self.max_events = n.max(1);
        self
    }

    pub fn accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }

    pub fn command_queue_capacity(mut self, n: usize) -> Self {
        self.command_queue_capacity = n.max(1);
        self
    }
}

/// Clamp a socket buffer size to [`defaults::MAX_SOCKET_BUF_SIZE`].
#[inline]
pub fn clamp_buf_size(size: u32) -> u32 {
    size.min(defaults::MAX_SOCKET_BUF_SIZE)
}
