//! Library defaults for [`NetConfig`](super::NetConfig).

/// Listen backlog.
pub const BACKLOG: i32 = 64;

/// Bytes read by a single `recv`.
pub const RECV_CHUNK: usize = 1024;

/// Socket send buffer size; 0 leaves the OS default.
pub const SEND_BUF_SIZE: u32 = 0;

/// Socket receive buffer size; 0 leaves the OS default.
pub const RECV_BUF_SIZE: u32 = 0;

/// Upper bound applied to any socket buffer size.
pub const MAX_SOCKET_BUF_SIZE: u32 = 128 * 1024;

/// Longest a dispatch pass waits for readiness.
pub const POLL_TIMEOUT_MS: u64 = 100;

/// How long a listener stops accepting after the process runs out of
/// descriptors.
pub const ACCEPT_BACKOFF_MS: u64 = 100;

/// Readiness entries fetched per poll.
pub const MAX_EVENTS: usize = 1024;

/// Capacity of the cross-thread command queue.
pub const COMMAND_QUEUE_CAPACITY: usize = 4096;
