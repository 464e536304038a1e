//! Socket primitive abstraction.
//!
//! A `Transport` maps 1:1 onto the OS socket calls the state machine needs.
//! It exists so the state machine can run against a scripted transport in
//! tests.
//!
//! # Implementors
//!
//! - `SysTransport` (netlib-module): libc syscalls on real descriptors.
//! - `MockTransport` (netlib-module, feature = "mock"): scripted outcomes.
//!
//! **Contract:**
//! - Every call is non-blocking once `set_non_blocking` has been applied.
//! - "Would block" / "in progress" error codes are classified here and come
//!   back as `WouldBlock` / `InProgress`, never as `Err`.
//! - `Err(errno)` always means a real failure.

use nix::errno::Errno;

use crate::endpoint::Endpoint;
use crate::handle::Handle;

/// Outcome of a non-blocking `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// Established immediately (common on loopback).
    Connected,
    /// Handshake under way; a writable event reports the result.
    InProgress,
}

/// Outcome of a non-blocking `accept`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    Accepted(Handle, Endpoint),
    /// The pending-connection queue is empty.
    WouldBlock,
}

/// Outcome of a non-blocking `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Written(usize),
    /// The socket send buffer is full.
    WouldBlock,
}

/// True for the error class a non-blocking call reports instead of waiting.
#[inline]
pub fn is_would_block(errno: Errno) -> bool {
    errno == Errno::EAGAIN || errno == Errno::EWOULDBLOCK
}

/// True for the error class a non-blocking `connect` reports while the
/// handshake is still running.
#[inline]
pub fn is_in_progress(errno: Errno) -> bool {
    errno == Errno::EINPROGRESS || is_would_block(errno)
}

pub trait Transport {
    fn create_stream_socket(&self) -> Result<Handle, Errno>;

    // Option setters are best-effort: callers log failures and carry on.
    fn set_non_blocking(&self, handle: Handle) -> Result<(), Errno>;
    fn set_reuse_addr(&self, handle: Handle) -> Result<(), Errno>;
    fn set_no_delay(&self, handle: Handle) -> Result<(), Errno>;
    fn set_send_buf(&self, handle: Handle, size: u32) -> Result<(), Errno>;
    fn set_recv_buf(&self, handle: Handle, size: u32) -> Result<(), Errno>;

    fn bind(&self, handle: Handle, endpoint: &Endpoint) -> Result<(), Errno>;
    fn listen(&self, handle: Handle, backlog: i32) -> Result<(), Errno>;
    fn connect(&self, handle: Handle, endpoint: &Endpoint) -> Result<ConnectOutcome, Errno>;
    fn accept(&self, handle: Handle) -> Result<AcceptOutcome, Errno>;
    fn send(&self, handle: Handle, data: &[u8]) -> Result<SendOutcome, Errno>;

    /// One bounded read. Empty when nothing is buffered or the peer closed.
    fn recv(&self, handle: Handle, max_len: usize) -> Result<Vec<u8>, Errno>;

    /// Bytes readable without blocking, without consuming them.
    fn available_bytes(&self, handle: Handle) -> Result<usize, Errno>;

    /// Pending socket error (`SO_ERROR`). `Ok(())` means none.
    fn socket_error(&self, handle: Handle) -> Result<(), Errno>;

    /// Address the socket is bound to (`getsockname`). Resolves the port
    /// the OS picked when bound to port 0.
    fn local_endpoint(&self, handle: Handle) -> Result<Endpoint, Errno>;

    fn close(&self, handle: Handle);
}
