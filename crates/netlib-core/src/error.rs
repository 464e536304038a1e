//! netlib error types.

use nix::errno::Errno;
use thiserror::Error;

use crate::endpoint::Endpoint;
use crate::handle::Handle;
use crate::state::ConnectionState;

#[derive(Debug, Error)]
pub enum NetError {
    /// Stream socket creation failed.
    #[error("socket create failed: {0}")]
    Socket(Errno),

    #[error("bind {endpoint} failed: {errno}")]
    Bind { endpoint: Endpoint, errno: Errno },

    #[error("listen on {endpoint} failed: {errno}")]
    Listen { endpoint: Endpoint, errno: Errno },

    /// `connect` failed synchronously (not the in-progress class).
    #[error("connect to {endpoint} failed: {errno}")]
    Connect { endpoint: Endpoint, errno: Errno },

    #[error("send on handle {handle} failed: {errno}")]
    Send { handle: Handle, errno: Errno },

    #[error("recv on handle {handle} failed: {errno}")]
    Recv { handle: Handle, errno: Errno },

    /// The multiplexer rejected a registration or a wait.
    #[error("poller: {0}")]
    Poller(Errno),

    /// The handle is not (or no longer) registered.
    #[error("handle {0} not found")]
    NotFound(Handle),

    /// A second owner was offered for a registered handle.
    #[error("handle {0} already registered")]
    AlreadyExists(Handle),

    #[error("handle {handle} is {actual}, operation needs {expected}")]
    InvalidState {
        handle: Handle,
        expected: ConnectionState,
        actual: ConnectionState,
    },

    /// A dispatch-thread operation was called from another thread.
    #[error("called off the dispatch thread")]
    WrongThread,

    /// The cross-thread command queue is full.
    #[error("command queue full")]
    QueueFull,

    #[error("timer interval must be non-zero")]
    InvalidInterval,

    /// The reactor could not be set up.
    #[error("reactor init failed: {0}")]
    Init(Errno),
}

impl NetError {
    /// The OS error behind this failure, if there is one.
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Socket(e) | Self::Poller(e) | Self::Init(e) => Some(*e),
            Self::Bind { errno, .. }
            | Self::Listen { errno, .. }
            | Self::Connect { errno, .. }
            | Self::Send { errno, .. }
            | Self::Recv { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
