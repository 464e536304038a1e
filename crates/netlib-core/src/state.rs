//! Connection lifecycle states.
//!
//! ```text
//!   Idle ──listen──► Listening
//!    │
//!    └──connect──► Connecting ──writable, SO_ERROR=0──► Connected
//!
//!   any state ──close / error──► Closing   (terminal)
//! ```
//!
//! Accepted sockets skip straight to `Connected`.

use std::fmt;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle = 0,
    Listening = 1,
    Connecting = 2,
    Connected = 3,
    Closing = 4,
}

impl ConnectionState {
    /// No operation or event may act on a connection in a terminal state.
    #[inline]
    pub fn is_terminal(self) -> bool {
        self == Self::Closing
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}
