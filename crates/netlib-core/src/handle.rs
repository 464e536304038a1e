//! Native socket handle.

use std::fmt;

/// OS-assigned socket descriptor.
///
/// Unique only while the socket is open. The OS reuses the number after
/// `close`, so a `Handle` must never outlive the connection that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(pub i32);

impl Handle {
    /// Returned by entry points that could not produce a socket, and used as
    /// the handle of timer and loop messages.
    pub const INVALID: Self = Self(-1);

    #[inline]
    pub fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl From<i32> for Handle {
    #[inline]
    fn from(fd: i32) -> Self {
        Self(fd)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
