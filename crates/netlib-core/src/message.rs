//! Callback messages and handler binding.
//!
//! A caller registers a function together with its own context value. The
//! pair is erased into a [`SharedHandler`] at registration time, so the core
//! never sees (or casts) the context type; the function receives it back as
//! a typed `&C` on every delivery.
//!
//! Accepted connections share their listener's handler (an `Rc` clone).

use std::fmt;
use std::rc::Rc;

use crate::endpoint::Endpoint;
use crate::handle::Handle;

/// What a callback invocation is about.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// A listener accepted a new connection; `handle` is the new socket.
    Connect = 1,
    /// An outbound connect completed.
    Confirm = 2,
    /// Bytes are waiting to be `recv`'d.
    Read = 3,
    /// The socket drained its send buffer after a `WouldBlock`.
    Write = 4,
    /// The connection failed or the peer went away.
    Close = 5,
    /// A repeating timer fired.
    Timer = 6,
    /// One dispatch pass finished.
    Loop = 7,
}

/// Timer or loop-callback registration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Extra data carried by some messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload<'a> {
    /// Peer address of a freshly accepted connection (`Connect`).
    Peer(&'a Endpoint),
    /// The registration that fired (`Timer`, `Loop`).
    Timer(TimerId),
}

/// Receives messages for one or more handles.
pub trait EventHandler {
    fn on_event(&self, kind: MessageKind, handle: Handle, payload: Option<Payload<'_>>);
}

/// Shared, type-erased handler as stored by the core.
pub type SharedHandler = Rc<dyn EventHandler>;

/// A callback function bound to its context value.
pub struct Callback<C, F> {
    context: C,
    func: F,
}

impl<C, F> Callback<C, F>
where
    F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>),
{
    pub fn new(func: F, context: C) -> Self {
        Self { context, func }
    }
}

impl<C, F> EventHandler for Callback<C, F>
where
    F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>),
{
    #[inline]
    fn on_event(&self, kind: MessageKind, handle: Handle, payload: Option<Payload<'_>>) {
        (self.func)(&self.context, kind, handle, payload)
    }
}

/// Bind `func` to `context` and erase the pair.
pub fn handler<C, F>(func: F, context: C) -> SharedHandler
where
    C: 'static,
    F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>) + 'static,
{
    Rc::new(Callback::new(func, context))
}
