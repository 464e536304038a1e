//! # netlib — Reactor-style non-blocking TCP
//!
//! A per-connection state machine (listen / connect / accept / send / recv /
//! close) driven by readiness from a poller, plus the handle → connection
//! registry that owns every live socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          User Code                                       │
//! │   callback(ctx, kind, handle, payload)                   │
//! │   NetLib::instance().send(h, bytes)                      │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ listen / connect / send / recv / close
//!                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         NetLib facade (process-wide)                     │
//! │   dispatch-thread check, cross-thread command queue      │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │
//! ┌──────────────────▼──────────────────────────────────────┐
//! │         Reactor<T: Transport, P: Poller>                 │
//! │   SocketRegistry ── Connection state machine            │
//! │   TimerQueue     ── Timer / Loop messages                │
//! └───────────┬──────────────────────────┬──────────────────┘
//!             │ socket calls             │ interest / poll
//!   ┌─────────▼─────────┐      ┌─────────▼─────────┐
//!   │ SysTransport      │      │ EpollPoller       │
//!   │ (MockTransport)   │      │ (PollPoller/Mock) │
//!   └───────────────────┘      └───────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use netlib::{MessageKind, NetLib};
//!
//! let lib = NetLib::instance();
//! lib.listen("0.0.0.0", 7000, |_: &(), kind, handle, _| {
//!     let lib = NetLib::instance();
//!     match kind {
//!         MessageKind::Read => {
//!             let data = lib.recv(handle).unwrap_or_default();
//!             let _ = lib.send(handle, &data);
//!         }
//!         MessageKind::Close => {}
//!         _ => {}
//!     }
//! }, ())?;
//! lib.run()?;
//! ```
//!
//! ## Design Decisions
//!
//! - **Registry owns connections**: everything else holds a `Handle`
//! - **No borrow across a callback**: callbacks may re-enter the reactor
//! - **Accept drains**: one readable event accepts until `WouldBlock`
//! - **No send buffering**: `send` returns 0 on `WouldBlock` and a `Write`
//!   message says when to retry
//! - **Single dispatch thread**: other threads post through an `ArrayQueue`

pub mod connection;
pub mod facade;
pub mod reactor;
pub mod registry;
pub mod timer;

pub use connection::{ConnId, Connection};
pub use facade::{Command, NetLib, SysReactor};
pub use reactor::Reactor;
pub use registry::SocketRegistry;
pub use timer::TimerQueue;

pub use netlib_core::{
    handler, Callback, ConnectionState, Endpoint, EventHandler, Handle, Interest, MessageKind,
    NetConfig, NetError, Payload, Readiness, Result, SharedHandler, TimerId,
};
