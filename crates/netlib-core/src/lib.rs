//! # netlib-core — Contracts for the netlib reactor
//!
//! This crate defines the vocabulary shared by every netlib component and
//! the two trait seams the state machine is written against:
//!
//! - [`Transport`](transport::Transport): raw, non-blocking socket primitives
//! - [`Poller`](poller::Poller): the readiness multiplexer
//!
//! Nothing in here touches the OS. Default implementations live in
//! `netlib-module`; the state machine and dispatch loop live in `netlib`.
//!
//! ## Modules
//!
//! - `handle` - native socket handle
//! - `endpoint` - address/port pairs
//! - `interest` - interest and readiness sets
//! - `state` - connection lifecycle states
//! - `message` - callback message kinds, payloads and handler binding
//! - `transport` - socket primitive contract
//! - `poller` - multiplexer contract
//! - `config` - tunables and typed configuration lookup
//! - `error` - error type

pub mod handle;
pub mod endpoint;
pub mod interest;
pub mod state;
pub mod message;
pub mod transport;
pub mod poller;
pub mod config;
pub mod error;

pub use config::NetConfig;
pub use endpoint::Endpoint;
pub use error::{NetError, Result};
pub use handle::Handle;
pub use interest::{Interest, Readiness};
pub use message::{handler, Callback, EventHandler, MessageKind, Payload, SharedHandler, TimerId};
pub use poller::Poller;
pub use state::ConnectionState;
pub use transport::{AcceptOutcome, ConnectOutcome, SendOutcome, Transport};

pub use nix::errno::Errno;
