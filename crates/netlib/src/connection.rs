//! Connection — the per-socket state machine.
//!
//! ```text
//!            listen()                 readable: accept loop
//!   Idle ──────────────▶ Listening ◀──────────────────────┐
//!    │                       └────────────────────────────┘
//!    │ connect()                writable, SO_ERROR == 0
//!    └─────────▶ Connecting ─────────────────────────▶ Connected
//!                    │ writable, SO_ERROR != 0            │ readable, 0 bytes
//!                    ▼                                    ▼
//!                 Closing ◀──────────── error / close() ──┘
//! ```
//!
//! A `Connection` never calls back into user code and never touches the
//! registry or the poller. Event handlers return what should be delivered;
//! the reactor does the delivering once it has released its borrows.

use std::fmt;

use netlib_core::config::clamp_buf_size;
use netlib_core::{
    ConnectionState, Endpoint, Errno, Handle, Interest, MessageKind, NetConfig, NetError, Result,
    SendOutcome, SharedHandler, Transport,
};
use tracing::{debug, error, info, trace, warn};

/// Per-connection generation number.
///
/// Handles are reused by the OS; the id is not. The reactor uses it to tell
/// "the connection I delivered `Close` for" from "a new connection that got
/// the same handle during the callback".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// What a readable event asks the reactor to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAction {
    /// Run the accept loop on this listener.
    Accept,
    /// Deliver a message to the connection's callback.
    Deliver(MessageKind),
    /// Nothing to do in this state.
    Ignore,
}

pub struct Connection {
    id: ConnId,
    handle: Handle,
    state: ConnectionState,
    local: Endpoint,
    remote: Endpoint,
    handler: SharedHandler,
    interest: Interest,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("state", &self.state)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("interest", &self.interest)
            .finish_non_exhaustive()
    }
}

/// Apply a best-effort option, logging a failure.
fn best_effort(handle: Handle, option: &'static str, res: std::result::Result<(), Errno>) {
    if let Err(errno) = res {
        warn!(handle = %handle, errno = %errno, option, "socket option failed");
    }
}

fn apply_buf_sizes<T: Transport>(transport: &T, handle: Handle, config: &NetConfig) {
    if config.send_buf_size > 0 {
        let size = clamp_buf_size(config.send_buf_size);
        best_effort(handle, "SO_SNDBUF", transport.set_send_buf(handle, size));
    }
    if config.recv_buf_size > 0 {
        let size = clamp_buf_size(config.recv_buf_size);
        best_effort(handle, "SO_RCVBUF", transport.set_recv_buf(handle, size));
    }
}

fn create_socket<T: Transport>(transport: &T) -> Result<Handle> {
    transport.create_stream_socket().map_err(|errno| {
        error!(errno = %errno, "socket create failed");
        NetError::Socket(errno)
    })
}

impl Connection {
    fn new(id: ConnId, handle: Handle, handler: SharedHandler) -> Self {
        Self {
            id,
            handle,
            state: ConnectionState::Idle,
            local: Endpoint::default(),
            remote: Endpoint::default(),
            handler,
            interest: Interest::NONE,
        }
    }

    /// Create a listening socket on `endpoint`.
    ///
    /// On failure the socket (if created) is closed and nothing is left
    /// behind.
    pub fn listen<T: Transport>(
        transport: &T,
        id: ConnId,
        endpoint: &Endpoint,
        config: &NetConfig,
        handler: SharedHandler,
    ) -> Result<Self> {
        let handle = create_socket(transport)?;
        let mut conn = Self::new(id, handle, handler);

        best_effort(handle, "SO_REUSEADDR", transport.set_reuse_addr(handle));
        best_effort(handle, "O_NONBLOCK", transport.set_non_blocking(handle));

        if let Err(errno) = transport.bind(handle, endpoint) {
            error!(handle = %handle, endpoint = %endpoint, errno = %errno, "bind failed");
            transport.close(handle);
            return Err(NetError::Bind { endpoint: endpoint.clone(), errno });
        }
        if let Err(errno) = transport.listen(handle, config.backlog) {
            error!(handle = %handle, endpoint = %endpoint, errno = %errno, "listen failed");
            transport.close(handle);
            return Err(NetError::Listen { endpoint: endpoint.clone(), errno });
        }

        conn.local = transport.local_endpoint(handle).unwrap_or_else(|_| endpoint.clone());
        conn.interest = Interest::READABLE | Interest::ERROR;
        conn.set_state(ConnectionState::Listening);
        Ok(conn)
    }

    /// Start a non-blocking connect to `endpoint`.
    ///
    /// Any outcome other than a synchronous failure enters `Connecting`;
    /// the first writable event settles it, even on an immediate success.
    pub fn connect<T: Transport>(
        transport: &T,
        id: ConnId,
        endpoint: &Endpoint,
        config: &NetConfig,
        handler: SharedHandler,
    ) -> Result<Self> {
        let handle = create_socket(transport)?;
        let mut conn = Self::new(id, handle, handler);

        best_effort(handle, "O_NONBLOCK", transport.set_non_blocking(handle));
        best_effort(handle, "TCP_NODELAY", transport.set_no_delay(handle));
        apply_buf_sizes(transport, handle, config);

        match transport.connect(handle, endpoint) {
            Ok(outcome) => {
                debug!(handle = %handle, endpoint = %endpoint, ?outcome, "connect issued");
            }
            Err(errno) => {
                warn!(handle = %handle, endpoint = %endpoint, errno = %errno, "connect failed");
                transport.close(handle);
                return Err(NetError::Connect { endpoint: endpoint.clone(), errno });
            }
        }

        conn.remote = endpoint.clone();
        conn.interest = Interest::ALL;
        conn.set_state(ConnectionState::Connecting);
        Ok(conn)
    }

    /// Wrap a socket returned by `accept`. Accepted sockets are already
    /// established, so the connection starts out `Connected`.
    pub fn accepted<T: Transport>(
        transport: &T,
        id: ConnId,
        handle: Handle,
        peer: Endpoint,
        local: Endpoint,
        config: &NetConfig,
        handler: SharedHandler,
    ) -> Self {
        best_effort(handle, "O_NONBLOCK", transport.set_non_blocking(handle));
        best_effort(handle, "TCP_NODELAY", transport.set_no_delay(handle));
        apply_buf_sizes(transport, handle, config);

        let mut conn = Self::new(id, handle, handler);
        conn.local = local;
        conn.remote = peer;
        conn.interest = Interest::READABLE | Interest::ERROR;
        conn.set_state(ConnectionState::Connected);
        conn
    }

    // -- accessors --

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn handle(&self) -> Handle {
        self.handle
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local(&self) -> &Endpoint {
        &self.local
    }

    pub fn remote(&self) -> &Endpoint {
        &self.remote
    }

    /// A new reference to the event handler.
    pub fn handler(&self) -> SharedHandler {
        self.handler.clone()
    }

    pub fn set_handler(&mut self, handler: SharedHandler) {
        self.handler = handler;
    }

    /// Interest currently registered with the poller.
    #[inline]
    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn set_interest(&mut self, interest: Interest) {
        self.interest = interest;
    }

    pub(crate) fn set_state(&mut self, next: ConnectionState) {
        trace!(handle = %self.handle, from = %self.state, to = %next, "state");
        self.state = next;
    }

    fn require(&self, expected: ConnectionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(NetError::InvalidState {
                handle: self.handle,
                expected,
                actual: self.state,
            })
        }
    }

    // -- operations --

    /// One non-blocking write. `WouldBlock` is passed through for the
    /// reactor to arm write interest.
    pub fn send<T: Transport>(&self, transport: &T, data: &[u8]) -> Result<SendOutcome> {
        self.require(ConnectionState::Connected)?;
        transport.send(self.handle, data).map_err(|errno| {
            warn!(handle = %self.handle, errno = %errno, "send failed");
            NetError::Send { handle: self.handle, errno }
        })
    }

    /// One bounded read of at most `max_len` bytes.
    pub fn recv<T: Transport>(&self, transport: &T, max_len: usize) -> Result<Vec<u8>> {
        self.require(ConnectionState::Connected)?;
        transport.recv(self.handle, max_len).map_err(|errno| {
            warn!(handle = %self.handle, errno = %errno, "recv failed");
            NetError::Recv { handle: self.handle, errno }
        })
    }

    // -- readiness --

    pub fn on_readable<T: Transport>(&mut self, transport: &T) -> ReadAction {
        match self.state {
            ConnectionState::Listening => ReadAction::Accept,
            ConnectionState::Connected => match transport.available_bytes(self.handle) {
                Ok(n) if n > 0 => ReadAction::Deliver(MessageKind::Read),
                Ok(_) => {
                    debug!(handle = %self.handle, remote = %self.remote, "peer closed");
                    self.set_state(ConnectionState::Closing);
                    ReadAction::Deliver(MessageKind::Close)
                }
                Err(errno) => {
                    warn!(handle = %self.handle, errno = %errno, "FIONREAD failed");
                    self.set_state(ConnectionState::Closing);
                    ReadAction::Deliver(MessageKind::Close)
                }
            },
            // Connecting: the writable event decides; data stays queued.
            _ => ReadAction::Ignore,
        }
    }

    pub fn on_writable<T: Transport>(&mut self, transport: &T) -> Option<MessageKind> {
        match self.state {
            ConnectionState::Connecting => match transport.socket_error(self.handle) {
                Ok(()) => {
                    info!(handle = %self.handle, remote = %self.remote, "connect confirmed");
                    self.set_state(ConnectionState::Connected);
                    Some(MessageKind::Confirm)
                }
                Err(errno) => {
                    warn!(handle = %self.handle, remote = %self.remote, errno = %errno, "connect failed");
                    self.set_state(ConnectionState::Closing);
                    Some(MessageKind::Close)
                }
            },
            ConnectionState::Connected => Some(MessageKind::Write),
            _ => None,
        }
    }

    pub fn on_error<T: Transport>(&mut self, transport: &T) -> Option<MessageKind> {
        match self.state {
            ConnectionState::Idle | ConnectionState::Closing => None,
            state => {
                let errno = transport.socket_error(self.handle).err();
                warn!(handle = %self.handle, %state, ?errno, "socket error");
                self.set_state(ConnectionState::Closing);
                Some(MessageKind::Close)
            }
        }
    }
}
