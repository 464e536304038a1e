//! # Reactor — readiness dispatch over a socket registry
//!
//! One reactor owns one [`SocketRegistry`], one [`Poller`] and one
//! [`TimerQueue`], and runs on exactly one thread. A pass looks like:
//!
//! ```text
//!   dispatch_once(timeout)
//!     │
//!     ├─ poll(min(timeout, next timer deadline))
//!     ├─ for each (handle, ready) in reported order:
//!     │     readable  → accept loop | Read | Close
//!     │     writable  → Confirm | Close | Write
//!     │     error     → Close
//!     ├─ fire due timers        (Timer, Handle::INVALID)
//!     └─ fire loop callbacks    (Loop,  Handle::INVALID)
//! ```
//!
//! ## Re-entrancy
//!
//! All methods take `&self`. State lives behind a `RefCell` that is never
//! borrowed while user code runs: each step decides what to deliver under
//! the borrow, drops it, then invokes the callback. Callbacks may therefore
//! call straight back into the reactor (send, close, listen, ...).
//!
//! ## Close
//!
//! `close()` releases a connection immediately: deregister, registry
//! remove, native close. When an *event* moves a connection to `Closing`,
//! it stays registered while its `Close` callback runs and is released
//! right after, unless the callback already closed it. Every handle
//! released during a pass is remembered until the pass ends and its
//! remaining readiness entries are dropped.

use std::cell::RefCell;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use netlib_core::config::clamp_buf_size;
use netlib_core::{
    AcceptOutcome, ConnectionState, Endpoint, Errno, Handle, Interest, MessageKind, NetConfig,
    NetError, Payload, Poller, Readiness, Result, SendOutcome, SharedHandler, TimerId, Transport,
};
use tracing::{debug, error, info, trace, warn};

use crate::connection::{ConnId, Connection, ReadAction};
use crate::registry::SocketRegistry;
use crate::timer::TimerQueue;

struct Inner<P> {
    poller: P,
    registry: SocketRegistry<Connection>,
    timers: TimerQueue,
    /// Handles released during the current pass.
    released: HashSet<Handle>,
    /// Reused readiness buffer.
    events: Vec<Readiness>,
    /// Listeners with read interest paused, and when to restore it.
    paused: Vec<(Handle, ConnId, Instant)>,
    next_conn: u64,
}

impl<P: Poller> Inner<P> {
    fn next_id(&mut self) -> ConnId {
        let id = ConnId(self.next_conn);
        self.next_conn += 1;
        id
    }

    /// Register `conn` with the poller and the registry. On failure the
    /// connection's socket is closed.
    fn install<T: Transport>(&mut self, transport: &T, conn: Connection) -> Result<Handle> {
        let handle = conn.handle();
        if self.registry.contains(handle) {
            error!(handle = %handle, fatal = true, "handle already owned by a live connection");
            transport.close(handle);
            return Err(NetError::AlreadyExists(handle));
        }
        if let Err(errno) = self.poller.register(handle, conn.interest()) {
            error!(handle = %handle, errno = %errno, "poller register failed");
            transport.close(handle);
            return Err(NetError::Poller(errno));
        }
        self.registry.insert(handle, conn)?;
        Ok(handle)
    }

    /// Deregister, remove and close. `None` if `handle` is not registered.
    fn release<T: Transport>(&mut self, transport: &T, handle: Handle) -> Option<Connection> {
        let mut conn = self.registry.remove(handle)?;
        if let Err(errno) = self.poller.deregister(handle) {
            warn!(handle = %handle, errno = %errno, "poller deregister failed");
        }
        transport.close(handle);
        self.released.insert(handle);
        info!(handle = %handle, state = %conn.state(), remote = %conn.remote(), "closed");
        conn.set_state(ConnectionState::Closing);
        Some(conn)
    }

    /// Is `handle` still eligible for event processing in this pass?
    fn is_live(&self, handle: Handle) -> bool {
        if self.released.contains(&handle) {
            trace!(handle = %handle, "dropping event for handle released this pass");
            return false;
        }
        match self.registry.lookup(handle) {
            Ok(conn) => !conn.state().is_terminal(),
            Err(_) => {
                trace!(handle = %handle, "dropping event for unregistered handle");
                false
            }
        }
    }

    fn set_interest(&mut self, handle: Handle, interest: Interest) -> Result<()> {
        let conn = self.registry.lookup_mut(handle)?;
        if conn.interest() == interest {
            return Ok(());
        }
        self.poller.reregister(handle, interest).map_err(|errno| {
            warn!(handle = %handle, errno = %errno, ?interest, "poller reregister failed");
            NetError::Poller(errno)
        })?;
        conn.set_interest(interest);
        Ok(())
    }

    /// Stop watching `listener` for readability until `until`.
    fn pause_listener(&mut self, listener: Handle, until: Instant) {
        let Ok(conn) = self.registry.lookup(listener) else {
            return;
        };
        let (id, interest) = (conn.id(), conn.interest());
        if self.set_interest(listener, interest.remove(Interest::READABLE)).is_ok() {
            self.paused.push((listener, id, until));
        }
    }

    /// Restore read interest on listeners whose pause has run out.
    fn resume_listeners(&mut self, now: Instant) {
        if self.paused.is_empty() {
            return;
        }
        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.paused).into_iter().partition(|(_, _, until)| *until <= now);
        self.paused = waiting;
        for (handle, id, _) in due {
            let interest = match self.registry.lookup(handle) {
                Ok(conn) if conn.id() == id && conn.state() == ConnectionState::Listening => {
                    conn.interest()
                }
                _ => continue,
            };
            if self.set_interest(handle, interest.add(Interest::READABLE)).is_ok() {
                debug!(listener = %handle, "accepting again");
            }
        }
    }

    /// Earliest timer deadline or listener resume.
    fn next_wakeup(&mut self) -> Option<Instant> {
        let resume = self.paused.iter().map(|(_, _, until)| *until).min();
        match (self.timers.next_deadline(), resume) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Single-threaded reactor, generic over the socket layer and the poller.
pub struct Reactor<T: Transport, P: Poller> {
    transport: T,
    config: NetConfig,
    inner: RefCell<Inner<P>>,
}

impl<T: Transport, P: Poller> Reactor<T, P> {
    pub fn new(transport: T, poller: P, config: NetConfig) -> Self {
        Self {
            transport,
            inner: RefCell::new(Inner {
                poller,
                registry: SocketRegistry::new(),
                timers: TimerQueue::new(),
                released: HashSet::new(),
                events: Vec::with_capacity(config.max_events),
                paused: Vec::new(),
                next_conn: 1,
            }),
            config,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    // ========================================================================
    // Entry operations
    // ========================================================================

    /// Open a listener on `endpoint`. Accepted connections share `handler`.
    pub fn listen(&self, endpoint: &Endpoint, handler: SharedHandler) -> Result<Handle> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        let conn = Connection::listen(&self.transport, id, endpoint, &self.config, handler)?;
        let local = conn.local().clone();
        let handle = inner.install(&self.transport, conn)?;
        info!(handle = %handle, endpoint = %local, "listening");
        Ok(handle)
    }

    /// Start an outbound connection. The outcome arrives as `Confirm` or
    /// `Close`.
    pub fn connect(&self, endpoint: &Endpoint, handler: SharedHandler) -> Result<Handle> {
        let mut inner = self.inner.borrow_mut();
        let id = inner.next_id();
        let conn = Connection::connect(&self.transport, id, endpoint, &self.config, handler)?;
        inner.install(&self.transport, conn)
    }

    /// One non-blocking write. Returns the bytes accepted; 0 means the
    /// socket buffer is full and a `Write` message will follow.
    pub fn send(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let conn = inner.registry.lookup(handle)?;
        let interest = conn.interest();
        match conn.send(&self.transport, data)? {
            SendOutcome::Written(n) => Ok(n),
            SendOutcome::WouldBlock => {
                debug!(handle = %handle, len = data.len(), "send would block, arming write interest");
                inner.set_interest(handle, interest.add(Interest::WRITABLE))?;
                Ok(0)
            }
        }
    }

    /// One bounded read (`recv_chunk` bytes at most).
    pub fn recv(&self, handle: Handle) -> Result<Vec<u8>> {
        let inner = self.inner.borrow();
        inner
            .registry
            .lookup(handle)?
            .recv(&self.transport, self.config.recv_chunk)
    }

    /// Release `handle`. A handle that is no longer registered reports
    /// `NotFound` and nothing else happens.
    pub fn close(&self, handle: Handle) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match inner.release(&self.transport, handle) {
            Some(_) => Ok(()),
            None => {
                debug!(handle = %handle, "close on unregistered handle");
                Err(NetError::NotFound(handle))
            }
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Deliver `Timer` to `handler` every `interval`.
    pub fn register_timer(&self, handler: SharedHandler, interval: Duration) -> Result<TimerId> {
        let id = self.inner.borrow_mut().timers.add(handler, interval, Instant::now())?;
        debug!(timer = %id, ?interval, "timer registered");
        Ok(id)
    }

    /// Deliver `Loop` to `handler` at the end of every pass.
    pub fn register_loop(&self, handler: SharedHandler) -> TimerId {
        self.inner.borrow_mut().timers.add_loop(handler)
    }

    /// Cancel a timer or loop callback. It never fires again, even if it is
    /// already due in the current pass.
    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.inner.borrow_mut().timers.cancel(id)
    }

    // ========================================================================
    // Connection options
    // ========================================================================

    pub fn set_callback(&self, handle: Handle, handler: SharedHandler) -> Result<()> {
        self.inner.borrow_mut().registry.lookup_mut(handle)?.set_handler(handler);
        Ok(())
    }

    pub fn remote_endpoint(&self, handle: Handle) -> Result<Endpoint> {
        Ok(self.inner.borrow().registry.lookup(handle)?.remote().clone())
    }

    pub fn local_endpoint(&self, handle: Handle) -> Result<Endpoint> {
        Ok(self.inner.borrow().registry.lookup(handle)?.local().clone())
    }

    /// Best effort; `size` is clamped to the socket buffer limit.
    pub fn set_send_buf_size(&self, handle: Handle, size: u32) -> Result<()> {
        self.inner.borrow().registry.lookup(handle)?;
        if let Err(errno) = self.transport.set_send_buf(handle, clamp_buf_size(size)) {
            warn!(handle = %handle, errno = %errno, size, "SO_SNDBUF failed");
        }
        Ok(())
    }

    /// Best effort; `size` is clamped to the socket buffer limit.
    pub fn set_recv_buf_size(&self, handle: Handle, size: u32) -> Result<()> {
        self.inner.borrow().registry.lookup(handle)?;
        if let Err(errno) = self.transport.set_recv_buf(handle, clamp_buf_size(size)) {
            warn!(handle = %handle, errno = %errno, size, "SO_RCVBUF failed");
        }
        Ok(())
    }

    pub fn state(&self, handle: Handle) -> Result<ConnectionState> {
        Ok(self.inner.borrow().registry.lookup(handle)?.state())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.borrow().registry.contains(handle)
    }

    /// Registered connections, listeners included.
    pub fn connection_count(&self) -> usize {
        self.inner.borrow().registry.len()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run one pass. `None` waits until something is ready or a timer is
    /// due. Returns the number of readiness entries processed.
    pub fn dispatch_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let events = {
            let mut inner = self.inner.borrow_mut();
            inner.resume_listeners(Instant::now());
            let wait = match inner.next_wakeup() {
                Some(deadline) => {
                    let until = deadline.saturating_duration_since(Instant::now());
                    Some(timeout.map_or(until, |t| t.min(until)))
                }
                None => timeout,
            };

            let mut events = std::mem::take(&mut inner.events);
            if let Err(errno) = inner.poller.poll(&mut events, wait) {
                inner.events = events;
                error!(errno = %errno, "poll failed");
                return Err(NetError::Poller(errno));
            }
            inner.released.clear();
            events
        };

        for ev in &events {
            self.process(*ev);
        }
        self.fire_timers();
        self.fire_loops();

        let n = events.len();
        let mut inner = self.inner.borrow_mut();
        inner.released.clear();
        inner.events = events;
        Ok(n)
    }

    fn process(&self, ev: Readiness) {
        trace!(handle = %ev.handle, ready = ?ev.ready, "readiness");
        if ev.ready.is_readable() {
            self.readable(ev.handle);
        }
        if ev.ready.is_writable() {
            self.writable(ev.handle);
        }
        if ev.ready.is_error() {
            self.errored(ev.handle);
        }
    }

    fn readable(&self, handle: Handle) {
        let (action, handler, id) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.is_live(handle) {
                return;
            }
            let Ok(conn) = inner.registry.lookup_mut(handle) else {
                return;
            };
            (conn.on_readable(&self.transport), conn.handler(), conn.id())
        };

        match action {
            ReadAction::Accept => self.accept_loop(handle),
            ReadAction::Deliver(kind) => {
                self.deliver(&handler, kind, handle, None);
                if kind == MessageKind::Close {
                    self.finish_close(handle, id);
                }
            }
            ReadAction::Ignore => {}
        }
    }

    fn writable(&self, handle: Handle) {
        let (kind, handler, id) = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if !inner.is_live(handle) {
                return;
            }
            let Ok(conn) = inner.registry.lookup_mut(handle) else {
                return;
            };
            // Level-triggered: drop write interest until a send blocks again.
            // A connection that cannot be disarmed would report writable on
            // every pass, so it is closed instead.
            let interest = conn.interest();
            let disarmed = !interest.is_writable()
                || inner.set_interest(handle, interest.remove(Interest::WRITABLE)).is_ok();
            let Ok(conn) = inner.registry.lookup_mut(handle) else {
                return;
            };
            if !disarmed {
                error!(handle = %handle, state = %conn.state(), "cannot drop write interest, closing");
                conn.set_state(ConnectionState::Closing);
                (MessageKind::Close, conn.handler(), conn.id())
            } else {
                match conn.on_writable(&self.transport) {
                    Some(kind) => (kind, conn.handler(), conn.id()),
                    None => return,
                }
            }
        };

        self.deliver(&handler, kind, handle, None);
        if kind == MessageKind::Close {
            self.finish_close(handle, id);
        }
    }

    fn errored(&self, handle: Handle) {
        let (kind, handler, id) = {
            let mut inner = self.inner.borrow_mut();
            if !inner.is_live(handle) {
                return;
            }
            let Ok(conn) = inner.registry.lookup_mut(handle) else {
                return;
            };
            match conn.on_error(&self.transport) {
                Some(kind) => (kind, conn.handler(), conn.id()),
                None => return,
            }
        };

        self.deliver(&handler, kind, handle, None);
        self.finish_close(handle, id);
    }

    /// Release a connection after its `Close` callback, unless the callback
    /// already did (possibly handing the handle to a new connection).
    fn finish_close(&self, handle: Handle, id: ConnId) {
        let mut inner = self.inner.borrow_mut();
        let pending = matches!(
            inner.registry.lookup(handle),
            Ok(conn) if conn.id() == id && conn.state() == ConnectionState::Closing
        );
        if pending {
            inner.release(&self.transport, handle);
        }
    }

    /// Accept until the listener reports `WouldBlock`.
    fn accept_loop(&self, listener: Handle) {
        loop {
            let (handler, handle, peer) = {
                let mut inner = self.inner.borrow_mut();
                // A Connect callback may have closed the listener.
                let (handler, local) = match inner.registry.lookup(listener) {
                    Ok(conn) if conn.state() == ConnectionState::Listening => {
                        (conn.handler(), conn.local().clone())
                    }
                    _ => return,
                };

                match self.transport.accept(listener) {
                    Ok(AcceptOutcome::WouldBlock) => return,
                    Ok(AcceptOutcome::Accepted(handle, peer)) => {
                        let id = inner.next_id();
                        let conn = Connection::accepted(
                            &self.transport,
                            id,
                            handle,
                            peer.clone(),
                            local,
                            &self.config,
                            handler.clone(),
                        );
                        if let Err(e) = inner.install(&self.transport, conn) {
                            warn!(listener = %listener, handle = %handle, error = %e, "dropping accepted connection");
                            continue;
                        }
                        info!(listener = %listener, handle = %handle, peer = %peer, "accepted");
                        (handler, handle, peer)
                    }
                    Err(errno) if errno == Errno::EINTR || errno == Errno::ECONNABORTED => continue,
                    Err(errno) if is_out_of_resources(errno) => {
                        // Level-triggered: the listener stays readable while
                        // the backlog is full, so stop asking for a while.
                        let backoff = self.config.accept_backoff;
                        warn!(listener = %listener, errno = %errno, ?backoff, "accept out of resources, pausing listener");
                        inner.pause_listener(listener, Instant::now() + backoff);
                        return;
                    }
                    Err(errno) => {
                        warn!(listener = %listener, errno = %errno, "accept failed");
                        return;
                    }
                }
            };

            self.deliver(&handler, MessageKind::Connect, handle, Some(Payload::Peer(&peer)));
        }
    }

    fn fire_timers(&self) {
        let due = self.inner.borrow_mut().timers.pop_due(Instant::now());
        for (id, handler) in due {
            // An earlier callback in this pass may have cancelled it.
            if self.inner.borrow().timers.is_active(id) {
                self.deliver(&handler, MessageKind::Timer, Handle::INVALID, Some(Payload::Timer(id)));
            }
        }
    }

    fn fire_loops(&self) {
        let loops = self.inner.borrow().timers.loop_handlers();
        for (id, handler) in loops {
            if self.inner.borrow().timers.is_active(id) {
                self.deliver(&handler, MessageKind::Loop, Handle::INVALID, Some(Payload::Timer(id)));
            }
        }
    }

    /// Invoke a callback with no borrow held. A panic is logged and
    /// contained so the rest of the batch still runs.
    fn deliver(&self, handler: &SharedHandler, kind: MessageKind, handle: Handle, payload: Option<Payload<'_>>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_event(kind, handle, payload)));
        if let Err(cause) = result {
            let msg = cause
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| cause.downcast_ref::<String>().cloned())
                .unwrap_or_default();
            error!(handle = %handle, ?kind, panic = %msg, "callback panicked");
        }
    }
}

fn is_out_of_resources(errno: Errno) -> bool {
    matches!(errno, Errno::EMFILE | Errno::ENFILE | Errno::ENOBUFS | Errno::ENOMEM)
}

impl<T: Transport, P: Poller> Drop for Reactor<T, P> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let handles: Vec<Handle> = inner.registry.handles().collect();
        if !handles.is_empty() {
            debug!(count = handles.len(), "reactor dropped, closing remaining sockets");
        }
        for handle in handles {
            inner.release(&self.transport, handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlib_core::{handler, ConnectOutcome};
    use netlib_module::mock::{MockOption, MockPoller, MockTransport};
    use std::cell::Cell;
    use std::rc::{Rc, Weak};

    type TestReactor = Reactor<MockTransport, MockPoller>;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Seen {
        Connect(Handle, Endpoint),
        Confirm(Handle),
        Read(Handle),
        Write(Handle),
        Close(Handle),
        Timer(TimerId),
        Loop(TimerId),
    }

    type Log = Rc<RefCell<Vec<Seen>>>;

    /// What a test callback does after logging.
    #[derive(Clone, Copy)]
    enum Then {
        Nothing,
        CloseOnClose,
        CloseOnRead,
        CloseOnConnect,
        Panic,
    }

    struct Ctx {
        log: Log,
        reactor: Weak<TestReactor>,
        then: Then,
    }

    struct Harness {
        transport: MockTransport,
        poller: MockPoller,
        reactor: Rc<TestReactor>,
        log: Log,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(NetConfig::default())
        }

        fn with_config(config: NetConfig) -> Self {
            let transport = MockTransport::new();
            let poller = MockPoller::new();
            let reactor = Rc::new(Reactor::new(transport.clone(), poller.clone(), config));
            Self { transport, poller, reactor, log: Rc::default() }
        }

        fn handler(&self, then: Then) -> SharedHandler {
            let ctx = Ctx { log: self.log.clone(), reactor: Rc::downgrade(&self.reactor), then };
            handler(on_event, ctx)
        }

        fn listen(&self) -> Handle {
            self.reactor
                .listen(&Endpoint::new("0.0.0.0", 7000), self.handler(Then::Nothing))
                .unwrap()
        }

        fn listen_with(&self, then: Then) -> Handle {
            self.reactor.listen(&Endpoint::new("0.0.0.0", 7000), self.handler(then)).unwrap()
        }

        /// A listener plus one accepted connection; returns the accepted handle.
        fn accepted(&self, then: Then) -> Handle {
            let l = self.listen_with(then);
            self.transport.queue_accepts(l, [peer(1)]);
            self.poller.push_ready(l, Interest::READABLE);
            self.pass();
            self.log.borrow_mut().clear();
            Handle(l.raw() + 1)
        }

        fn pass(&self) -> usize {
            self.reactor.dispatch_once(Some(Duration::ZERO)).unwrap()
        }

        fn seen(&self) -> Vec<Seen> {
            self.log.borrow().clone()
        }
    }

    fn on_event(ctx: &Ctx, kind: MessageKind, handle: Handle, payload: Option<Payload<'_>>) {
        let seen = match (kind, payload) {
            (MessageKind::Connect, Some(Payload::Peer(p))) => Seen::Connect(handle, p.clone()),
            (MessageKind::Confirm, _) => Seen::Confirm(handle),
            (MessageKind::Read, _) => Seen::Read(handle),
            (MessageKind::Write, _) => Seen::Write(handle),
            (MessageKind::Close, _) => Seen::Close(handle),
            (MessageKind::Timer, Some(Payload::Timer(id))) => Seen::Timer(id),
            (MessageKind::Loop, Some(Payload::Timer(id))) => Seen::Loop(id),
            other => panic!("unexpected message {other:?}"),
        };
        ctx.log.borrow_mut().push(seen);

        let Some(reactor) = ctx.reactor.upgrade() else { return };
        match (ctx.then, kind) {
            (Then::CloseOnClose, MessageKind::Close)
            | (Then::CloseOnRead, MessageKind::Read)
            | (Then::CloseOnConnect, MessageKind::Connect) => {
                reactor.close(handle).unwrap();
            }
            (Then::Panic, MessageKind::Read) => panic!("callback failure"),
            _ => {}
        }
    }

    /// Logs like `on_event`, then cancels whatever `victim` names.
    fn cancelling(h: &Harness, victim: Rc<Cell<Option<TimerId>>>) -> SharedHandler {
        let log = h.log.clone();
        let reactor = Rc::downgrade(&h.reactor);
        handler(
            move |victim: &Rc<Cell<Option<TimerId>>>, kind, _, payload| {
                if let Some(Payload::Timer(id)) = payload {
                    let seen = if kind == MessageKind::Loop { Seen::Loop(id) } else { Seen::Timer(id) };
                    log.borrow_mut().push(seen);
                }
                if let (Some(r), Some(v)) = (reactor.upgrade(), victim.get()) {
                    r.cancel_timer(v);
                }
            },
            victim,
        )
    }

    fn peer(n: u8) -> Endpoint {
        Endpoint::new(format!("10.0.0.{n}"), 5000 + n as u16)
    }

    // -- listen / connect --

    #[test]
    fn test_listen_registers_read_interest() {
        let h = Harness::new();
        let l = h.listen();
        assert_eq!(h.reactor.state(l).unwrap(), ConnectionState::Listening);
        assert_eq!(h.poller.interest(l), Some(Interest::READABLE | Interest::ERROR));
        assert_eq!(h.reactor.local_endpoint(l).unwrap(), Endpoint::new("0.0.0.0", 7000));
    }

    #[test]
    fn test_listen_failure_registers_nothing() {
        let h = Harness::new();
        h.transport.fail_next_bind(Errno::EADDRINUSE);
        let err = h.reactor.listen(&Endpoint::new("", 7000), h.handler(Then::Nothing)).unwrap_err();
        assert!(matches!(err, NetError::Bind { .. }));
        assert_eq!(h.reactor.connection_count(), 0);
        assert_eq!(h.poller.registered_count(), 0);
        assert_eq!(h.transport.open_count(), 0);
    }

    #[test]
    fn test_poller_refusal_closes_socket() {
        let h = Harness::new();
        h.poller.fail_next_register(Errno::ENOMEM);
        let err = h.reactor.listen(&Endpoint::new("", 7000), h.handler(Then::Nothing)).unwrap_err();
        assert!(matches!(err, NetError::Poller(Errno::ENOMEM)));
        assert_eq!(h.transport.open_count(), 0);
        assert_eq!(h.reactor.connection_count(), 0);
    }

    #[test]
    fn test_connect_immediate_failure_registers_nothing() {
        let h = Harness::new();
        h.transport.set_connect_result(Err(Errno::ECONNREFUSED));
        let err = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap_err();
        assert!(matches!(err, NetError::Connect { errno: Errno::ECONNREFUSED, .. }));
        assert_eq!(h.reactor.connection_count(), 0);
        assert_eq!(h.transport.close_count(Handle(100)), 1);
    }

    #[test]
    fn test_connect_confirm_routing() {
        let h = Harness::new();
        let c = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap();
        assert_eq!(h.reactor.state(c).unwrap(), ConnectionState::Connecting);
        assert_eq!(h.poller.interest(c), Some(Interest::ALL));
        assert_eq!(h.reactor.remote_endpoint(c).unwrap(), peer(9));

        h.poller.push_ready(c, Interest::WRITABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Confirm(c)]);
        assert_eq!(h.reactor.state(c).unwrap(), ConnectionState::Connected);
        assert_eq!(h.poller.interest(c), Some(Interest::READABLE | Interest::ERROR));
    }

    #[test]
    fn test_immediate_connect_still_confirms_on_writable() {
        let h = Harness::new();
        h.transport.set_connect_result(Ok(ConnectOutcome::Connected));
        let c = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap();
        assert_eq!(h.reactor.state(c).unwrap(), ConnectionState::Connecting);
        h.poller.push_ready(c, Interest::WRITABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Confirm(c)]);
    }

    #[test]
    fn test_connect_failure_routing() {
        let h = Harness::new();
        let c = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap();
        h.transport.set_socket_error(c, Errno::ECONNREFUSED);

        h.poller.push_ready(c, Interest::WRITABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Close(c)]);
        assert!(!h.reactor.contains(c));
        assert_eq!(h.transport.close_count(c), 1);
        assert_eq!(h.poller.deregister_count(c), 1);
    }

    #[test]
    fn test_readable_while_connecting_is_ignored() {
        let h = Harness::new();
        let c = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap();
        h.poller.push_ready(c, Interest::READABLE | Interest::WRITABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Confirm(c)]);
    }

    // -- accept --

    #[test]
    fn test_accept_loop_drains_all_pending() {
        let h = Harness::new();
        let l = h.listen();
        h.transport.queue_accepts(l, (1..=5).map(peer));
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();

        let connects: Vec<Seen> = (1..=5)
            .map(|n| Seen::Connect(Handle(l.raw() + n as i32), peer(n)))
            .collect();
        assert_eq!(h.seen(), connects);
        assert_eq!(h.reactor.connection_count(), 6);
        for n in 1..=5 {
            let a = Handle(l.raw() + n);
            assert_eq!(h.reactor.state(a).unwrap(), ConnectionState::Connected);
            assert_eq!(h.poller.interest(a), Some(Interest::READABLE | Interest::ERROR));
            assert!(h.transport.is_non_blocking(a));
            assert!(h.transport.options(a).contains(&MockOption::NoDelay));
            assert_eq!(h.reactor.remote_endpoint(a).unwrap(), peer(n as u8));
        }
    }

    #[test]
    fn test_accept_survives_transient_errors() {
        let h = Harness::new();
        let l = h.listen();
        h.transport.fail_next_accept(l, Errno::ECONNABORTED);
        h.transport.queue_accepts(l, [peer(1)]);
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Connect(Handle(l.raw() + 1), peer(1))]);
    }

    #[test]
    fn test_accept_refuses_duplicate_owner() {
        let h = Harness::new();
        let l = h.listen();
        let c = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap();
        h.transport.queue_accept_as(l, c, peer(1));
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();

        assert!(h.seen().is_empty());
        assert_eq!(h.reactor.state(c).unwrap(), ConnectionState::Connecting);
        assert_eq!(h.reactor.remote_endpoint(c).unwrap(), peer(9));
        assert_eq!(h.reactor.connection_count(), 2);
        assert_eq!(h.poller.register_count(c), 1);
    }

    #[test]
    fn test_option_failures_do_not_block_accept_or_connect() {
        let h = Harness::new();
        h.transport.fail_non_blocking(Errno::EINVAL);
        h.transport.fail_option(MockOption::NoDelay, Errno::ENOPROTOOPT);
        let l = h.listen();
        h.transport.queue_accepts(l, [peer(1)]);
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();

        let a = Handle(l.raw() + 1);
        assert_eq!(h.seen(), vec![Seen::Connect(a, peer(1))]);
        assert_eq!(h.reactor.state(a).unwrap(), ConnectionState::Connected);
        assert!(h.transport.options(a).contains(&MockOption::NoDelay));

        let c = h.reactor.connect(&peer(9), h.handler(Then::Nothing)).unwrap();
        assert_eq!(h.reactor.state(c).unwrap(), ConnectionState::Connecting);
        assert!(h.poller.is_registered(c));
    }

    #[test]
    fn test_accept_out_of_descriptors_pauses_listener() {
        let backoff = Duration::from_millis(20);
        let h = Harness::with_config(NetConfig::default().accept_backoff(backoff));
        let l = h.listen();
        h.transport.fail_next_accept(l, Errno::EMFILE);
        h.transport.queue_accepts(l, [peer(1)]);
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();
        assert!(h.seen().is_empty());
        assert_eq!(h.poller.interest(l), Some(Interest::ERROR));

        // The resume deadline bounds an otherwise unbounded wait.
        h.reactor.dispatch_once(None).unwrap();
        let Some(Some(wait)) = h.poller.last_timeout() else {
            panic!("poll should have been bounded by the listener pause");
        };
        assert!(wait <= backoff);

        std::thread::sleep(backoff + Duration::from_millis(10));
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();
        assert_eq!(h.poller.interest(l), Some(Interest::READABLE | Interest::ERROR));
        assert_eq!(h.seen(), vec![Seen::Connect(Handle(l.raw() + 1), peer(1))]);
    }

    #[test]
    fn test_connect_callback_may_close_accepted() {
        let h = Harness::new();
        let l = h.listen_with(Then::CloseOnConnect);
        h.transport.queue_accepts(l, [peer(1), peer(2)]);
        h.poller.push_ready(l, Interest::READABLE);
        h.pass();

        assert_eq!(h.seen().len(), 2);
        assert_eq!(h.reactor.connection_count(), 1);
        assert_eq!(h.transport.close_count(Handle(l.raw() + 1)), 1);
        assert_eq!(h.transport.close_count(Handle(l.raw() + 2)), 1);
    }

    // -- read / write / close events --

    #[test]
    fn test_read_then_peer_close() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);

        h.transport.push_recv(a, b"ping");
        h.poller.push_ready(a, Interest::READABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Read(a)]);
        assert_eq!(h.reactor.recv(a).unwrap(), b"ping".to_vec());
        assert!(h.reactor.recv(a).unwrap().is_empty());

        h.poller.push_ready(a, Interest::READABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Read(a), Seen::Close(a)]);
        assert!(!h.reactor.contains(a));
        assert_eq!(h.transport.close_count(a), 1);
    }

    #[test]
    fn test_available_bytes_failure_closes_once() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        h.transport.push_recv(a, b"x");
        h.transport.fail_available(a, Errno::EBADF);
        h.poller.push_batch(vec![
            Readiness::new(a, Interest::READABLE),
            Readiness::new(a, Interest::READABLE | Interest::ERROR),
        ]);
        h.pass();

        assert_eq!(h.seen(), vec![Seen::Close(a)]);
        assert!(!h.reactor.contains(a));
        assert!(!h.transport.is_open(a));
        assert!(!h.poller.is_registered(a));
        assert_eq!(h.transport.close_count(a), 1);
    }

    #[test]
    fn test_read_follows_reported_bytes() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        // The kernel may report bytes that a later recv no longer finds.
        h.transport.set_available(a, 3);
        h.poller.push_ready(a, Interest::READABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Read(a)]);
        assert!(h.reactor.recv(a).unwrap().is_empty());
        assert!(h.reactor.contains(a));
    }

    #[test]
    fn test_recv_error_keeps_connection() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        h.transport.fail_recv(a, Errno::ECONNRESET);
        assert!(matches!(
            h.reactor.recv(a),
            Err(NetError::Recv { errno: Errno::ECONNRESET, .. })
        ));
        assert_eq!(h.reactor.state(a).unwrap(), ConnectionState::Connected);
    }

    #[test]
    fn test_recv_is_one_bounded_read() {
        let h = Harness::with_config(NetConfig::default().recv_chunk(4));
        let a = h.accepted(Then::Nothing);
        h.transport.push_recv(a, b"abcdefgh");
        assert_eq!(h.reactor.recv(a).unwrap(), b"abcd".to_vec());
        assert_eq!(h.reactor.recv(a).unwrap(), b"efgh".to_vec());
    }

    #[test]
    fn test_error_readiness_closes() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        h.transport.set_socket_error(a, Errno::ECONNRESET);
        h.poller.push_ready(a, Interest::ERROR);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Close(a)]);
        assert!(!h.reactor.contains(a));
    }

    #[test]
    fn test_close_callback_can_query_endpoints() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        let observed = Rc::new(RefCell::new(None));
        let reactor = Rc::downgrade(&h.reactor);
        h.reactor
            .set_callback(
                a,
                handler(
                    move |out: &Rc<RefCell<Option<(ConnectionState, Endpoint)>>>, kind, handle, _| {
                        if kind == MessageKind::Close {
                            let r = reactor.upgrade().unwrap();
                            *out.borrow_mut() =
                                Some((r.state(handle).unwrap(), r.remote_endpoint(handle).unwrap()));
                        }
                    },
                    observed.clone(),
                ),
            )
            .unwrap();

        h.poller.push_ready(a, Interest::ERROR);
        h.pass();
        assert_eq!(*observed.borrow(), Some((ConnectionState::Closing, peer(1))));
        assert!(!h.reactor.contains(a));
    }

    // -- close --

    #[test]
    fn test_close_is_idempotent() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);

        h.reactor.close(a).unwrap();
        assert!(matches!(h.reactor.close(a), Err(NetError::NotFound(_))));
        assert_eq!(h.transport.close_count(a), 1);
        assert_eq!(h.poller.deregister_count(a), 1);
        assert!(!h.transport.is_open(a));
        assert!(!h.poller.is_registered(a));
        assert!(matches!(h.reactor.send(a, b"x"), Err(NetError::NotFound(_))));
    }

    #[test]
    fn test_close_from_own_close_callback_releases_once() {
        let h = Harness::new();
        let a = h.accepted(Then::CloseOnClose);

        h.poller.push_ready(a, Interest::READABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Close(a)]);
        assert_eq!(h.transport.close_count(a), 1);
        assert_eq!(h.poller.deregister_count(a), 1);
    }

    #[test]
    fn test_stale_events_dropped_after_close() {
        let h = Harness::new();
        let a = h.accepted(Then::CloseOnRead);

        h.transport.push_recv(a, b"x");
        h.poller.push_batch(vec![
            Readiness::new(a, Interest::READABLE | Interest::WRITABLE | Interest::ERROR),
            Readiness::new(a, Interest::READABLE),
        ]);
        h.poller.push_ready(a, Interest::ALL);
        h.pass();
        h.pass();

        assert_eq!(h.seen(), vec![Seen::Read(a)]);
        assert_eq!(h.transport.close_count(a), 1);
    }

    #[test]
    fn test_released_handle_reused_in_same_pass_is_not_confused() {
        let h = Harness::new();
        let a = h.accepted(Then::CloseOnRead);
        let l = Handle(a.raw() - 1);

        // After `a` is closed, the listener's next accept hands out the same
        // number; its readiness entry later in this batch belongs to the old
        // socket and is dropped.
        h.transport.push_recv(a, b"x");
        h.transport.queue_accept_as(l, a, peer(2));
        h.poller.push_batch(vec![
            Readiness::new(a, Interest::READABLE),
            Readiness::new(l, Interest::READABLE),
            Readiness::new(a, Interest::ERROR),
        ]);
        h.pass();

        assert_eq!(h.seen(), vec![Seen::Read(a), Seen::Connect(a, peer(2))]);
        assert_eq!(h.reactor.state(a).unwrap(), ConnectionState::Connected);
        assert_eq!(h.reactor.remote_endpoint(a).unwrap(), peer(2));
    }

    #[test]
    fn test_panicking_callback_does_not_stop_batch() {
        let h = Harness::new();
        let a = h.accepted(Then::Panic);
        let b = Handle(a.raw() + 1);
        h.transport.queue_accepts(Handle(a.raw() - 1), [peer(2)]);
        h.poller.push_ready(Handle(a.raw() - 1), Interest::READABLE);
        h.pass();
        h.log.borrow_mut().clear();

        h.transport.push_recv(a, b"x");
        h.transport.push_recv(b, b"y");
        h.poller.push_batch(vec![
            Readiness::new(a, Interest::READABLE),
            Readiness::new(b, Interest::READABLE),
        ]);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Read(a), Seen::Read(b)]);
        assert!(h.reactor.contains(a));
    }

    // -- send --

    #[test]
    fn test_send_backpressure_arms_write_interest() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);

        h.transport.script_send(Ok(SendOutcome::WouldBlock));
        assert_eq!(h.reactor.send(a, b"data").unwrap(), 0);
        assert_eq!(h.poller.interest(a), Some(Interest::ALL));
        assert!(h.seen().is_empty());
        assert_eq!(h.reactor.state(a).unwrap(), ConnectionState::Connected);

        h.poller.push_ready(a, Interest::WRITABLE);
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Write(a)]);
        assert_eq!(h.poller.interest(a), Some(Interest::READABLE | Interest::ERROR));

        assert_eq!(h.reactor.send(a, b"data").unwrap(), 4);
        assert_eq!(h.transport.sent(a), b"data".to_vec());
    }

    #[test]
    fn test_write_interest_that_cannot_be_dropped_closes() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        h.transport.script_send(Ok(SendOutcome::WouldBlock));
        assert_eq!(h.reactor.send(a, b"data").unwrap(), 0);

        h.poller.fail_next_reregister(Errno::ENOMEM);
        h.poller.push_ready(a, Interest::WRITABLE);
        h.poller.push_ready(a, Interest::WRITABLE);
        h.pass();
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Close(a)]);
        assert!(!h.reactor.contains(a));
        assert_eq!(h.transport.close_count(a), 1);
    }

    #[test]
    fn test_send_on_wrong_state_changes_nothing() {
        let h = Harness::new();
        let l = h.listen();
        let err = h.reactor.send(l, b"x").unwrap_err();
        assert!(matches!(err, NetError::InvalidState { actual: ConnectionState::Listening, .. }));
        assert_eq!(h.reactor.state(l).unwrap(), ConnectionState::Listening);
        assert_eq!(h.reactor.connection_count(), 1);
        assert_eq!(h.transport.send_calls(), 0);
    }

    #[test]
    fn test_send_hard_error_keeps_connection() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        h.transport.script_send(Err(Errno::EPIPE));
        assert!(matches!(h.reactor.send(a, b"x"), Err(NetError::Send { .. })));
        assert!(h.reactor.contains(a));
    }

    // -- options --

    #[test]
    fn test_options_on_unknown_handle() {
        let h = Harness::new();
        let ghost = Handle(42);
        assert!(matches!(h.reactor.remote_endpoint(ghost), Err(NetError::NotFound(_))));
        assert!(matches!(h.reactor.set_send_buf_size(ghost, 1), Err(NetError::NotFound(_))));
        assert!(matches!(
            h.reactor.set_callback(ghost, h.handler(Then::Nothing)),
            Err(NetError::NotFound(_))
        ));
    }

    #[test]
    fn test_buffer_sizes_are_clamped() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        h.reactor.set_send_buf_size(a, 1 << 20).unwrap();
        h.reactor.set_recv_buf_size(a, 4096).unwrap();
        let opts = h.transport.options(a);
        assert!(opts.contains(&MockOption::SendBuf(128 * 1024)));
        assert!(opts.contains(&MockOption::RecvBuf(4096)));
    }

    // -- timers --

    #[test]
    fn test_timer_fires_with_invalid_handle() {
        let h = Harness::new();
        let id = h
            .reactor
            .register_timer(h.handler(Then::Nothing), Duration::from_millis(1))
            .unwrap();
        std::thread::sleep(Duration::from_millis(3));
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Timer(id)]);

        assert!(h.reactor.cancel_timer(id));
        std::thread::sleep(Duration::from_millis(3));
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Timer(id)]);
    }

    #[test]
    fn test_timer_cancelled_earlier_in_pass_does_not_fire() {
        let h = Harness::new();
        let victim = Rc::new(Cell::new(None));
        let a = h
            .reactor
            .register_timer(cancelling(&h, victim.clone()), Duration::from_millis(1))
            .unwrap();
        let b = h
            .reactor
            .register_timer(h.handler(Then::Nothing), Duration::from_millis(2))
            .unwrap();
        victim.set(Some(b));

        std::thread::sleep(Duration::from_millis(5));
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Timer(a)]);
        assert!(!h.reactor.cancel_timer(b));

        std::thread::sleep(Duration::from_millis(5));
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Timer(a), Seen::Timer(a)]);
    }

    #[test]
    fn test_loop_cancelled_earlier_in_pass_does_not_fire() {
        let h = Harness::new();
        let victim = Rc::new(Cell::new(None));
        let first = h.reactor.register_loop(cancelling(&h, victim.clone()));
        let second = h.reactor.register_loop(h.handler(Then::Nothing));
        victim.set(Some(second));

        h.pass();
        h.pass();
        assert_eq!(h.seen(), vec![Seen::Loop(first), Seen::Loop(first)]);
    }

    #[test]
    fn test_poll_timeout_shortened_to_next_timer() {
        let h = Harness::new();
        h.reactor
            .register_timer(h.handler(Then::Nothing), Duration::from_secs(5))
            .unwrap();
        h.reactor.dispatch_once(None).unwrap();
        let Some(Some(wait)) = h.poller.last_timeout() else {
            panic!("poll should have been bounded by the timer");
        };
        assert!(wait <= Duration::from_secs(5));

        h.reactor.dispatch_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(h.poller.last_timeout(), Some(Some(Duration::from_millis(10))));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let h = Harness::new();
        let err = h.reactor.register_timer(h.handler(Then::Nothing), Duration::ZERO).unwrap_err();
        assert!(matches!(err, NetError::InvalidInterval));
    }

    #[test]
    fn test_loop_callback_once_per_pass_after_events() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        let id = h.reactor.register_loop(h.handler(Then::Nothing));

        h.transport.push_recv(a, b"x");
        h.poller.push_ready(a, Interest::READABLE);
        h.poller.push_ready(a, Interest::READABLE);
        h.pass();
        h.pass();
        h.pass();
        assert_eq!(
            h.seen(),
            vec![Seen::Read(a), Seen::Loop(id), Seen::Read(a), Seen::Loop(id), Seen::Loop(id)]
        );

        assert!(h.reactor.cancel_timer(id));
        h.log.borrow_mut().clear();
        h.pass();
        assert!(h.seen().is_empty());
    }

    #[test]
    fn test_poll_failure_is_reported() {
        let h = Harness::new();
        h.poller.fail_next_poll(Errno::EBADF);
        assert!(matches!(
            h.reactor.dispatch_once(Some(Duration::ZERO)),
            Err(NetError::Poller(Errno::EBADF))
        ));
        assert_eq!(h.pass(), 0);
    }

    #[test]
    fn test_drop_closes_everything() {
        let h = Harness::new();
        let a = h.accepted(Then::Nothing);
        let transport = h.transport.clone();
        drop(h);
        assert_eq!(transport.close_count(a), 1);
        assert_eq!(transport.open_count(), 0);
    }
}
