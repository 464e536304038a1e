//! Scripted `Transport` and `Poller` for driving the state machine without
//! sockets.
//!
//! Both mocks are cheap `Clone` handles onto shared state: hand one clone to
//! the reactor, keep the other to script outcomes and inspect what happened.
//!
//! ```rust,ignore
//! let transport = MockTransport::new();
//! let poller = MockPoller::new();
//! let reactor = Reactor::new(transport.clone(), poller.clone(), NetConfig::default());
//!
//! let listener = reactor.listen(&Endpoint::new("", 7000), on_event, ctx)?;
//! transport.queue_accepts(listener, [Endpoint::new("10.0.0.2", 5000)]);
//! poller.push_ready(listener, Interest::READABLE);
//! reactor.dispatch_once(Some(Duration::ZERO))?;
//! ```

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::mem::{self, Discriminant};
use std::rc::Rc;
use std::time::Duration;

use netlib_core::{
    AcceptOutcome, ConnectOutcome, Endpoint, Errno, Handle, Interest, Poller, Readiness,
    SendOutcome, Transport,
};

/// First handle a `MockTransport` hands out.
pub const FIRST_MOCK_HANDLE: i32 = 100;

/// Option calls recorded by `MockTransport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOption {
    ReuseAddr,
    NoDelay,
    SendBuf(u32),
    RecvBuf(u32),
}

impl MockOption {
    fn kind(&self) -> Discriminant<MockOption> {
        mem::discriminant(self)
    }
}

#[derive(Debug, Clone)]
enum AcceptScript {
    Peer(Endpoint),
    Fixed(Handle, Endpoint),
    Fail(Errno),
}

#[derive(Debug)]
struct TransportState {
    next_fd: i32,
    open: HashSet<Handle>,
    closed: Vec<Handle>,
    non_blocking: HashSet<Handle>,
    options: Vec<(Handle, MockOption)>,
    bound: HashMap<Handle, Endpoint>,
    listening: HashMap<Handle, i32>,
    connect_targets: HashMap<Handle, Endpoint>,

    fail_create: Option<Errno>,
    fail_bind: Option<Errno>,
    fail_listen: Option<Errno>,
    connect_result: Result<ConnectOutcome, Errno>,
    accepts: HashMap<Handle, VecDeque<AcceptScript>>,
    send_script: VecDeque<Result<SendOutcome, Errno>>,
    sent: Vec<(Handle, Vec<u8>)>,
    inbound: HashMap<Handle, VecDeque<u8>>,
    recv_errors: HashMap<Handle, Errno>,
    available: HashMap<Handle, usize>,
    available_errors: HashMap<Handle, Errno>,
    socket_errors: HashMap<Handle, Errno>,
    option_errors: Vec<(Discriminant<MockOption>, Errno)>,
    non_blocking_error: Option<Errno>,
}

impl Default for TransportState {
    fn default() -> Self {
        Self {
            next_fd: FIRST_MOCK_HANDLE,
            open: HashSet::new(),
            closed: Vec::new(),
            non_blocking: HashSet::new(),
            options: Vec::new(),
            bound: HashMap::new(),
            listening: HashMap::new(),
            connect_targets: HashMap::new(),
            fail_create: None,
            fail_bind: None,
            fail_listen: None,
            connect_result: Ok(ConnectOutcome::InProgress),
            accepts: HashMap::new(),
            send_script: VecDeque::new(),
            sent: Vec::new(),
            inbound: HashMap::new(),
            recv_errors: HashMap::new(),
            available: HashMap::new(),
            available_errors: HashMap::new(),
            socket_errors: HashMap::new(),
            option_errors: Vec::new(),
            non_blocking_error: None,
        }
    }
}

impl TransportState {
    fn allocate(&mut self) -> Handle {
        let h = Handle(self.next_fd);
        self.next_fd += 1;
        self.open.insert(h);
        h
    }

    /// Record an option call and return its scripted outcome.
    fn apply_option(&mut self, handle: Handle, option: MockOption) -> Result<(), Errno> {
        self.options.push((handle, option));
        match self.option_errors.iter().find(|(kind, _)| *kind == option.kind()) {
            Some((_, errno)) => Err(*errno),
            None => Ok(()),
        }
    }
}

/// Scripted socket layer. Handles are allocated from
/// [`FIRST_MOCK_HANDLE`] upward and never reused.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Rc<RefCell<TransportState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    // -- scripting --

    pub fn fail_next_create(&self, errno: Errno) {
        self.state.borrow_mut().fail_create = Some(errno);
    }

    pub fn fail_next_bind(&self, errno: Errno) {
        self.state.borrow_mut().fail_bind = Some(errno);
    }

    pub fn fail_next_listen(&self, errno: Errno) {
        self.state.borrow_mut().fail_listen = Some(errno);
    }

    /// Result of every subsequent `connect` (default `Ok(InProgress)`).
    pub fn set_connect_result(&self, result: Result<ConnectOutcome, Errno>) {
        self.state.borrow_mut().connect_result = result;
    }

    /// Queue pending connections on `listener`; each accept allocates a
    /// fresh handle. Once the queue is empty `accept` reports `WouldBlock`.
    pub fn queue_accepts(&self, listener: Handle, peers: impl IntoIterator<Item = Endpoint>) {
        let mut st = self.state.borrow_mut();
        let queue = st.accepts.entry(listener).or_default();
        queue.extend(peers.into_iter().map(AcceptScript::Peer));
    }

    /// Queue a pending connection that accepts as exactly `handle`.
    pub fn queue_accept_as(&self, listener: Handle, handle: Handle, peer: Endpoint) {
        let mut st = self.state.borrow_mut();
        st.accepts
            .entry(listener)
            .or_default()
            .push_back(AcceptScript::Fixed(handle, peer));
    }

    pub fn fail_next_accept(&self, listener: Handle, errno: Errno) {
        let mut st = self.state.borrow_mut();
        st.accepts
            .entry(listener)
            .or_default()
            .push_back(AcceptScript::Fail(errno));
    }

    /// Script the next `send` outcome. Unscripted sends write everything.
    pub fn script_send(&self, outcome: Result<SendOutcome, Errno>) {
        self.state.borrow_mut().send_script.push_back(outcome);
    }

    /// Make `data` readable on `handle`.
    pub fn push_recv(&self, handle: Handle, data: &[u8]) {
        let mut st = self.state.borrow_mut();
        st.inbound.entry(handle).or_default().extend(data.iter().copied());
    }

    pub fn fail_recv(&self, handle: Handle, errno: Errno) {
        self.state.borrow_mut().recv_errors.insert(handle, errno);
    }

    /// Override what `available_bytes` reports (default: queued inbound).
    pub fn set_available(&self, handle: Handle, bytes: usize) {
        self.state.borrow_mut().available.insert(handle, bytes);
    }

    /// Make every `available_bytes` on `handle` fail with `errno`.
    pub fn fail_available(&self, handle: Handle, errno: Errno) {
        self.state.borrow_mut().available_errors.insert(handle, errno);
    }

    /// Make every call setting this kind of option fail with `errno`. The
    /// size carried by `SendBuf`/`RecvBuf` is ignored for matching.
    pub fn fail_option(&self, option: MockOption, errno: Errno) {
        self.state.borrow_mut().option_errors.push((option.kind(), errno));
    }

    /// Make every `set_non_blocking` fail with `errno`.
    pub fn fail_non_blocking(&self, errno: Errno) {
        self.state.borrow_mut().non_blocking_error = Some(errno);
    }

    pub fn set_socket_error(&self, handle: Handle, errno: Errno) {
        self.state.borrow_mut().socket_errors.insert(handle, errno);
    }

    /// Forget recorded closes, option calls and sends.
    pub fn clear_history(&self) {
        let mut st = self.state.borrow_mut();
        st.closed.clear();
        st.options.clear();
        st.sent.clear();
    }

    // -- inspection --

    pub fn is_open(&self, handle: Handle) -> bool {
        self.state.borrow().open.contains(&handle)
    }

    /// Currently open handles, in ascending order.
    pub fn open_handles(&self) -> Vec<Handle> {
        let mut open: Vec<Handle> = self.state.borrow().open.iter().copied().collect();
        open.sort();
        open
    }

    pub fn open_count(&self) -> usize {
        self.state.borrow().open.len()
    }

    /// How many times `close` was called for `handle`.
    pub fn close_count(&self, handle: Handle) -> usize {
        self.state.borrow().closed.iter().filter(|h| **h == handle).count()
    }

    pub fn is_non_blocking(&self, handle: Handle) -> bool {
        self.state.borrow().non_blocking.contains(&handle)
    }

    pub fn options(&self, handle: Handle) -> Vec<MockOption> {
        self.state
            .borrow()
            .options
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, o)| *o)
            .collect()
    }

    pub fn bound(&self, handle: Handle) -> Option<Endpoint> {
        self.state.borrow().bound.get(&handle).cloned()
    }

    pub fn backlog(&self, handle: Handle) -> Option<i32> {
        self.state.borrow().listening.get(&handle).copied()
    }

    pub fn connect_target(&self, handle: Handle) -> Option<Endpoint> {
        self.state.borrow().connect_targets.get(&handle).cloned()
    }

    /// Everything written on `handle`, concatenated.
    pub fn sent(&self, handle: Handle) -> Vec<u8> {
        self.state
            .borrow()
            .sent
            .iter()
            .filter(|(h, _)| *h == handle)
            .flat_map(|(_, b)| b.iter().copied())
            .collect()
    }

    pub fn send_calls(&self) -> usize {
        self.state.borrow().sent.len()
    }
}

impl Transport for MockTransport {
    fn create_stream_socket(&self) -> Result<Handle, Errno> {
        let mut st = self.state.borrow_mut();
        match st.fail_create.take() {
            Some(errno) => Err(errno),
            None => Ok(st.allocate()),
        }
    }

    fn set_non_blocking(&self, handle: Handle) -> Result<(), Errno> {
        let mut st = self.state.borrow_mut();
        if let Some(errno) = st.non_blocking_error {
            return Err(errno);
        }
        st.non_blocking.insert(handle);
        Ok(())
    }

    fn set_reuse_addr(&self, handle: Handle) -> Result<(), Errno> {
        self.state.borrow_mut().apply_option(handle, MockOption::ReuseAddr)
    }

    fn set_no_delay(&self, handle: Handle) -> Result<(), Errno> {
        self.state.borrow_mut().apply_option(handle, MockOption::NoDelay)
    }

    fn set_send_buf(&self, handle: Handle, size: u32) -> Result<(), Errno> {
        self.state.borrow_mut().apply_option(handle, MockOption::SendBuf(size))
    }

    fn set_recv_buf(&self, handle: Handle, size: u32) -> Result<(), Errno> {
        self.state.borrow_mut().apply_option(handle, MockOption::RecvBuf(size))
    }

    fn bind(&self, handle: Handle, endpoint: &Endpoint) -> Result<(), Errno> {
        let mut st = self.state.borrow_mut();
        if let Some(errno) = st.fail_bind.take() {
            return Err(errno);
        }
        st.bound.insert(handle, endpoint.clone());
        Ok(())
    }

    fn listen(&self, handle: Handle, backlog: i32) -> Result<(), Errno> {
        let mut st = self.state.borrow_mut();
        if let Some(errno) = st.fail_listen.take() {
            return Err(errno);
        }
        st.listening.insert(handle, backlog);
        Ok(())
    }

    fn connect(&self, handle: Handle, endpoint: &Endpoint) -> Result<ConnectOutcome, Errno> {
        let mut st = self.state.borrow_mut();
        st.connect_targets.insert(handle, endpoint.clone());
        st.connect_result
    }

    fn accept(&self, handle: Handle) -> Result<AcceptOutcome, Errno> {
        let mut st = self.state.borrow_mut();
        let next = st.accepts.get_mut(&handle).and_then(|q| q.pop_front());
        match next {
            None => Ok(AcceptOutcome::WouldBlock),
            Some(AcceptScript::Fail(errno)) => Err(errno),
            Some(AcceptScript::Peer(peer)) => {
                let h = st.allocate();
                Ok(AcceptOutcome::Accepted(h, peer))
            }
            Some(AcceptScript::Fixed(h, peer)) => {
                st.open.insert(h);
                Ok(AcceptOutcome::Accepted(h, peer))
            }
        }
    }

    fn send(&self, handle: Handle, data: &[u8]) -> Result<SendOutcome, Errno> {
        let mut st = self.state.borrow_mut();
        let outcome = st
            .send_script
            .pop_front()
            .unwrap_or(Ok(SendOutcome::Written(data.len())));
        if let Ok(SendOutcome::Written(n)) = outcome {
            let n = n.min(data.len());
            st.sent.push((handle, data[..n].to_vec()));
            return Ok(SendOutcome::Written(n));
        }
        outcome
    }

    fn recv(&self, handle: Handle, max_len: usize) -> Result<Vec<u8>, Errno> {
        let mut st = self.state.borrow_mut();
        if let Some(errno) = st.recv_errors.remove(&handle) {
            return Err(errno);
        }
        let Some(queue) = st.inbound.get_mut(&handle) else {
            return Ok(Vec::new());
        };
        let n = max_len.min(queue.len());
        Ok(queue.drain(..n).collect())
    }

    fn available_bytes(&self, handle: Handle) -> Result<usize, Errno> {
        let st = self.state.borrow();
        if let Some(errno) = st.available_errors.get(&handle) {
            return Err(*errno);
        }
        if let Some(n) = st.available.get(&handle) {
            return Ok(*n);
        }
        Ok(st.inbound.get(&handle).map_or(0, VecDeque::len))
    }

    fn socket_error(&self, handle: Handle) -> Result<(), Errno> {
        match self.state.borrow().socket_errors.get(&handle) {
            Some(errno) => Err(*errno),
            None => Ok(()),
        }
    }

    fn local_endpoint(&self, handle: Handle) -> Result<Endpoint, Errno> {
        self.state.borrow().bound.get(&handle).cloned().ok_or(Errno::ENOTCONN)
    }

    fn close(&self, handle: Handle) {
        let mut st = self.state.borrow_mut();
        st.open.remove(&handle);
        st.closed.push(handle);
    }
}

#[derive(Debug, Default)]
struct PollerState {
    registered: HashMap<Handle, Interest>,
    batches: VecDeque<Vec<Readiness>>,
    registers: Vec<Handle>,
    deregisters: Vec<Handle>,
    polls: usize,
    last_timeout: Option<Option<Duration>>,
    fail_register: Option<Errno>,
    fail_reregister: Option<Errno>,
    fail_poll: Option<Errno>,
}

/// Scripted readiness source.
///
/// `poll` hands out queued batches verbatim, one per call, and never sleeps.
/// Batches are not filtered against the registrations, so a test can
/// deliver an event for a handle that was closed earlier in the pass.
#[derive(Clone, Default)]
pub struct MockPoller {
    state: Rc<RefCell<PollerState>>,
}

impl MockPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_batch(&self, batch: Vec<Readiness>) {
        self.state.borrow_mut().batches.push_back(batch);
    }

    /// Queue a single-entry batch.
    pub fn push_ready(&self, handle: Handle, ready: Interest) {
        self.push_batch(vec![Readiness::new(handle, ready)]);
    }

    pub fn fail_next_register(&self, errno: Errno) {
        self.state.borrow_mut().fail_register = Some(errno);
    }

    pub fn fail_next_reregister(&self, errno: Errno) {
        self.state.borrow_mut().fail_reregister = Some(errno);
    }

    pub fn fail_next_poll(&self, errno: Errno) {
        self.state.borrow_mut().fail_poll = Some(errno);
    }

    /// Forget recorded register/deregister calls.
    pub fn clear_history(&self) {
        let mut st = self.state.borrow_mut();
        st.registers.clear();
        st.deregisters.clear();
    }

    /// Current interest for `handle`, if registered.
    pub fn interest(&self, handle: Handle) -> Option<Interest> {
        self.state.borrow().registered.get(&handle).copied()
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        self.state.borrow().registered.contains_key(&handle)
    }

    pub fn registered_count(&self) -> usize {
        self.state.borrow().registered.len()
    }

    pub fn register_count(&self, handle: Handle) -> usize {
        self.state.borrow().registers.iter().filter(|h| **h == handle).count()
    }

    pub fn deregister_count(&self, handle: Handle) -> usize {
        self.state.borrow().deregisters.iter().filter(|h| **h == handle).count()
    }

    pub fn poll_count(&self) -> usize {
        self.state.borrow().polls
    }

    /// Timeout passed to the most recent `poll`.
    pub fn last_timeout(&self) -> Option<Option<Duration>> {
        self.state.borrow().last_timeout
    }
}

impl Poller for MockPoller {
    fn register(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno> {
        let mut st = self.state.borrow_mut();
        if let Some(errno) = st.fail_register.take() {
            return Err(errno);
        }
        if st.registered.contains_key(&handle) {
            return Err(Errno::EEXIST);
        }
        st.registered.insert(handle, interest);
        st.registers.push(handle);
        Ok(())
    }

    fn reregister(&mut self, handle: Handle, interest: Interest) -> Result<(), Errno> {
        let mut st = self.state.borrow_mut();
        if let Some(errno) = st.fail_reregister.take() {
            return Err(errno);
        }
        match st.registered.get_mut(&handle) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(Errno::ENOENT),
        }
    }

    fn deregister(&mut self, handle: Handle) -> Result<(), Errno> {
        let mut st = self.state.borrow_mut();
        st.registered.remove(&handle).ok_or(Errno::ENOENT)?;
        st.deregisters.push(handle);
        Ok(())
    }

    fn poll(&mut self, events: &mut Vec<Readiness>, timeout: Option<Duration>) -> Result<(), Errno> {
        events.clear();
        let mut st = self.state.borrow_mut();
        st.polls += 1;
        st.last_timeout = Some(timeout);
        if let Some(errno) = st.fail_poll.take() {
            return Err(errno);
        }
        if let Some(batch) = st.batches.pop_front() {
            events.extend(batch);
        }
        Ok(())
    }
}
