//! NetLib — the process-wide facade.
//!
//! One `NetLib` per process, built lazily on first use. Its reactor lives in
//! a thread-local on the *dispatch thread*: the first thread that needs the
//! reactor claims it, and every synchronous operation from any other thread
//! fails with [`NetError::WrongThread`].
//!
//! Other threads talk to the dispatch thread through a bounded lock-free
//! command queue (`post_send`, `post_close`). The queue is drained at the
//! start of every pass, so a posted command waits at most one poll timeout.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::thread::{self, ThreadId};
use std::time::Duration;

use crossbeam_queue::ArrayQueue;
use netlib_core::{
    handler, ConnectionState, Endpoint, Handle, MessageKind, NetConfig, NetError, Payload, Result,
    TimerId,
};
use netlib_module::{new_poller, PlatformPoller, SysTransport};
use tracing::{debug, error, info, warn};

use crate::reactor::Reactor;

/// The reactor the facade drives: OS sockets on the platform poller.
pub type SysReactor = Reactor<SysTransport, PlatformPoller>;

/// Work posted from another thread.
#[derive(Debug)]
pub enum Command {
    Send { handle: Handle, data: Vec<u8> },
    Close(Handle),
}

static NETLIB: OnceLock<NetLib> = OnceLock::new();

thread_local! {
    static REACTOR: RefCell<Option<Rc<SysReactor>>> = const { RefCell::new(None) };
}

pub struct NetLib {
    config: NetConfig,
    /// Dispatch thread, claimed on first reactor access.
    owner: OnceLock<ThreadId>,
    commands: ArrayQueue<Command>,
    stop: AtomicBool,
}

impl NetLib {
    fn new(config: NetConfig) -> Self {
        Self {
            commands: ArrayQueue::new(config.command_queue_capacity.max(1)),
            owner: OnceLock::new(),
            stop: AtomicBool::new(false),
            config,
        }
    }

    /// The process-wide instance, configured from the environment on first
    /// use.
    pub fn instance() -> &'static NetLib {
        NETLIB.get_or_init(|| NetLib::new(NetConfig::from_env()))
    }

    /// Create the instance with `config`. If it already exists, `config` is
    /// ignored and the existing instance is returned.
    pub fn init(config: NetConfig) -> &'static NetLib {
        let mut config = Some(config);
        let lib = NETLIB.get_or_init(|| NetLib::new(config.take().unwrap_or_default()));
        if config.is_some() {
            warn!("netlib already initialized, ignoring config");
        }
        lib
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// True on the dispatch thread (or if no thread has claimed it yet).
    pub fn is_dispatch_thread(&self) -> bool {
        self.owner.get().map_or(true, |owner| *owner == thread::current().id())
    }

    /// This thread's reactor, creating it on first use. Fails off the
    /// dispatch thread.
    pub fn reactor(&self) -> Result<Rc<SysReactor>> {
        let me = thread::current().id();
        if *self.owner.get_or_init(|| me) != me {
            return Err(NetError::WrongThread);
        }
        REACTOR.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(reactor) = slot.as_ref() {
                return Ok(reactor.clone());
            }
            let poller = new_poller(self.config.max_events).map_err(|errno| {
                error!(errno = %errno, fatal = true, "poller init failed");
                NetError::Init(errno)
            })?;
            let reactor = Rc::new(Reactor::new(SysTransport::new(), poller, self.config.clone()));
            info!(thread = ?me, config = ?self.config, "reactor started");
            *slot = Some(reactor.clone());
            Ok(reactor)
        })
    }

    // ========================================================================
    // Dispatch-thread operations
    // ========================================================================

    /// Listen on `address:port`. Connections accepted from it report to
    /// `func` with `context`.
    pub fn listen<C, F>(&self, address: &str, port: u16, func: F, context: C) -> Result<Handle>
    where
        C: 'static,
        F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>) + 'static,
    {
        self.reactor()?.listen(&Endpoint::new(address, port), handler(func, context))
    }

    /// Connect to `address:port`. `Confirm` or `Close` reports the outcome.
    pub fn connect<C, F>(&self, address: &str, port: u16, func: F, context: C) -> Result<Handle>
    where
        C: 'static,
        F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>) + 'static,
    {
        self.reactor()?.connect(&Endpoint::new(address, port), handler(func, context))
    }

    pub fn send(&self, handle: Handle, data: &[u8]) -> Result<usize> {
        self.reactor()?.send(handle, data)
    }

    pub fn recv(&self, handle: Handle) -> Result<Vec<u8>> {
        self.reactor()?.recv(handle)
    }

    pub fn close(&self, handle: Handle) -> Result<()> {
        self.reactor()?.close(handle)
    }

    /// Deliver `Timer` to `func` every `interval_ms` milliseconds.
    pub fn register_timer<C, F>(&self, func: F, context: C, interval_ms: u64) -> Result<TimerId>
    where
        C: 'static,
        F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>) + 'static,
    {
        self.reactor()?
            .register_timer(handler(func, context), Duration::from_millis(interval_ms))
    }

    /// Deliver `Loop` to `func` once per dispatch pass.
    pub fn register_loop<C, F>(&self, func: F, context: C) -> Result<TimerId>
    where
        C: 'static,
        F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>) + 'static,
    {
        Ok(self.reactor()?.register_loop(handler(func, context)))
    }

    pub fn cancel_timer(&self, id: TimerId) -> Result<bool> {
        Ok(self.reactor()?.cancel_timer(id))
    }

    /// Rebind the callback (and its context) of a live connection.
    pub fn set_callback<C, F>(&self, handle: Handle, func: F, context: C) -> Result<()>
    where
        C: 'static,
        F: Fn(&C, MessageKind, Handle, Option<Payload<'_>>) + 'static,
    {
        self.reactor()?.set_callback(handle, handler(func, context))
    }

    pub fn remote_endpoint(&self, handle: Handle) -> Result<Endpoint> {
        self.reactor()?.remote_endpoint(handle)
    }

    pub fn local_endpoint(&self, handle: Handle) -> Result<Endpoint> {
        self.reactor()?.local_endpoint(handle)
    }

    pub fn set_send_buf_size(&self, handle: Handle, size: u32) -> Result<()> {
        self.reactor()?.set_send_buf_size(handle, size)
    }

    pub fn set_recv_buf_size(&self, handle: Handle, size: u32) -> Result<()> {
        self.reactor()?.set_recv_buf_size(handle, size)
    }

    pub fn state(&self, handle: Handle) -> Result<ConnectionState> {
        self.reactor()?.state(handle)
    }

    // ========================================================================
    // Any-thread operations
    // ========================================================================

    /// Queue a send for the dispatch thread.
    pub fn post_send(&self, handle: Handle, data: impl Into<Vec<u8>>) -> Result<()> {
        self.post(Command::Send { handle, data: data.into() })
    }

    /// Queue a close for the dispatch thread.
    pub fn post_close(&self, handle: Handle) -> Result<()> {
        self.post(Command::Close(handle))
    }

    fn post(&self, cmd: Command) -> Result<()> {
        self.commands.push(cmd).map_err(|cmd| {
            warn!(?cmd, capacity = self.commands.capacity(), "command queue full");
            NetError::QueueFull
        })
    }

    pub fn pending_commands(&self) -> usize {
        self.commands.len()
    }

    /// Ask `run` to return after the current pass.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    // ========================================================================
    // Dispatch loop
    // ========================================================================

    /// Claim the dispatch thread and loop until `stop` is called.
    pub fn run(&self) -> Result<()> {
        let reactor = self.reactor()?;
        info!("dispatch loop running");
        while !self.stop.swap(false, Ordering::AcqRel) {
            self.pump(&reactor, Some(self.config.poll_timeout))?;
        }
        info!("dispatch loop stopped");
        Ok(())
    }

    /// Drain posted commands and run one pass.
    pub fn run_once(&self, timeout: Option<Duration>) -> Result<usize> {
        let reactor = self.reactor()?;
        self.pump(&reactor, timeout)
    }

    fn pump(&self, reactor: &SysReactor, timeout: Option<Duration>) -> Result<usize> {
        self.drain_commands(reactor);
        reactor.dispatch_once(timeout)
    }

    fn drain_commands(&self, reactor: &SysReactor) {
        while let Some(cmd) = self.commands.pop() {
            match cmd {
                Command::Send { handle, data } => match reactor.send(handle, &data) {
                    Ok(n) if n < data.len() => {
                        debug!(handle = %handle, written = n, len = data.len(), "posted send was partial");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(handle = %handle, error = %e, "posted send failed"),
                },
                Command::Close(handle) => {
                    if let Err(e) = reactor.close(handle) {
                        debug!(handle = %handle, error = %e, "posted close ignored");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_queue_full() {
        let lib = NetLib::new(NetConfig::default().command_queue_capacity(2));
        lib.post_close(Handle(1)).unwrap();
        lib.post_send(Handle(1), b"abc".to_vec()).unwrap();
        assert!(matches!(lib.post_close(Handle(2)), Err(NetError::QueueFull)));
        assert_eq!(lib.pending_commands(), 2);
    }

    // The only test in this crate that touches the process-wide instance:
    // whichever test thread claims it stays the dispatch thread.
    #[test]
    fn test_dispatch_thread_ownership_and_run() {
        let lib = NetLib::init(NetConfig::default().poll_timeout(Duration::from_millis(5)));
        assert!(lib.reactor().is_ok());
        assert!(lib.is_dispatch_thread());

        let (wrong_thread, posted) = thread::spawn(|| {
            let lib = NetLib::instance();
            (
                matches!(lib.close(Handle(5)), Err(NetError::WrongThread)),
                lib.post_close(Handle(123_456)).is_ok(),
            )
        })
        .join()
        .unwrap();
        assert!(wrong_thread);
        assert!(posted);

        let ticks = Rc::new(Cell::new(0u32));
        let id = lib
            .register_timer(
                |ticks: &Rc<Cell<u32>>, kind, handle, _| {
                    assert_eq!(kind, MessageKind::Timer);
                    assert_eq!(handle, Handle::INVALID);
                    ticks.set(ticks.get() + 1);
                    if ticks.get() == 3 {
                        NetLib::instance().stop();
                    }
                },
                ticks.clone(),
                1,
            )
            .unwrap();

        lib.run().unwrap();
        assert_eq!(ticks.get(), 3);
        assert_eq!(lib.pending_commands(), 0);
        assert!(lib.cancel_timer(id).unwrap());
        assert!(matches!(lib.close(Handle(123_456)), Err(NetError::NotFound(_))));
    }
}
