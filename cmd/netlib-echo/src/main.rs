//! netlib Echo Server
//!
//! Single-threaded TCP echo server on the netlib reactor. Bytes that the
//! socket will not take right away are kept per connection and flushed on
//! the next `Write` message.
//!
//! Usage:
//!     cargo build --release -p netlib-echo
//!     RUST_LOG=debug ./target/release/netlib-echo [port] [stats_interval_ms]
//!
//! Test with:
//!     echo "hello" | nc localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q0 localhost 9999 & done

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use netlib::{Handle, MessageKind, NetConfig, NetLib, Payload};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

static RUNNING: AtomicBool = AtomicBool::new(true);

// ── Stats ──
#[derive(Default)]
struct Stats {
    accepts: u64,
    reads: u64,
    closes: u64,
    bytes_in: u64,
    bytes_out: u64,
    backpressure: u64,
    errors: u64,
}

struct Echo {
    stats: Stats,
    /// Unsent bytes per connection, flushed on `Write`.
    pending: HashMap<Handle, Vec<u8>>,
    start: Instant,
}

type Shared = Rc<RefCell<Echo>>;

impl Echo {
    fn print(&self) {
        let s = &self.stats;
        info!(
            elapsed_s = self.start.elapsed().as_secs(),
            conns = s.accepts.saturating_sub(s.closes),
            accepts = s.accepts,
            reads = s.reads,
            closes = s.closes,
            bytes_in = s.bytes_in,
            bytes_out = s.bytes_out,
            backpressure = s.backpressure,
            errors = s.errors,
            "stats"
        );
    }
}

/// Write `data` (after anything already pending). Whatever the socket does
/// not take is kept for the next `Write`. False if the connection was
/// closed.
fn write_through(echo: &Shared, lib: &NetLib, handle: Handle, data: &[u8]) -> bool {
    let mut buf = echo.borrow_mut().pending.remove(&handle).unwrap_or_default();
    buf.extend_from_slice(data);

    let mut written = 0;
    while written < buf.len() {
        match lib.send(handle, &buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) => {
                warn!(handle = %handle, error = %e, "send failed, closing");
                echo.borrow_mut().stats.errors += 1;
                let _ = lib.close(handle);
                echo.borrow_mut().stats.closes += 1;
                return false;
            }
        }
    }

    let mut e = echo.borrow_mut();
    e.stats.bytes_out += written as u64;
    if written < buf.len() {
        e.stats.backpressure += 1;
        e.pending.insert(handle, buf.split_off(written));
    }
    true
}

fn on_event(echo: &Shared, kind: MessageKind, handle: Handle, payload: Option<Payload<'_>>) {
    let lib = NetLib::instance();
    match kind {
        MessageKind::Connect => {
            if let Some(Payload::Peer(peer)) = payload {
                info!(handle = %handle, peer = %peer, "client connected");
            }
            echo.borrow_mut().stats.accepts += 1;
        }
        MessageKind::Read => loop {
            let data = match lib.recv(handle) {
                Ok(data) => data,
                Err(e) => {
                    warn!(handle = %handle, error = %e, "recv failed");
                    echo.borrow_mut().stats.errors += 1;
                    break;
                }
            };
            if data.is_empty() {
                break;
            }
            {
                let mut e = echo.borrow_mut();
                e.stats.reads += 1;
                e.stats.bytes_in += data.len() as u64;
            }
            if !write_through(echo, lib, handle, &data) {
                break;
            }
        },
        MessageKind::Write => {
            write_through(echo, lib, handle, &[]);
        }
        MessageKind::Close => {
            let mut e = echo.borrow_mut();
            e.pending.remove(&handle);
            e.stats.closes += 1;
        }
        _ => {}
    }
}

fn on_stats(echo: &Shared, _: MessageKind, _: Handle, _: Option<Payload<'_>>) {
    echo.borrow().print();
}

fn on_loop(_: &(), _: MessageKind, _: Handle, _: Option<Payload<'_>>) {
    if !RUNNING.load(Ordering::Relaxed) {
        NetLib::instance().stop();
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let port: u16 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(9999);
    let stats_ms: u64 = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(5000);

    // SIGINT handler for clean shutdown
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let lib = NetLib::init(NetConfig::from_env());
    let echo: Shared = Rc::new(RefCell::new(Echo {
        stats: Stats::default(),
        pending: HashMap::new(),
        start: Instant::now(),
    }));

    let listener = match lib.listen("0.0.0.0", port, on_event, echo.clone()) {
        Ok(h) => h,
        Err(e) => {
            error!(port, error = %e, "listen failed");
            std::process::exit(1);
        }
    };

    let setup = lib
        .register_timer(on_stats, echo.clone(), stats_ms.max(1))
        .and_then(|_| lib.register_loop(on_loop, ()));
    if let Err(e) = setup {
        error!(error = %e, "timer setup failed");
        std::process::exit(1);
    }

    info!(port, handle = %listener, "netlib-echo listening");
    if let Err(e) = lib.run() {
        error!(error = %e, "dispatch loop failed");
    }

    info!("shutting down");
    echo.borrow().print();
    let _ = lib.close(listener);
}

extern "C" fn handle_sigint(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
