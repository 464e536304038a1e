//! End-to-end over real loopback sockets: listen, connect, confirm, accept,
//! echo, peer close.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use netlib::{ConnectionState, Handle, MessageKind, NetConfig, NetLib, Payload};

#[derive(Default)]
struct Trace {
    server: Vec<String>,
    client: Vec<String>,
    echoed: Vec<u8>,
    timed_out: bool,
}

type Shared = Rc<RefCell<Trace>>;

fn server(trace: &Shared, kind: MessageKind, handle: Handle, payload: Option<Payload<'_>>) {
    let lib = NetLib::instance();
    match kind {
        MessageKind::Connect => {
            let Some(Payload::Peer(peer)) = payload else {
                panic!("connect without peer");
            };
            trace.borrow_mut().server.push(format!("connect {}", peer.address));
        }
        MessageKind::Read => loop {
            let data = lib.recv(handle).unwrap();
            if data.is_empty() {
                break;
            }
            assert_eq!(lib.send(handle, &data).unwrap(), data.len());
            trace.borrow_mut().server.push(format!("read {}", data.len()));
        },
        MessageKind::Close => {
            assert_eq!(lib.state(handle).unwrap(), ConnectionState::Closing);
            trace.borrow_mut().server.push("close".into());
            lib.stop();
        }
        other => panic!("server got {other:?}"),
    }
}

fn client(trace: &Shared, kind: MessageKind, handle: Handle, _: Option<Payload<'_>>) {
    let lib = NetLib::instance();
    match kind {
        MessageKind::Confirm => {
            trace.borrow_mut().client.push("confirm".into());
            assert_eq!(lib.send(handle, b"hello").unwrap(), 5);
        }
        MessageKind::Read => {
            let data = lib.recv(handle).unwrap();
            let done = {
                let mut t = trace.borrow_mut();
                t.echoed.extend_from_slice(&data);
                t.echoed == b"hello"
            };
            if done {
                trace.borrow_mut().client.push("echoed".into());
                lib.close(handle).unwrap();
            }
        }
        MessageKind::Write => {}
        other => panic!("client got {other:?}"),
    }
}

#[test]
fn loopback_echo_round_trip() {
    let lib = NetLib::init(NetConfig::default().poll_timeout(Duration::from_millis(10)));
    let trace: Shared = Rc::default();

    let listener = lib.listen("127.0.0.1", 0, server, trace.clone()).unwrap();
    let local = lib.local_endpoint(listener).unwrap();
    assert_eq!(local.address, "127.0.0.1");
    assert_ne!(local.port, 0);

    let conn = lib.connect("127.0.0.1", local.port, client, trace.clone()).unwrap();
    assert_eq!(lib.state(conn).unwrap(), ConnectionState::Connecting);

    let watchdog = lib
        .register_timer(
            |trace: &Shared, _, _, _| {
                trace.borrow_mut().timed_out = true;
                NetLib::instance().stop();
            },
            trace.clone(),
            5_000,
        )
        .unwrap();

    lib.run().unwrap();
    lib.cancel_timer(watchdog).unwrap();

    let t = trace.borrow();
    assert!(!t.timed_out, "loop timed out: server={:?} client={:?}", t.server, t.client);
    assert_eq!(t.client, vec!["confirm", "echoed"]);
    assert_eq!(t.server.first().map(String::as_str), Some("connect 127.0.0.1"));
    assert_eq!(t.server.last().map(String::as_str), Some("close"));
    assert_eq!(t.echoed, b"hello");

    assert!(lib.state(conn).is_err());
    assert_eq!(lib.state(listener).unwrap(), ConnectionState::Listening);
    lib.close(listener).unwrap();
}
