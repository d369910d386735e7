//! Integration tests: real sockets against local servers.
//!
//! Each test binds a listener on an ephemeral port, serves canned
//! responses from a thread, and drives the client against it.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use fanline::{
    Client, Config, ConnState, ErrorKind, RequestOpts, Scheme, SocketCache, callback, hook,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn listen() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// An address nothing is listening on: bind, read the port, drop.
fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

fn ok_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

fn read_request_head(stream: &mut TcpStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => buf.push(byte[0]),
            Err(e) => panic!("server read: {e}"),
        }
    }
    buf
}

/// Serve `responses` sequentially on a single accepted connection.
/// Returns the raw request heads seen.
fn serve_on_one_conn(
    listener: TcpListener,
    responses: Vec<Vec<u8>>,
) -> thread::JoinHandle<Vec<Vec<u8>>> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut heads = Vec::new();
        for resp in responses {
            let head = read_request_head(&mut stream);
            if head.is_empty() {
                break;
            }
            heads.push(head);
            stream.write_all(&resp).unwrap();
            stream.flush().unwrap();
        }
        heads
    })
}

/// Serve one request per accepted connection. Returns connections served.
fn serve_conns(listener: TcpListener, responses: Vec<Vec<u8>>) -> thread::JoinHandle<usize> {
    thread::spawn(move || {
        let mut served = 0;
        for resp in responses {
            let Ok((mut stream, _)) = listener.accept() else {
                break;
            };
            let head = read_request_head(&mut stream);
            if head.is_empty() {
                continue;
            }
            stream.write_all(&resp).unwrap();
            let _ = stream.flush();
            served += 1;
        }
        served
    })
}

/// Accept connections and hold them open without responding.
fn serve_silent(listener: TcpListener, hold: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        listener.set_nonblocking(true).unwrap();
        let deadline = Instant::now() + hold;
        let mut held = Vec::new();
        while Instant::now() < deadline {
            match listener.accept() {
                Ok((stream, _)) => held.push(stream),
                Err(_) => thread::sleep(Duration::from_millis(5)),
            }
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn get_against_local_server() {
    let (listener, addr) = listen();
    let server = serve_on_one_conn(listener, vec![ok_response("ok")]);

    let mut client = Client::new(Config::new()).unwrap();
    let seen: Rc<RefCell<Option<(ErrorKind, u16, Vec<u8>)>>> = Rc::new(RefCell::new(None));
    let sink = seen.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            head: Some(vec![("Host".to_string(), "localhost".to_string())]),
            callback: Some(callback(move |ctx| {
                let resp = ctx.response().unwrap();
                *sink.borrow_mut() =
                    Some((ctx.error_kind(), resp.status(), resp.body().to_vec()));
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    let (kind, status, body) = seen.borrow_mut().take().unwrap();
    assert_eq!(kind, ErrorKind::NoError);
    assert_eq!(status, 200);
    assert_eq!(body, b"ok");

    let conn = client.conn(id).unwrap();
    assert_eq!(conn.state(), ConnState::Completed);
    assert!(conn.errors().is_empty());
    assert_eq!(conn.attempts_left(), 1);

    let heads = server.join().unwrap();
    assert!(heads[0].starts_with(b"GET / HTTP/1.1\r\nHost: localhost\r\n"));
}

#[test]
fn failover_to_second_host() {
    let bad = refused_addr();
    let (listener, good) = listen();
    let server = serve_on_one_conn(listener, vec![ok_response("hi")]);

    let mut client = Client::new(Config::new()).unwrap();
    let status = Rc::new(RefCell::new(0u16));
    let sink = status.clone();
    let id = client
        .request(RequestOpts {
            host: Some(vec![bad.to_string(), good.to_string()].into()),
            retries: Some(1),
            callback: Some(callback(move |ctx| {
                *sink.borrow_mut() = ctx.response().map(|r| r.status()).unwrap_or(0);
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(*status.borrow(), 200);
    let conn = client.conn(id).unwrap();
    let kinds: Vec<_> = conn.errors().iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![ErrorKind::Connect]);
    assert_eq!(
        conn.errors()[0].target.as_ref().unwrap().port,
        bad.port(),
        "the connect error belongs to the refused host"
    );
    assert_eq!(conn.target().unwrap().port, good.port());
    server.join().unwrap();
}

#[test]
fn timeout_exhausts_attempts() {
    let (listener, addr) = listen();
    let server = serve_silent(listener, Duration::from_millis(500));

    let mut client = Client::new(Config::new()).unwrap();
    let outcome: Rc<RefCell<Option<(ErrorKind, u32)>>> = Rc::new(RefCell::new(None));
    let sink = outcome.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            request_timeout: Some(Duration::from_millis(80)),
            retries: Some(2),
            callback: Some(callback(move |ctx| {
                *sink.borrow_mut() = Some((ctx.error_kind(), ctx.conn().attempts_left()));
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    let (kind, attempts_left) = outcome.borrow_mut().take().unwrap();
    assert!(kind.is_timeout());
    assert_eq!(kind, ErrorKind::RequestTimeout);
    assert_eq!(attempts_left, 0);

    let conn = client.conn(id).unwrap();
    assert_eq!(conn.errors().len(), 3);
    assert!(
        conn.errors()
            .iter()
            .all(|e| e.kind == ErrorKind::RequestTimeout)
    );
    drop(client);
    server.join().unwrap();
}

#[test]
fn reinit_retargets_connection() {
    let (l1, a1) = listen();
    let moved =
        b"HTTP/1.1 301 Moved\r\nLocation: /\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
    let s1 = serve_on_one_conn(l1, vec![moved.to_vec()]);
    let (l2, a2) = listen();
    let s2 = serve_on_one_conn(l2, vec![ok_response("done")]);

    let mut client = Client::new(Config::new()).unwrap();
    let calls: Rc<RefCell<Vec<(u16, u32)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = calls.clone();
    let other = a2.to_string();
    let id = client
        .request(RequestOpts {
            host: Some(a1.to_string().into()),
            callback: Some(callback(move |ctx| {
                let status = ctx.response().map(|r| r.status()).unwrap_or(0);
                sink.borrow_mut().push((status, ctx.conn().attempts_left()));
                if status == 301 {
                    ctx.reinit(RequestOpts {
                        host: Some(other.clone().into()),
                        ..Default::default()
                    });
                }
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    let calls = calls.borrow();
    assert_eq!(calls.len(), 2, "terminal callback ran once per attempt chain");
    assert_eq!(calls[0].0, 301);
    assert_eq!(calls[1].0, 200);
    // Reinit reset the budget before the new attempt: retries 0 -> one
    // attempt, untouched by the successful second chain.
    assert_eq!(calls[1].1, 1);

    let conn = client.conn(id).unwrap();
    assert_eq!(conn.target().unwrap().port, a2.port());
    s1.join().unwrap();
    s2.join().unwrap();
}

#[test]
fn socket_cache_reuse_and_close() {
    let (listener, addr) = listen();
    let closing =
        b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\nConnection: close\r\n\r\nb".to_vec();
    let server = serve_on_one_conn(listener, vec![ok_response("a"), closing]);

    let cache = Rc::new(RefCell::new(SocketCache::new()));
    let mut config = Config::new();
    config.socket_cache = Some(cache.clone());
    let mut client = Client::new(config).unwrap();
    let host = addr.to_string();

    client
        .request(RequestOpts {
            host: Some(host.clone().into()),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();
    assert_eq!(cache.borrow().len(), 1);
    assert!(
        cache
            .borrow()
            .contains(&addr.ip().to_string(), addr.port(), Scheme::Http)
    );

    let second = client
        .request(RequestOpts {
            host: Some(host.into()),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();
    assert!(client.conn(second).unwrap().reused_socket());
    // Second response came with Connection: close, so nothing is parked.
    assert!(cache.borrow().is_empty());

    // Both requests went over the single accepted connection.
    let heads = server.join().unwrap();
    assert_eq!(heads.len(), 2);
}

#[test]
fn break_leaves_connections_resumable() {
    let (l1, a1) = listen();
    let s1 = serve_on_one_conn(l1, vec![ok_response("x")]);
    let (l2, a2) = listen();
    let s2 = serve_silent(l2, Duration::from_millis(400));

    let mut client = Client::new(Config::new()).unwrap();
    let slow = client
        .request(RequestOpts {
            host: Some(a2.to_string().into()),
            ..Default::default()
        })
        .unwrap();
    let fast = client
        .request(RequestOpts {
            host: Some(a1.to_string().into()),
            callback: Some(callback(|ctx| ctx.break_loop())),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert!(!client.is_running());
    assert_eq!(client.conn(fast).unwrap().state(), ConnState::Completed);
    // Break does not alter the other connection's state.
    assert_ne!(client.conn(slow).unwrap().state(), ConnState::Completed);

    client.drop_conn(slow);
    assert!(client.conn(slow).is_none());
    client.run().unwrap();

    s1.join().unwrap();
    s2.join().unwrap();
}

#[test]
fn hooks_fire_in_state_order_and_timeline_is_valid() {
    let (listener, addr) = listen();
    let server = serve_on_one_conn(listener, vec![ok_response("t")]);

    let mut config = Config::new();
    config.keep_timeline = true;
    let mut client = Client::new(config).unwrap();

    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let push = |name: &'static str| {
        let order = order.clone();
        hook(move |_conn| {
            order.borrow_mut().push(name);
            Ok(())
        })
    };
    let terminal_order = order.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            hooks: fanline::Hooks {
                init: Some(push("init")),
                connecting: Some(push("connecting")),
                connected: Some(push("connected")),
                writing: Some(push("writing")),
                reading: Some(push("reading")),
            },
            callback: Some(callback(move |_ctx| {
                terminal_order.borrow_mut().push("terminal");
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(
        *order.borrow(),
        ["init", "connecting", "connected", "writing", "reading", "terminal"]
    );

    let conn = client.conn(id).unwrap();
    let tl: Vec<ConnState> = conn.timeline().iter().map(|(s, _)| *s).collect();
    assert_eq!(tl.first(), Some(&ConnState::Initialized));
    assert_eq!(tl.last(), Some(&ConnState::Completed));
    assert_eq!(tl[tl.len() - 2], ConnState::UserAction);
    assert_eq!(
        tl.iter().filter(|s| **s == ConnState::UserAction).count(),
        1
    );
    let pos = |s: ConnState| tl.iter().position(|x| *x == s).unwrap();
    assert!(pos(ConnState::ResolveDns) < pos(ConnState::Connecting));
    assert!(pos(ConnState::Connecting) < pos(ConnState::Connected));
    assert!(pos(ConnState::Connected) < pos(ConnState::Writing));
    assert!(pos(ConnState::Writing) < pos(ConnState::Reading));
    assert!(pos(ConnState::Reading) < pos(ConnState::UserAction));

    server.join().unwrap();
}

#[test]
fn missing_content_length_is_terminal() {
    let (listener, addr) = listen();
    let server = serve_on_one_conn(listener, vec![b"HTTP/1.1 200 OK\r\n\r\n".to_vec()]);

    let mut client = Client::new(Config::new()).unwrap();
    let kind = Rc::new(RefCell::new(ErrorKind::NoError));
    let sink = kind.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            retries: Some(3),
            callback: Some(callback(move |ctx| {
                *sink.borrow_mut() = ctx.error_kind();
                assert!(ctx.response().is_none());
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(*kind.borrow(), ErrorKind::Terminal);
    let conn = client.conn(id).unwrap();
    // Terminal: no retry branch, a single error despite the budget.
    assert_eq!(conn.errors().len(), 1);
    assert_eq!(conn.state(), ConnState::Completed);
    server.join().unwrap();
}

#[test]
fn failing_hook_reaches_terminal_callback() {
    let (listener, addr) = listen();
    let server = serve_silent(listener, Duration::from_millis(300));

    let mut client = Client::new(Config::new()).unwrap();
    let seen: Rc<RefCell<Option<ErrorKind>>> = Rc::new(RefCell::new(None));
    let sink = seen.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            hooks: fanline::Hooks {
                connected: Some(hook(|_conn| Err("refusing to proceed".into()))),
                ..Default::default()
            },
            callback: Some(callback(move |ctx| {
                *sink.borrow_mut() = Some(ctx.error_kind());
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(*seen.borrow(), Some(ErrorKind::Internal));
    let conn = client.conn(id).unwrap();
    assert_eq!(conn.last_error().unwrap().kind, ErrorKind::Internal);
    assert!(
        conn.last_error()
            .unwrap()
            .message
            .contains("refusing to proceed")
    );
    assert_eq!(conn.state(), ConnState::Completed);
    drop(client);
    server.join().unwrap();
}

#[test]
fn callback_retry_runs_second_attempt() {
    let (listener, addr) = listen();
    let server = serve_conns(listener, vec![ok_response("first"), ok_response("second")]);

    let mut client = Client::new(Config::new()).unwrap();
    let bodies: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = bodies.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            retries: Some(1),
            callback: Some(callback(move |ctx| {
                let first = sink.borrow().is_empty();
                if let Some(resp) = ctx.response() {
                    sink.borrow_mut().push(resp.body().to_vec());
                }
                if first {
                    ctx.retry();
                }
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(*bodies.borrow(), vec![b"first".to_vec(), b"second".to_vec()]);
    // The user retry consumed one attempt out of the budget of two.
    assert_eq!(client.conn(id).unwrap().attempts_left(), 1);
    assert_eq!(server.join().unwrap(), 2);
}

#[test]
fn drop_conn_skips_terminal_callback() {
    let (listener, addr) = listen();
    let server = serve_silent(listener, Duration::from_millis(300));

    let mut client = Client::new(Config::new()).unwrap();
    let fired = Rc::new(RefCell::new(false));
    let sink = fired.clone();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            callback: Some(callback(move |_ctx| {
                *sink.borrow_mut() = true;
            })),
            ..Default::default()
        })
        .unwrap();
    for _ in 0..5 {
        client.run_nowait().unwrap();
    }
    client.drop_conn(id);

    assert!(client.conn(id).is_none());
    assert!(!*fired.borrow());
    // Nothing left to drive.
    client.run().unwrap();
    drop(client);
    server.join().unwrap();
}

#[test]
fn run_until_stops_at_state() {
    let (listener, addr) = listen();
    let server = serve_silent(listener, Duration::from_millis(400));

    let mut client = Client::new(Config::new()).unwrap();
    let id = client
        .request(RequestOpts {
            host: Some(addr.to_string().into()),
            ..Default::default()
        })
        .unwrap();
    client.run_until(ConnState::Reading, &[id]).unwrap();

    let state = client.conn(id).unwrap().state();
    assert!(state >= ConnState::Reading);
    assert_ne!(state, ConnState::Completed);

    client.drop_conn(id);
    drop(client);
    server.join().unwrap();
}

#[test]
fn concurrent_requests_complete_independently() {
    let (l1, a1) = listen();
    let s1 = serve_on_one_conn(l1, vec![ok_response("one")]);
    let (l2, a2) = listen();
    let s2 = serve_on_one_conn(l2, vec![ok_response("two")]);

    let mut client = Client::new(Config::new()).unwrap();
    let bodies: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let mut ids = Vec::new();
    for addr in [a1, a2] {
        let sink = bodies.clone();
        ids.push(
            client
                .request(RequestOpts {
                    host: Some(addr.to_string().into()),
                    callback: Some(callback(move |ctx| {
                        let body = ctx.response().unwrap().body().to_vec();
                        sink.borrow_mut().push(String::from_utf8(body).unwrap());
                    })),
                    ..Default::default()
                })
                .unwrap(),
        );
    }
    client.run().unwrap();

    let mut got = bodies.borrow().clone();
    got.sort();
    assert_eq!(got, ["one", "two"]);
    for id in ids {
        assert_eq!(client.conn(id).unwrap().state(), ConnState::Completed);
    }
    s1.join().unwrap();
    s2.join().unwrap();
}

#[test]
fn callback_submits_follow_up_request() {
    let (l1, a1) = listen();
    let s1 = serve_on_one_conn(l1, vec![ok_response("lead")]);
    let (l2, a2) = listen();
    let s2 = serve_on_one_conn(l2, vec![ok_response("follow")]);

    let mut client = Client::new(Config::new()).unwrap();
    let bodies: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let follow_sink = bodies.clone();
    let follow_cb = callback(move |ctx| {
        let body = ctx.response().unwrap().body().to_vec();
        follow_sink.borrow_mut().push(String::from_utf8(body).unwrap());
    });
    let lead_sink = bodies.clone();
    let follow_host = a2.to_string();
    client
        .request(RequestOpts {
            host: Some(a1.to_string().into()),
            callback: Some(callback(move |ctx| {
                let body = ctx.response().unwrap().body().to_vec();
                lead_sink.borrow_mut().push(String::from_utf8(body).unwrap());
                ctx.submit(RequestOpts {
                    host: Some(follow_host.clone().into()),
                    callback: Some(follow_cb.clone()),
                    ..Default::default()
                })
                .unwrap();
            })),
            ..Default::default()
        })
        .unwrap();
    client.run().unwrap();

    assert_eq!(*bodies.borrow(), ["lead", "follow"]);
    s1.join().unwrap();
    s2.join().unwrap();
}
