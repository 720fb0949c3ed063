//! End-to-end scheduler scenarios over real loopback sockets.

use crate::net::Socket;
use crate::op::{Op, Outcome};
use crate::sched::Scheduler;
use crate::task::{Step, TaskState, from_fn};
use skein_types::Error;
use similar_asserts::assert_eq;
use std::cell::RefCell;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::{Duration, Instant};

fn sched() -> Scheduler {
    Scheduler::with_defaults().expect("scheduler")
}

/// A connected non-blocking loopback pair, built outside the runtime.
fn wrapped_pair() -> (Socket, Socket) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    (
        Socket::wrap(socket2::Socket::from(client)).expect("wrap"),
        Socket::wrap(socket2::Socket::from(server)).expect("wrap"),
    )
}

/// A listening runtime socket on an ephemeral loopback port.
fn listener() -> (Socket, std::net::SocketAddr) {
    let sock = Socket::stream_v4().expect("socket");
    sock.set_reuse_address(true).expect("reuse");
    sock.bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
    sock.listen(16).expect("listen");
    let addr = sock.local_addr().expect("local addr");
    (sock, addr)
}

#[test_log::test]
fn echo_round_trip_and_quiescence() {
    let mut s = sched();
    let (listen_sock, addr) = listener();
    let echoed: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    // Echo task: accept one connection, read 13 bytes, write them back.
    let mut state = 0_u8;
    let mut conn: Option<Socket> = None;
    let mut got: Vec<u8> = Vec::new();
    let server = s.spawn(from_fn(move |_cx, input| match state {
        0 => {
            state = 1;
            Ok(Step::Yield(listen_sock.accept()))
        }
        1 => {
            let (c, _peer) = input?.into_accepted().expect("accepted");
            let first = c.recv(13);
            conn = Some(c);
            state = 2;
            Ok(Step::Yield(first))
        }
        2 => {
            got.extend(input?.into_bytes().expect("bytes"));
            let c = conn.as_ref().expect("connection");
            if got.len() < 13 {
                return Ok(Step::Yield(c.recv(13 - got.len())));
            }
            state = 3;
            Ok(Step::Yield(c.send_all(got.clone())))
        }
        _ => {
            input?;
            Ok(Step::unit())
        }
    }));

    let seen = echoed.clone();
    let mut state = 0_u8;
    let mut sock: Option<Socket> = None;
    let mut back: Vec<u8> = Vec::new();
    let client = s.spawn(from_fn(move |_cx, input| match state {
        0 => {
            let c = Socket::stream_v4().map_err(|e| Error::socket(&e))?;
            let op = c.connect(addr);
            sock = Some(c);
            state = 1;
            Ok(Step::Yield(op))
        }
        1 => {
            input?;
            state = 2;
            Ok(Step::Yield(sock.as_ref().expect("socket").send_all(&b"hello, world!"[..])))
        }
        2 => {
            input?;
            state = 3;
            Ok(Step::Yield(sock.as_ref().expect("socket").recv(13)))
        }
        _ => {
            back.extend(input?.into_bytes().expect("bytes"));
            if back.len() < 13 {
                return Ok(Step::Yield(sock.as_ref().expect("socket").recv(13 - back.len())));
            }
            *seen.borrow_mut() = back.clone();
            Ok(Step::unit())
        }
    }));

    s.run().expect("run");
    assert_eq!(*echoed.borrow(), b"hello, world!".to_vec());
    assert_eq!(s.state(server), Some(TaskState::Done));
    assert_eq!(s.state(client), Some(TaskState::Done));
}

#[test]
fn recv_on_an_idle_socket_times_out_within_resolution() {
    let mut s = sched();
    let (client, _server) = wrapped_pair();
    let observed = Rc::new(RefCell::new(None));

    let seen = observed.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(client.recv(1).timeout(Duration::from_millis(100))));
        }
        *seen.borrow_mut() = Some(input.expect_err("idle socket must time out"));
        Ok(Step::unit())
    }));

    let started = Instant::now();
    s.run().expect("run");
    let elapsed = started.elapsed();

    assert_eq!(*observed.borrow(), Some(Error::Timeout));
    assert!(elapsed >= Duration::from_millis(100), "fired early: {elapsed:?}");
    // Deadline plus one poll slice of slack.
    assert!(elapsed < Duration::from_millis(700), "fired late: {elapsed:?}");
}

/// Writer and reader for the weak-timeout scenarios: the reader drains
/// slowly, in `chunk`-sized reads spaced `pause` apart.
fn slow_reader(sock: Socket, total: usize, pause: Duration, chunk: usize) -> impl crate::task::Coroutine {
    let mut state = 0_u8;
    let mut received = 0_usize;
    from_fn(move |_cx, input| match state {
        0 => {
            state = 1;
            Ok(Step::Yield(Op::sleep(pause)))
        }
        1 => {
            input?;
            state = 2;
            Ok(Step::Yield(sock.recv(chunk).timeout(Duration::from_secs(2))))
        }
        _ => {
            match input {
                Ok(out) => {
                    received += out.into_bytes().map_or(0, |b| b.len());
                    if received >= total {
                        return Ok(Step::done(received));
                    }
                    state = 1;
                    Ok(Step::Yield(Op::sleep(pause)))
                }
                // The writer gave up; drain no further.
                Err(_) => Ok(Step::done(received)),
            }
        }
    })
}

#[test_log::test]
fn weak_timeout_survives_on_steady_progress() {
    let mut s = sched();
    let (writer_sock, reader_sock) = wrapped_pair();
    writer_sock.set_send_buffer_size(64 * 1024).expect("sndbuf");
    reader_sock.set_recv_buffer_size(64 * 1024).expect("rcvbuf");

    let payload = vec![0xa5_u8; 2 * 1024 * 1024];
    let total = payload.len();
    let observed = Rc::new(RefCell::new(None));

    let seen = observed.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            // Total transfer takes far longer than 250ms; only the
            // idle-detection semantics of a weak timeout let it finish.
            return Ok(Step::Yield(
                writer_sock
                    .send_all(payload.clone())
                    .timeout(Duration::from_millis(250))
                    .weak(),
            ));
        }
        *seen.borrow_mut() = Some(match input {
            Ok(Outcome::SentAll(n)) => Ok(n),
            Ok(other) => panic!("unexpected outcome: {other:?}"),
            Err(e) => Err(e),
        });
        Ok(Step::unit())
    }));
    s.spawn(slow_reader(
        reader_sock,
        total,
        Duration::from_millis(25),
        128 * 1024,
    ));

    s.run().expect("run");
    assert_eq!(*observed.borrow(), Some(Ok(total)));
}

#[test]
fn hard_timeout_fires_despite_progress() {
    let mut s = sched();
    let (writer_sock, reader_sock) = wrapped_pair();
    writer_sock.set_send_buffer_size(64 * 1024).expect("sndbuf");
    reader_sock.set_recv_buffer_size(64 * 1024).expect("rcvbuf");

    let payload = vec![0x5a_u8; 2 * 1024 * 1024];
    let payload_len = payload.len();
    let observed = Rc::new(RefCell::new(None));

    let seen = observed.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(
                writer_sock
                    .send_all(payload.clone())
                    .timeout(Duration::from_millis(150)),
            ));
        }
        *seen.borrow_mut() = Some(input.expect_err("total-duration deadline must fire"));
        Ok(Step::unit())
    }));
    s.spawn(slow_reader(
        reader_sock,
        payload_len,
        Duration::from_millis(25),
        64 * 1024,
    ));

    s.run().expect("run");
    assert_eq!(*observed.borrow(), Some(Error::Timeout));
}

#[test]
fn close_cancels_a_parked_recv() {
    let mut s = sched();
    let (a, _b) = wrapped_pair();
    let observed = Rc::new(RefCell::new(None));

    let seen = observed.clone();
    let recv_sock = a.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(recv_sock.recv(4096).no_timeout()));
        }
        *seen.borrow_mut() = Some(input.expect_err("close must cancel the recv"));
        Ok(Step::unit())
    }));

    let close_sock = a.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(close_sock.close()));
        }
        assert!(matches!(input?, Outcome::Closed));
        Ok(Step::unit())
    }));

    s.run().expect("run");
    assert_eq!(*observed.borrow(), Some(Error::ConnectionClosed));
    assert!(a.is_closed());
    assert!(a.token().is_none(), "fd unregistered from the proactor");
}

#[test]
fn sendall_recv_round_trip_law() {
    let mut s = sched();
    let (writer_sock, reader_sock) = wrapped_pair();

    let mut rng = rand::rng();
    let payload: Vec<u8> = (0..256 * 1024).map(|_| rand::Rng::random(&mut rng)).collect();
    let expect = payload.clone();
    let total = payload.len();
    let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(writer_sock.send_all(payload.clone()).no_timeout()));
        }
        assert!(matches!(input?, Outcome::SentAll(n) if n == total));
        Ok(Step::unit())
    }));

    let sink = collected.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(reader_sock.recv(64 * 1024).no_timeout()));
        }
        sink.borrow_mut().extend(input?.into_bytes().expect("bytes"));
        if sink.borrow().len() < total {
            return Ok(Step::Yield(reader_sock.recv(64 * 1024).no_timeout()));
        }
        Ok(Step::unit())
    }));

    s.run().expect("run");
    assert_eq!(*collected.borrow(), expect);
}

#[test]
fn sendfile_streams_a_file_through_the_proactor() -> anyhow::Result<()> {
    use std::io::Write;

    let mut s = sched();
    let (writer_sock, reader_sock) = wrapped_pair();

    let payload: Vec<u8> = (0..100_000_u32).map(|i| (i % 251) as u8).collect();
    let total = payload.len() as u64;
    let mut tmp = tempfile::tempfile()?;
    tmp.write_all(&payload)?;

    let sent = Rc::new(RefCell::new(0_u64));
    let collected: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));

    let seen = sent.clone();
    let mut op = Some(writer_sock.sendfile(tmp, Some(0), Some(total))?.no_timeout());
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(op.take().expect("one sendfile")));
        }
        match input? {
            Outcome::SentFile(n) => *seen.borrow_mut() = n,
            other => panic!("unexpected outcome: {other:?}"),
        }
        Ok(Step::unit())
    }));

    let sink = collected.clone();
    let mut state = 0_u8;
    s.spawn(from_fn(move |_cx, input| {
        if state == 0 {
            state = 1;
            return Ok(Step::Yield(reader_sock.recv(32 * 1024).no_timeout()));
        }
        sink.borrow_mut().extend(input?.into_bytes().expect("bytes"));
        if (sink.borrow().len() as u64) < total {
            return Ok(Step::Yield(reader_sock.recv(32 * 1024).no_timeout()));
        }
        Ok(Step::unit())
    }));

    s.run().expect("run");
    assert_eq!(*sent.borrow(), total);
    assert_eq!(*collected.borrow(), payload);
    Ok(())
}
