//! End-to-end socket behavior: echo round-trips, failure reporting, and the
//! transport upgrade hook.

use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use eddy::{Connection, ConnectionError, Handler, Hooks, Io, ListenError, Reactor, Role, Transport};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn temp_sock_path(tag: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("eddy-{tag}-{}.sock", std::process::id()));
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    path
}

struct EchoServer;

impl Handler for EchoServer {
    fn on_read(&mut self, conn: &Connection, data: &[u8]) {
        conn.send_data(data);
    }
}

/// Sends `payload` on connect, closes once it has been echoed back in full,
/// and reports the collected bytes on close.
fn echo_client(payload: Vec<u8>, done: mpsc::Sender<Vec<u8>>) -> Hooks {
    let expected = payload.len();
    Hooks::new()
        .on_connect(move |conn| conn.send_data(&payload))
        .on_read(move |conn, _| {
            if conn.received_data().len() >= expected {
                conn.close();
            }
        })
        .on_close(move |conn, _| {
            let _ = done.send(conn.received_data());
        })
}

#[test]
fn tcp_echo_round_trip() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let port = free_port();
    reactor.listen_tcp("127.0.0.1", port, || EchoServer).unwrap();

    let payload = [b"blah".repeat(100_000).as_slice(), b"\n\n"].concat();
    let (tx, rx) = mpsc::channel();
    reactor
        .connect_tcp("127.0.0.1", port, echo_client(payload.clone(), tx))
        .unwrap();

    let echoed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(echoed, payload);

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn unix_echo_round_trip() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let path = temp_sock_path("echo");
    reactor.listen_unix(&path, || EchoServer).unwrap();

    let payload = [b"blah".repeat(100_000).as_slice(), b"\n\n"].concat();
    let (tx, rx) = mpsc::channel();
    reactor
        .connect_unix(&path, echo_client(payload.clone(), tx))
        .unwrap();

    let echoed = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(echoed, payload);

    reactor.stop();
    handle.join().unwrap();
    // Teardown unlinks the listener's socket file.
    assert!(!path.exists());
}

#[test]
fn connect_to_unknown_host_reports_host_not_found() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let (tx, rx) = mpsc::channel();
    let client = Hooks::new().on_close(move |_, reason| {
        tx.send(reason).unwrap();
    });
    let conn = reactor.connect_tcp("name.invalid", 4242, client).unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Some(ConnectionError::HostNotFound)
    );
    assert!(conn.is_closed());

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn connect_to_missing_unix_path_reports_host_not_found() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let (tx, rx) = mpsc::channel();
    let client = Hooks::new().on_close(move |_, reason| {
        tx.send(reason).unwrap();
    });
    reactor
        .connect_unix("/nonexistent/eddy-test.sock", client)
        .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Some(ConnectionError::HostNotFound)
    );

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn connect_to_closed_port_reports_refused() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let (tx, rx) = mpsc::channel();
    let client = Hooks::new().on_close(move |_, reason| {
        tx.send(reason).unwrap();
    });
    reactor
        .connect_tcp("127.0.0.1", free_port(), client)
        .unwrap();

    assert_eq!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        Some(ConnectionError::Refused)
    );

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn listen_raises_configuration_errors_synchronously() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let err = reactor
        .listen_unix("/nonexistent-dir/eddy-test.sock", || EchoServer)
        .unwrap_err();
    assert_eq!(err, ListenError::Connection(ConnectionError::HostNotFound));

    // A port that is already bound is rejected at the call site too.
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let err = reactor
        .listen_tcp("127.0.0.1", port, || EchoServer)
        .unwrap_err();
    assert!(matches!(err, ListenError::Connection(_)));

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn close_after_write_flushes_then_closes() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let port = free_port();
    reactor
        .listen_tcp("127.0.0.1", port, || {
            Hooks::new().on_connect(|conn| {
                conn.send_data(b"hello, goodbye");
                conn.close_after_write();
            })
        })
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let client = Hooks::new().on_close(move |conn, reason| {
        tx.send((conn.received_data(), reason)).unwrap();
    });
    reactor.connect_tcp("127.0.0.1", port, client).unwrap();

    let (data, reason) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(data, b"hello, goodbye");
    // The peer hanging up after its banner is a `Closed`, not a clean close.
    assert_eq!(reason, Some(ConnectionError::Closed));

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn connections_snapshot_tracks_attachment() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let port = free_port();
    reactor.listen_tcp("127.0.0.1", port, || EchoServer).unwrap();

    let (tx, rx) = mpsc::channel();
    let client = Hooks::new().on_connect(move |_| {
        tx.send(()).unwrap();
    });
    reactor.connect_tcp("127.0.0.1", port, client).unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let conns = reactor.connections();
    assert!(conns.len() >= 2, "expected listener and client, got {conns:?}");
    assert!(conns.iter().any(|c| c.role() == Role::Listener));
    assert!(reactor.server().is_some());

    reactor.stop();
    handle.join().unwrap();
    assert!(reactor.connections().is_empty());
    assert!(reactor.server().is_none());
}

/// A transport that forwards bytes untouched but counts its use, standing in
/// for a TLS session.
struct Passthrough {
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl Transport for Passthrough {
    fn read(&mut self, io: &mut dyn Io, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        io.read(buf)
    }

    fn write(&mut self, io: &mut dyn Io, buf: &[u8]) -> io::Result<usize> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        io.write(buf)
    }
}

#[test]
fn transport_upgrade_carries_the_byte_stream() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let port = free_port();
    reactor.listen_tcp("127.0.0.1", port, || EchoServer).unwrap();

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    let payload = b"wrapped bytes".to_vec();
    let (tx, rx) = mpsc::channel();

    let expected = payload.len();
    let (reads2, writes2) = (reads.clone(), writes.clone());
    let client = Hooks::new()
        .on_connect(move |conn| {
            conn.start_transport(Box::new(Passthrough {
                reads: reads2.clone(),
                writes: writes2.clone(),
            }));
            conn.send_data(&payload);
        })
        .on_read(move |conn, _| {
            if conn.received_data().len() >= expected {
                conn.close();
            }
        })
        .on_close(move |conn, _| {
            let _ = tx.send(conn.received_data());
        });
    reactor.connect_tcp("127.0.0.1", port, client).unwrap();

    let echoed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(echoed, b"wrapped bytes");
    assert!(writes.load(Ordering::SeqCst) > 0, "transport write unused");
    assert!(reads.load(Ordering::SeqCst) > 0, "transport read unused");

    reactor.stop();
    handle.join().unwrap();
}
