//! Loop lifecycle and scheduling behavior, driven from outside the loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use eddy::{BaseHandler, ListenError, Reactor, ReactorError};

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn run_in_thread_ticks_until_stopped() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());
    assert!(reactor.thread().is_some());

    wait_until("ticks to advance", || reactor.ticks() >= 2);

    reactor.stop();
    handle.join().unwrap();
    assert!(!reactor.is_running());
    assert_eq!(reactor.ticks(), 0);
    assert!(reactor.thread().is_none());
}

#[test]
fn starting_twice_fails_with_already_running() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    assert_eq!(reactor.run(), Err(ReactorError::AlreadyRunning));
    assert!(matches!(
        reactor.run_in_thread(),
        Err(ReactorError::AlreadyRunning)
    ));

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn a_stopped_reactor_can_run_again() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("first run", || reactor.is_running());
    reactor.stop();
    handle.join().unwrap();

    let handle = reactor.run_in_thread().unwrap();
    wait_until("second run", || reactor.is_running());
    reactor.stop();
    handle.join().unwrap();
    assert_eq!(reactor.ticks(), 0);
}

#[test]
fn stop_is_idempotent_from_any_thread() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let other = {
        let reactor = reactor.clone();
        thread::spawn(move || reactor.stop())
    };
    reactor.stop();
    reactor.stop();
    other.join().unwrap();

    handle.join().unwrap();
    assert!(!reactor.is_running());
}

#[test]
fn on_tick_fires_every_tick() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    reactor
        .on_tick(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    wait_until("per-tick task to fire", || fired.load(Ordering::SeqCst) >= 3);
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn schedule_runs_inline_on_the_loop_thread() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let (tx, rx) = mpsc::channel();
    let loop_side = reactor.clone();
    reactor
        .next_tick(move || {
            let ticks_outside = loop_side.ticks();
            let inner = loop_side.clone();
            let tx_inline = tx.clone();
            loop_side
                .schedule(move || {
                    tx_inline.send(("inline", inner.ticks())).unwrap();
                })
                .unwrap();
            tx.send(("after", ticks_outside)).unwrap();
        })
        .unwrap();

    let (first, inline_ticks) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let (second, outside_ticks) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // Inline means the body ran before schedule() returned, within the same
    // tick as its caller.
    assert_eq!(first, "inline");
    assert_eq!(second, "after");
    assert_eq!(inline_ticks, outside_ticks);

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn schedule_off_loop_defers_onto_the_loop_thread() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let (tx, rx) = mpsc::channel();
    let probe = reactor.clone();
    reactor
        .schedule(move || {
            tx.send(probe.in_loop_thread()).unwrap();
        })
        .unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(true));
    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn interval_fires_on_cadence() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    reactor
        .at_interval(Duration::from_millis(100), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    thread::sleep(Duration::from_millis(550));
    let n = fired.load(Ordering::SeqCst);
    assert!((3..=7).contains(&n), "interval fired {n} times in 550ms");

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn delay_fires_once_no_earlier_than_requested() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    reactor
        .delay(Duration::from_millis(150), move || {
            tx.send(start.elapsed()).unwrap();
        })
        .unwrap();

    let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(elapsed >= Duration::from_millis(150), "fired after {elapsed:?}");
    assert!(
        rx.recv_timeout(Duration::from_millis(400)).is_err(),
        "delayed task fired a second time"
    );

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn run_block_returns_when_work_drains() {
    let reactor = Reactor::new().unwrap();
    let scheduler = reactor.clone();
    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();

    let start = Instant::now();
    reactor
        .run_block(move || {
            scheduler
                .delay(Duration::from_millis(100), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        })
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert!(!reactor.is_running());
    assert_eq!(reactor.ticks(), 0);
}

#[test]
fn queue_delivers_fifo_on_the_loop_thread() {
    let reactor = Reactor::new().unwrap();
    let handle = reactor.run_in_thread().unwrap();
    wait_until("loop start", || reactor.is_running());

    let queue = reactor.create_queue::<u32>();
    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let tx = tx.clone();
        let probe = reactor.clone();
        queue.pop(move |value| {
            tx.send((value, probe.in_loop_thread())).unwrap();
        });
    }

    queue.push(1);
    queue.push(2);
    queue.push(3);

    for expected in 1..=3 {
        let (value, on_loop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(value, expected);
        assert_eq!(on_loop, Ok(true));
    }

    reactor.stop();
    handle.join().unwrap();
}

#[test]
fn socket_operations_demand_a_running_loop() {
    let reactor = Reactor::new().unwrap();
    assert!(matches!(
        reactor.connect_tcp("127.0.0.1", 1, BaseHandler),
        Err(ReactorError::NotRunning)
    ));
    assert!(matches!(
        reactor.connect_unix("/tmp/nowhere.sock", BaseHandler),
        Err(ReactorError::NotRunning)
    ));
    assert!(matches!(
        reactor.listen_tcp("127.0.0.1", 0, || BaseHandler),
        Err(ListenError::Reactor(ReactorError::NotRunning))
    ));
    assert!(matches!(
        reactor.listen_unix("/tmp/nowhere.sock", || BaseHandler),
        Err(ListenError::Reactor(ReactorError::NotRunning))
    ));
}
