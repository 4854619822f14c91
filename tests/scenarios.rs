//! End-to-end scenarios for the runtime core.
//!
//! Each scenario drives real kernel handles (regular files, socket pairs,
//! TCP connects) through the public service API, with worker threads
//! supplied the way an embedding application would supply them.
#![cfg(unix)]

mod common;

use common::*;
use ioloom::{CancelSource, CancelToken, IoService};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn temp_file_with(content: &[u8]) -> (std::path::PathBuf, std::fs::File) {
    let path = std::env::temp_dir().join(format!(
        "ioloom-test-{}-{:?}",
        std::process::id(),
        thread::current().id()
    ));
    std::fs::write(&path, content).expect("write temp file");
    let file = std::fs::File::open(&path).expect("open temp file");
    (path, file)
}

/// S1: a read of an already-satisfiable regular file completes
/// synchronously; no reactor message is ever delivered.
#[test]
fn s1_synchronous_file_read() {
    init_test_logging();
    let service = IoService::new().expect("create service");
    let (path, file) = temp_file_with(b"hello world!");

    service.register_handle(&file).expect("register");
    let result = block_on(service.submit(FileReadOp::new(
        file.try_clone().expect("clone handle"),
        0,
        8,
    )));
    service.unregister_handle(&file).expect("unregister");

    let data = result.expect("read result");
    assert_eq!(data, b"hello wo");

    let stats = service.stats();
    assert_eq!(stats.callbacks, 0, "no completion was dispatched");
    assert_eq!(stats.resumes, 0, "no continuation was resumed");
    assert_eq!(service.pending_op_count(), 0);

    std::fs::remove_file(path).expect("remove temp file");
}

/// S2: cancelling the token before the operation starts wins outright;
/// the await fails with the cancellation error and nothing leaks.
#[test]
fn s2_cancel_before_start_wins() {
    init_test_logging();
    let service = IoService::new().expect("create service");
    let source = CancelSource::new();
    source.request_cancel();

    let connect = ConnectOp::new("127.0.0.1:1".parse().expect("addr")).expect("create connect");
    let result = block_on(service.submit_cancellable(connect, source.token()));

    assert!(result.expect_err("must be cancelled").is_cancelled());
    assert_eq!(service.pending_op_count(), 0, "no registration leaked");
    assert_eq!(service.stats().resumes, 0);
}

/// S3: cancelling a pending recv resumes it with the cancellation error
/// within a bounded time, and the socket survives.
#[test]
fn s3_cancel_during_pending_recv() {
    init_test_logging();
    let service = IoService::new().expect("create service");
    let (a, mut b) = UnixStream::pair().expect("socket pair");
    service.register_handle(&a).expect("register");

    let source = CancelSource::new();
    let recv = RecvOp::new(&a, 16).expect("create recv");

    with_workers(&service, 1, || {
        let canceller = {
            let source = source.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                source.request_cancel();
            })
        };

        let started = Instant::now();
        let result = block_on(service.submit_cancellable(recv, source.token()));
        assert!(result.expect_err("must be cancelled").is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));

        canceller.join().expect("canceller");
    });

    // The socket is still usable after the cancelled operation.
    b.write_all(b"x").expect("peer write");
    let mut byte = [0_u8; 1];
    let mut a_blocking = a.try_clone().expect("clone");
    a_blocking
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    a_blocking.read_exact(&mut byte).expect("read after cancel");
    assert_eq!(&byte, b"x");

    service.unregister_handle(&a).expect("unregister");
    drop(a);
}

/// S4: a completion racing a cancellation settles to exactly one outcome:
/// either the data arrives or the await fails with the cancellation error.
#[test]
fn s4_completion_cancel_race() {
    init_test_logging();
    let service = IoService::new().expect("create service");

    with_workers(&service, 2, || {
        for round in 0..20 {
            let (a, b) = UnixStream::pair().expect("socket pair");
            service.register_handle(&a).expect("register");

            let source = CancelSource::new();
            let recv = RecvOp::new(&a, 16).expect("create recv");
            let future = service.submit_cancellable(recv, source.token());

            let barrier = Barrier::new(3);
            let mut peer = b.try_clone().expect("clone peer");
            let canceller = source.clone();
            let outcome = thread::scope(|s| {
                s.spawn(|| {
                    barrier.wait();
                    let _ = peer.write_all(b"abcd");
                });
                s.spawn(|| {
                    barrier.wait();
                    canceller.request_cancel();
                });

                barrier.wait();
                block_on(future)
            });

            match outcome {
                Ok(data) => assert_eq!(data, b"abcd", "round {round}"),
                Err(e) => assert!(e.is_cancelled(), "round {round}: {e}"),
            }

            service.unregister_handle(&a).expect("unregister");
        }
    });
}

/// S5: two timers armed out of order resume in deadline order, each
/// exactly once.
#[test]
fn s5_timer_ordering() {
    init_test_logging();
    let service = IoService::new().expect("create service");

    let first_done = Mutex::new(None::<Instant>);
    let second_done = Mutex::new(None::<Instant>);

    let started = Instant::now();
    with_workers(&service, 1, || {
        thread::scope(|s| {
            // Arm the later deadline first.
            s.spawn(|| {
                block_on(service.schedule_after(Duration::from_millis(50), CancelToken::none()))
                    .expect("second timer");
                *second_done.lock().expect("lock") = Some(Instant::now());
            });
            s.spawn(|| {
                block_on(service.schedule_after(Duration::from_millis(10), CancelToken::none()))
                    .expect("first timer");
                *first_done.lock().expect("lock") = Some(Instant::now());
            });
        });
    });

    let first = first_done.lock().expect("lock").expect("first resumed");
    let second = second_done.lock().expect("lock").expect("second resumed");
    assert!(first < second, "earlier deadline resumed first");
    assert!(first - started >= Duration::from_millis(10));
    assert!(second - started >= Duration::from_millis(50));
}

/// S6: stop() unblocks every worker parked in a blocking poll; after
/// reset() workers can re-enter the loop.
#[test]
fn s6_stop_during_blocking_poll() {
    init_test_logging();
    let service = IoService::new().expect("create service");
    const WORKERS: usize = 4;

    thread::scope(|s| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| s.spawn(|| service.process_events().expect("worker")))
            .collect();

        // Let the workers reach their blocking waits.
        thread::sleep(Duration::from_millis(100));

        let stop_issued = Instant::now();
        service.stop();
        for handle in handles {
            handle.join().expect("worker join");
        }
        assert!(
            stop_issued.elapsed() < Duration::from_secs(2),
            "all workers unblocked promptly"
        );
    });

    // While stopped, waits return immediately with no events.
    assert_eq!(service.process_events().expect("stopped"), 0);

    service.reset();
    thread::scope(|s| {
        let handle = s.spawn(|| service.process_events().expect("worker"));
        thread::sleep(Duration::from_millis(50));
        service.stop();
        handle.join().expect("worker join");
    });
}

/// Baseline for S4: with no cancellation, the pending recv resumes with
/// the peer's data.
#[test]
fn recv_completes_with_data() {
    init_test_logging();
    let service = IoService::new().expect("create service");
    let (a, b) = UnixStream::pair().expect("socket pair");
    service.register_handle(&a).expect("register");

    with_workers(&service, 1, || {
        let writer = thread::spawn(move || {
            let mut b = b;
            thread::sleep(Duration::from_millis(30));
            b.write_all(b"data").expect("peer write");
        });

        let recv = RecvOp::new(&a, 16).expect("create recv");
        let data = block_on(service.submit(recv)).expect("recv result");
        assert_eq!(data, b"data");

        writer.join().expect("writer");
    });

    service.unregister_handle(&a).expect("unregister");
}

/// Send and receive through the capability records, exercising the
/// writable-interest path.
#[test]
fn send_recv_roundtrip() {
    init_test_logging();
    let service = IoService::new().expect("create service");
    let (a, b) = UnixStream::pair().expect("socket pair");
    service.register_handle(&a).expect("register a");
    service.register_handle(&b).expect("register b");

    with_workers(&service, 1, || {
        let send = SendOp::new(&a, b"ping".to_vec()).expect("create send");
        let sent = block_on(service.submit(send)).expect("send result");
        assert_eq!(sent, 4);

        let recv = RecvOp::new(&b, 16).expect("create recv");
        let data = block_on(service.submit(recv)).expect("recv result");
        assert_eq!(data, b"ping");
    });

    service.unregister_handle(&a).expect("unregister a");
    service.unregister_handle(&b).expect("unregister b");
}

/// A connect to an unreachable port surfaces an OS error, distinct from
/// cancellation.
#[test]
fn connect_refused_is_resource_error() {
    init_test_logging();
    let service = IoService::new().expect("create service");

    with_workers(&service, 1, || {
        let connect =
            ConnectOp::new("127.0.0.1:1".parse().expect("addr")).expect("create connect");
        let result = block_on(service.submit(connect));
        let err = result.expect_err("connect must fail");
        assert!(!err.is_cancelled(), "refusal is not cancellation: {err}");
    });
}

/// Property 5: resumptions refused by a tiny reactor queue drain through
/// the overflow list; every schedule() still resumes exactly once.
#[test]
fn schedule_overflow_drains() {
    init_test_logging();
    let reactor = std::sync::Arc::new(
        ioloom::reactor::ReadinessReactor::with_queue_capacity(2).expect("create reactor"),
    );
    let service = IoService::with_backend(reactor);

    with_workers(&service, 2, || {
        thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| block_on(service.schedule()));
            }
        });
    });

    assert_eq!(service.stats().resumes, 16);
}
