//! Shared helpers for integration tests.
//!
//! Provides consistent tracing-based logging initialisation, a
//! thread-parking `block_on` for driving futures without an executor
//! dependency, and concrete I/O operations exercising the capability
//! record the way an external file/socket façade would.
#![allow(dead_code)]

use ioloom::{Interest, IoService, Operation, Progress, Result as IoResult};
use std::fs::File;
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::os::unix::net::UnixStream;
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Initialises test logging. Safe to call multiple times; first call wins.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

struct ThreadWaker {
    thread: Thread,
    notified: AtomicBool,
}

impl Wake for ThreadWaker {
    fn wake(self: Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.notified.store(true, Ordering::Release);
        self.thread.unpark();
    }
}

/// Drives a future to completion on the current thread, parking between
/// polls. Panics if the future does not resolve within `budget`.
pub fn block_on_with_budget<F: Future>(future: F, budget: Duration) -> F::Output {
    let give_up = Instant::now() + budget;
    let inner = Arc::new(ThreadWaker {
        thread: thread::current(),
        notified: AtomicBool::new(false),
    });
    let waker: Waker = inner.clone().into();
    let mut cx = Context::from_waker(&waker);
    let mut future = pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => {
                while !inner.notified.swap(false, Ordering::Acquire) {
                    let now = Instant::now();
                    assert!(now < give_up, "future did not resolve within {budget:?}");
                    thread::park_timeout(give_up - now);
                }
            }
        }
    }
}

/// Drives a future to completion with a 10-second budget.
pub fn block_on<F: Future>(future: F) -> F::Output {
    block_on_with_budget(future, Duration::from_secs(10))
}

/// Runs `body` while `workers` threads drive the service's event loop,
/// then stops the service and joins them.
pub fn with_workers<R>(service: &IoService, workers: usize, body: impl FnOnce() -> R) -> R {
    thread::scope(|s| {
        for _ in 0..workers {
            s.spawn(|| {
                let _ = service.process_events().expect("worker loop");
            });
        }
        let result = body();
        service.stop();
        result
    })
}

/// Positioned file read; completes synchronously, as a read of an
/// already-satisfiable regular file does.
pub struct FileReadOp {
    file: File,
    offset: u64,
    buf: Vec<u8>,
    outcome: Option<io::Result<usize>>,
}

impl FileReadOp {
    pub fn new(file: File, offset: u64, len: usize) -> Self {
        Self {
            file,
            offset,
            buf: vec![0; len],
            outcome: None,
        }
    }
}

impl Operation for FileReadOp {
    type Output = Vec<u8>;

    fn try_start(&mut self) -> io::Result<Progress> {
        self.outcome = Some(self.file.read_at(&mut self.buf, self.offset));
        Ok(Progress::Complete)
    }

    fn perform(&mut self) {
        // Synchronous completion never reaches the event loop.
        unreachable!("FileReadOp completes in try_start");
    }

    fn take_result(&mut self) -> IoResult<Vec<u8>> {
        match self.outcome.take().expect("started") {
            Ok(n) => {
                self.buf.truncate(n);
                Ok(std::mem::take(&mut self.buf))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Socket receive: arms for readability, performs the read when the event
/// loop observes readiness.
pub struct RecvOp {
    stream: UnixStream,
    buf: Vec<u8>,
    outcome: Option<io::Result<usize>>,
}

impl RecvOp {
    pub fn new(stream: &UnixStream, len: usize) -> io::Result<Self> {
        let stream = stream.try_clone()?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            buf: vec![0; len],
            outcome: None,
        })
    }
}

impl Operation for RecvOp {
    type Output = Vec<u8>;

    fn try_start(&mut self) -> io::Result<Progress> {
        Ok(Progress::Pending {
            handle: self.stream.as_raw_fd(),
            interest: Interest::readable(),
        })
    }

    fn perform(&mut self) {
        self.outcome = Some(self.stream.read(&mut self.buf));
    }

    fn take_result(&mut self) -> IoResult<Vec<u8>> {
        match self.outcome.take().expect("performed") {
            Ok(n) => {
                self.buf.truncate(n);
                Ok(std::mem::take(&mut self.buf))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Socket send: arms for writability.
pub struct SendOp {
    stream: UnixStream,
    data: Vec<u8>,
    outcome: Option<io::Result<usize>>,
}

impl SendOp {
    pub fn new(stream: &UnixStream, data: Vec<u8>) -> io::Result<Self> {
        let stream = stream.try_clone()?;
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            data,
            outcome: None,
        })
    }
}

impl Operation for SendOp {
    type Output = usize;

    fn try_start(&mut self) -> io::Result<Progress> {
        Ok(Progress::Pending {
            handle: self.stream.as_raw_fd(),
            interest: Interest::writable(),
        })
    }

    fn perform(&mut self) {
        self.outcome = Some(self.stream.write(&self.data));
    }

    fn take_result(&mut self) -> IoResult<usize> {
        match self.outcome.take().expect("performed") {
            Ok(n) => Ok(n),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(target_os = "macos")]
const EINPROGRESS: i32 = 36;
#[cfg(not(target_os = "macos"))]
const EINPROGRESS: i32 = 115;

/// TCP connect via `socket2`: a non-blocking connect arms for writability
/// and extracts `SO_ERROR` on completion.
pub struct ConnectOp {
    socket: socket2::Socket,
    addr: socket2::SockAddr,
    outcome: Option<io::Result<()>>,
}

impl ConnectOp {
    pub fn new(addr: std::net::SocketAddr) -> io::Result<Self> {
        let socket = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            None,
        )?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            addr: addr.into(),
            outcome: None,
        })
    }
}

impl Operation for ConnectOp {
    type Output = ();

    fn try_start(&mut self) -> io::Result<Progress> {
        match self.socket.connect(&self.addr) {
            Ok(()) => {
                self.outcome = Some(Ok(()));
                Ok(Progress::Complete)
            }
            Err(e)
                if e.raw_os_error() == Some(EINPROGRESS)
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                Ok(Progress::Pending {
                    handle: self.socket.as_raw_fd(),
                    interest: Interest::writable(),
                })
            }
            Err(e) => {
                self.outcome = Some(Err(e));
                Ok(Progress::Complete)
            }
        }
    }

    fn perform(&mut self) {
        self.outcome = Some(match self.socket.take_error() {
            Ok(Some(err)) => Err(err),
            Ok(None) => Ok(()),
            Err(err) => Err(err),
        });
    }

    fn take_result(&mut self) -> IoResult<()> {
        match self.outcome.take().expect("performed") {
            Ok(()) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
