//! Non-blocking byte pump around the pseudo-terminal master.
//!
//! The master descriptor is switched to non-blocking mode at spawn, so no
//! syscall on it can park a thread. Reads run on one dedicated thread per
//! session that sleeps in `poll(2)` between chunks. Writes are cut into
//! chunks, each handed to a bounded pool of blocking workers shared by all
//! sessions; when the terminal stops taking input the pool slot is released
//! and the writer backs off asynchronously until the channel drains, closes,
//! or the write deadline passes. The read and write handles are independent,
//! so the two directions never contend.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use termbridge_types::DEFAULT_WRITE_DEADLINE_SECS;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, trace, warn};

const READ_CHUNK_BYTES: usize = 4096;
const WRITE_CHUNK_BYTES: usize = 4096;
/// Reader fallback when the channel has no readiness handle
const WOULD_BLOCK_BACKOFF: Duration = Duration::from_millis(10);
/// Upper bound on one `poll(2)` so a closed engine is noticed
const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);
const WRITE_RETRY_MIN: Duration = Duration::from_millis(2);
const WRITE_RETRY_MAX: Duration = Duration::from_millis(50);
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(DEFAULT_WRITE_DEADLINE_SECS);

#[derive(Debug, Error)]
pub enum IoError {
    #[error("terminal channel is closed")]
    Closed,
    #[error("terminal write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("terminal stopped accepting input: wrote {written} of {total} bytes in {deadline:?}")]
    Stalled {
        written: usize,
        total: usize,
        deadline: Duration,
    },
    #[error("terminal worker failed: {0}")]
    Worker(String),
    #[error("read loop already started")]
    ReaderTaken,
}

/// Why the read loop stopped
#[derive(Debug)]
pub enum CloseReason {
    /// Zero-byte read or hangup: every slave handle is gone
    Eof,
    /// The engine was closed locally
    Stopped,
    Error(std::io::Error),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "eof"),
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::Error(e) => write!(f, "read error: {}", e),
        }
    }
}

/// Bounded pool of blocking workers for PTY writes
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `job` on a blocking thread once a pool slot is free.
    ///
    /// The slot is held by the job itself, so it is released when the
    /// syscall finishes even if the caller stops waiting.
    pub async fn run<F, T>(&self, job: F) -> Result<T, IoError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| IoError::Closed)?;
        tokio::task::spawn_blocking(move || {
            let result = job();
            drop(permit);
            result
        })
        .await
        .map_err(|e| IoError::Worker(e.to_string()))
    }
}

/// Readiness check for a non-blocking terminal descriptor.
///
/// Holds its own duplicate of the descriptor, so it stays valid for as long
/// as the read loop needs it.
#[derive(Debug)]
pub struct Readiness {
    #[cfg(unix)]
    fd: std::os::fd::OwnedFd,
}

impl Readiness {
    #[cfg(unix)]
    pub fn new(fd: std::os::fd::BorrowedFd<'_>) -> std::io::Result<Self> {
        Ok(Self {
            fd: fd.try_clone_to_owned()?,
        })
    }

    /// Block up to `timeout` until the descriptor has input or hung up
    fn wait_readable(&self, timeout: Duration) -> std::io::Result<()> {
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;

            let mut pollfd = libc::pollfd {
                fd: self.fd.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
            // SAFETY: one valid pollfd that outlives the call.
            let rc = unsafe { libc::poll(&mut pollfd, 1, millis) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() != ErrorKind::Interrupted {
                    return Err(err);
                }
            }
            Ok(())
        }
        #[cfg(not(unix))]
        {
            thread::sleep(timeout.min(WOULD_BLOCK_BACKOFF));
            Ok(())
        }
    }
}

/// Read/write engine for one pseudo-terminal master
pub struct IoEngine {
    /// Serializes writers: one in-flight write per channel, the rest queue
    write_queue: tokio::sync::Mutex<()>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    readiness: Mutex<Option<Readiness>>,
    closed: Arc<AtomicBool>,
    pool: WorkerPool,
    write_deadline: Duration,
}

impl IoEngine {
    pub fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        pool: WorkerPool,
    ) -> Self {
        Self {
            write_queue: tokio::sync::Mutex::new(()),
            writer: Arc::new(Mutex::new(writer)),
            reader: Mutex::new(Some(reader)),
            readiness: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
            pool,
            write_deadline: DEFAULT_WRITE_DEADLINE,
        }
    }

    /// Wait on `readiness` instead of sleeping when a read would block
    pub fn with_readiness(self, readiness: Readiness) -> Self {
        *self.readiness.lock().unwrap_or_else(|e| e.into_inner()) = Some(readiness);
        self
    }

    pub fn with_write_deadline(mut self, deadline: Duration) -> Self {
        self.write_deadline = deadline;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse further writes and stop the read loop at its next idle point.
    /// Pending writes give up with [`IoError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Write all of `bytes` to the terminal, returning the count written.
    ///
    /// A terminal that stops taking input only delays this channel: the
    /// shared worker slot is given back while waiting.
    pub async fn write(&self, bytes: Bytes) -> Result<usize, IoError> {
        if bytes.is_empty() {
            return if self.is_closed() { Err(IoError::Closed) } else { Ok(0) };
        }

        let _turn = self.write_queue.lock().await;
        let started = Instant::now();
        let total = bytes.len();
        let mut written = 0;
        let mut backoff = WRITE_RETRY_MIN;

        while written < total {
            if self.is_closed() {
                return Err(IoError::Closed);
            }

            let chunk = bytes.slice(written..total.min(written + WRITE_CHUNK_BYTES));
            let writer = Arc::clone(&self.writer);
            match self.pool.run(move || write_some(&writer, &chunk)).await? {
                Ok(0) => {
                    self.close();
                    return Err(IoError::Write(ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    written += n;
                    backoff = WRITE_RETRY_MIN;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() >= self.write_deadline {
                        warn!(written, total, "terminal is not reading its input");
                        return Err(IoError::Stalled {
                            written,
                            total,
                            deadline: self.write_deadline,
                        });
                    }
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(WRITE_RETRY_MAX);
                }
                // The read side sees the same hangup and closes the channel.
                Err(e) if is_hangup(&e) => return Err(IoError::Closed),
                Err(e) => {
                    self.close();
                    return Err(IoError::Write(e));
                }
            }
        }

        trace!(bytes = total, "wrote to terminal");
        Ok(total)
    }

    /// Start the read loop on a dedicated thread.
    ///
    /// `on_bytes` is called for every chunk in the order the terminal
    /// produced it; `on_closed` is called exactly once afterwards.
    pub fn read_loop<F, C>(&self, name: &str, on_bytes: F, on_closed: C) -> Result<JoinHandle<()>, IoError>
    where
        F: FnMut(Bytes) + Send + 'static,
        C: FnOnce(CloseReason) + Send + 'static,
    {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(IoError::ReaderTaken)?;
        let readiness = self.readiness.lock().unwrap_or_else(|e| e.into_inner()).take();

        let closed = Arc::clone(&self.closed);
        let thread_name = format!("pty-read-{}", name);
        thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let reason = pump(reader, readiness.as_ref(), &closed, on_bytes);
                closed.store(true, Ordering::Release);
                debug!(%reason, "terminal read loop finished");
                on_closed(reason);
            })
            .map_err(IoError::Write)
    }
}

/// One `write(2)`, retried only on EINTR
fn write_some(writer: &Mutex<Box<dyn Write + Send>>, chunk: &[u8]) -> std::io::Result<usize> {
    let mut writer = writer.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        match writer.write(chunk) {
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn pump<F>(
    mut reader: Box<dyn Read + Send>,
    readiness: Option<&Readiness>,
    closed: &AtomicBool,
    mut on_bytes: F,
) -> CloseReason
where
    F: FnMut(Bytes),
{
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    loop {
        if closed.load(Ordering::Acquire) {
            return CloseReason::Stopped;
        }
        match reader.read(&mut buffer) {
            Ok(0) => return CloseReason::Eof,
            Ok(n) => on_bytes(Bytes::copy_from_slice(&buffer[..n])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                let waited = match readiness {
                    Some(readiness) => readiness.wait_readable(READ_POLL_INTERVAL),
                    None => {
                        thread::sleep(WOULD_BLOCK_BACKOFF);
                        Ok(())
                    }
                };
                if let Err(e) = waited {
                    return CloseReason::Error(e);
                }
            }
            Err(e) if is_hangup(&e) => return CloseReason::Eof,
            Err(e) => return CloseReason::Error(e),
        }
    }
}

/// Linux reports a closed slave as EIO on the master rather than a
/// zero-byte read.
fn is_hangup(error: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        error.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        error.kind() == ErrorKind::BrokenPipe
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::mpsc;

    /// Writer that records everything into a shared buffer
    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// A terminal whose input queue is full and never drains
    struct FullSink;

    impl Write for FullSink {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// Takes at most three bytes per call and pushes back every other call
    #[derive(Clone, Default)]
    struct TrickleSink {
        data: Arc<Mutex<Vec<u8>>>,
        busy: bool,
    }

    impl Write for TrickleSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.busy = !self.busy;
            if self.busy {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(3);
            self.data.lock().unwrap().extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    /// A reader with nothing to say, ever
    struct SilentReader;

    impl Read for SilentReader {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            Err(ErrorKind::WouldBlock.into())
        }
    }

    fn engine_with(reader: &[u8], writer: Box<dyn Write + Send>) -> IoEngine {
        IoEngine::new(Box::new(Cursor::new(reader.to_vec())), writer, WorkerPool::new(2))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_writes_arrive_in_order() {
        let sink = SharedSink::default();
        let engine = Arc::new(engine_with(b"", Box::new(sink.clone())));

        for i in 0..50u8 {
            let written = engine.write(Bytes::from(vec![i])).await.unwrap();
            assert_eq!(written, 1);
        }

        let expected: Vec<u8> = (0..50u8).collect();
        assert_eq!(*sink.0.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_after_close_is_rejected() {
        let engine = engine_with(b"", Box::new(SharedSink::default()));
        engine.close();
        assert!(matches!(engine.write(Bytes::from_static(b"x")).await, Err(IoError::Closed)));
    }

    #[tokio::test]
    async fn test_failed_write_closes_channel() {
        let engine = engine_with(b"", Box::new(BrokenSink));
        assert!(matches!(
            engine.write(Bytes::from_static(b"x")).await,
            Err(IoError::Write(_))
        ));
        assert!(engine.is_closed());
        assert!(matches!(engine.write(Bytes::from_static(b"y")).await, Err(IoError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_to_hung_up_terminal_reports_closed() {
        struct HungUp;

        impl Write for HungUp {
            fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from_raw_os_error(libc::EIO))
            }

            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let engine = engine_with(b"", Box::new(HungUp));
        assert!(matches!(engine.write(Bytes::from_static(b"x")).await, Err(IoError::Closed)));
        // Left to the read side, which may still be draining output.
        assert!(!engine.is_closed());
    }

    #[test]
    fn test_read_loop_delivers_chunks_then_closes_once() {
        let payload = vec![b'a'; READ_CHUNK_BYTES + 10];
        let engine = engine_with(&payload, Box::new(SharedSink::default()));
        let (tx, rx) = mpsc::channel();
        let close_tx = tx.clone();

        let handle = engine
            .read_loop(
                "test",
                move |chunk| tx.send(Some(chunk)).unwrap(),
                move |reason| {
                    assert!(matches!(reason, CloseReason::Eof));
                    close_tx.send(None).unwrap();
                },
            )
            .unwrap();
        handle.join().unwrap();

        let events: Vec<_> = rx.try_iter().collect();
        let total: usize = events.iter().flatten().map(|c| c.len()).sum();
        assert_eq!(total, payload.len());
        assert_eq!(events.iter().filter(|e| e.is_none()).count(), 1);
        assert!(events.last().unwrap().is_none());
        assert!(engine.is_closed());

        assert!(matches!(
            engine.read_loop("again", |_| {}, |_| {}),
            Err(IoError::ReaderTaken)
        ));
    }

    #[tokio::test]
    async fn test_partial_writes_are_resumed() {
        let sink = TrickleSink::default();
        let engine = engine_with(b"", Box::new(sink.clone()));
        let written = engine.write(Bytes::from_static(b"hello world")).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(*sink.data.lock().unwrap(), b"hello world");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_terminal_does_not_hold_the_pool() {
        let pool = WorkerPool::new(1);
        let stuck = Arc::new(IoEngine::new(
            Box::new(Cursor::new(Vec::new())),
            Box::new(FullSink),
            pool.clone(),
        ));
        let sink = SharedSink::default();
        let healthy = IoEngine::new(Box::new(Cursor::new(Vec::new())), Box::new(sink.clone()), pool);

        let pending = tokio::spawn({
            let stuck = Arc::clone(&stuck);
            async move { stuck.write(Bytes::from(vec![b'x'; 2 * 1024 * 1024])).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let written = tokio::time::timeout(
            Duration::from_secs(5),
            healthy.write(Bytes::from_static(b"hi\n")),
        )
        .await
        .expect("write queued behind another channel")
        .unwrap();
        assert_eq!(written, 3);
        assert_eq!(*sink.0.lock().unwrap(), b"hi\n");

        stuck.close();
        let result = tokio::time::timeout(Duration::from_secs(5), pending)
            .await
            .expect("pending write ignored close")
            .unwrap();
        assert!(matches!(result, Err(IoError::Closed)));
    }

    #[tokio::test]
    async fn test_stalled_write_gives_up_after_deadline() {
        let engine = engine_with(b"", Box::new(FullSink)).with_write_deadline(Duration::from_millis(100));
        let err = engine.write(Bytes::from_static(b"abc")).await.unwrap_err();
        assert!(matches!(
            err,
            IoError::Stalled {
                written: 0,
                total: 3,
                ..
            }
        ));
        // A stall is not a broken channel.
        assert!(!engine.is_closed());
    }

    #[test]
    fn test_close_stops_idle_read_loop() {
        let engine = IoEngine::new(
            Box::new(SilentReader),
            Box::new(SharedSink::default()),
            WorkerPool::new(1),
        );
        let (tx, rx) = mpsc::channel();
        let handle = engine
            .read_loop("idle", |_| {}, move |reason| tx.send(reason).unwrap())
            .unwrap();

        engine.close();
        handle.join().unwrap();
        assert!(matches!(rx.try_recv().unwrap(), CloseReason::Stopped));
    }
}
