//! Kernel call bridge
//!
//! Runs blocking system calls on a small pool of threads so worker event
//! loops never block. Jobs flow through two rings:
//!
//! ```text
//!   WorkerCx::kcall ──► submit ring (MPMC, shared) ──► bridge thread
//!                                                         │ execute
//!   worker loop ◄── post eventfd ◄── completion ring ◄────┘ (one per worker)
//! ```
//!
//! A completion ring signals its worker only when it goes from empty to
//! non-empty, and the worker drains the whole ring on each wakeup.
//! Completions carry the submitting slot's [`KevHandle`]; if that slot was
//! freed while the call ran, the worker drops the result.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam_queue::ArrayQueue;
use tracing::{debug, error, trace};
use trackline_core::KevHandle;

use crate::config::KcallStart;
use crate::error::{EngineError, EngineResult, Resource};
use crate::platform::EventFd;

/// A blocking call to run on the bridge
pub enum KcallOp {
    Open { path: PathBuf, options: OpenOptions },
    Read { file: Arc<File>, offset: u64, len: usize },
    Write { file: Arc<File>, offset: u64, data: Vec<u8> },
    Fsync { file: Arc<File> },
    /// Any other blocking call
    Call(Box<dyn FnOnce() -> io::Result<usize> + Send>),
}

impl fmt::Debug for KcallOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KcallOp::Open { path, .. } => write!(f, "Open({})", path.display()),
            KcallOp::Read { offset, len, .. } => write!(f, "Read(@{offset}, {len})"),
            KcallOp::Write { offset, data, .. } => write!(f, "Write(@{offset}, {})", data.len()),
            KcallOp::Fsync { .. } => f.write_str("Fsync"),
            KcallOp::Call(_) => f.write_str("Call"),
        }
    }
}

/// Successful result of a [`KcallOp`]
#[derive(Debug)]
pub enum KcallOutput {
    Opened(File),
    /// Bytes read; shorter than requested at end of file
    Read(Vec<u8>),
    Written(usize),
    Synced,
    Value(usize),
}

/// Run a call on the current thread
pub fn execute(op: KcallOp) -> io::Result<KcallOutput> {
    match op {
        KcallOp::Open { path, options } => options.open(path).map(KcallOutput::Opened),
        KcallOp::Read { file, offset, len } => {
            let mut buf = vec![0u8; len];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(KcallOutput::Read(buf))
        }
        KcallOp::Write { file, offset, data } => {
            file.write_all_at(&data, offset)?;
            Ok(KcallOutput::Written(data.len()))
        }
        KcallOp::Fsync { file } => file.sync_all().map(|_| KcallOutput::Synced),
        KcallOp::Call(f) => f().map(KcallOutput::Value),
    }
}

pub(crate) type Completion = (KevHandle, io::Result<KcallOutput>);

/// Completions bound for one worker
pub struct CompletionRing {
    queue: ArrayQueue<Completion>,
    signalled: AtomicBool,
    closed: AtomicBool,
    post: Arc<EventFd>,
}

impl CompletionRing {
    pub fn new(depth: usize, post: Arc<EventFd>) -> Self {
        Self {
            queue: ArrayQueue::new(depth.max(1)),
            signalled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            post,
        }
    }

    /// Deliver a completion, waiting for room if the ring is full.
    ///
    /// Only for bridge threads: the owning worker drains the ring, so it
    /// must use [`try_push`](Self::try_push). Dropped if the worker has
    /// exited.
    pub(crate) fn push(&self, mut item: Completion) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                trace!(kev = %item.0, "worker gone; completion dropped");
                return;
            }
            match self.try_push(item) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    thread::yield_now();
                }
            }
        }
    }

    /// Deliver a completion without waiting; hands it back if the ring is full
    pub(crate) fn try_push(&self, item: Completion) -> Result<(), Completion> {
        self.queue.push(item)?;
        if !self.signalled.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.post.notify() {
                error!(error = %e, "failed to signal completion");
            }
        }
        Ok(())
    }

    /// Hand every queued completion to `deliver`
    pub(crate) fn drain(&self, mut deliver: impl FnMut(Completion)) -> usize {
        self.signalled.store(false, Ordering::Release);
        let mut n = 0;
        while let Some(item) = self.queue.pop() {
            deliver(item);
            n += 1;
        }
        n
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

pub(crate) struct KcallJob {
    pub kev: KevHandle,
    pub op: KcallOp,
    pub reply: Arc<CompletionRing>,
}

/// Counting semaphore bridge threads sleep on
struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self { permits: Mutex::new(0), cond: Condvar::new() }
    }

    fn post(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        while *permits == 0 {
            permits = self.cond.wait(permits).unwrap_or_else(PoisonError::into_inner);
        }
        *permits -= 1;
    }
}

struct BridgeInner {
    submit: ArrayQueue<KcallJob>,
    sem: Semaphore,
    stop: AtomicBool,
    active: AtomicUsize,
    submitted: AtomicU64,
    completed: AtomicU64,
}

/// Bridge counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub threads: usize,
    pub submitted: u64,
    pub completed: u64,
    pub pending: usize,
}

/// Pool of threads executing blocking calls
pub struct KcallBridge {
    inner: Arc<BridgeInner>,
    threads: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Outcome of the one-time thread start
    started: OnceLock<Result<(), io::ErrorKind>>,
}

impl KcallBridge {
    pub fn new(threads: usize, depth: usize) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                submit: ArrayQueue::new(depth.max(1)),
                sem: Semaphore::new(),
                stop: AtomicBool::new(false),
                active: AtomicUsize::new(0),
                submitted: AtomicU64::new(0),
                completed: AtomicU64::new(0),
            }),
            threads,
            handles: Mutex::new(Vec::new()),
            started: OnceLock::new(),
        }
    }

    /// Create a bridge and, for `KcallStart::Eager`, start its threads
    pub fn with_start(threads: usize, depth: usize, start: KcallStart) -> EngineResult<Self> {
        let bridge = Self::new(threads, depth);
        if start == KcallStart::Eager && threads > 0 {
            bridge.ensure_started()?;
        }
        Ok(bridge)
    }

    /// Whether calls run on bridge threads (false: inline on the worker)
    #[inline]
    pub fn is_async(&self) -> bool {
        self.threads > 0
    }

    #[inline]
    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_started(&self) -> bool {
        matches!(self.started.get(), Some(Ok(())))
    }

    /// Start the threads if nobody has yet
    pub fn ensure_started(&self) -> EngineResult<()> {
        let outcome = *self.started.get_or_init(|| self.spawn_threads());
        outcome.map_err(|kind| EngineError::Spawn(io::Error::from(kind)))
    }

    fn spawn_threads(&self) -> Result<(), io::ErrorKind> {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        for i in 0..self.threads {
            let inner = Arc::clone(&self.inner);
            let spawned = thread::Builder::new()
                .name(format!("trackline-kcall-{i}"))
                .spawn(move || bridge_loop(inner, i));
            match spawned {
                Ok(h) => handles.push(h),
                Err(e) => {
                    error!(thread = i, error = %e, "failed to spawn kcall thread");
                    if handles.is_empty() {
                        return Err(e.kind());
                    }
                    break;
                }
            }
        }
        debug!(threads = handles.len(), "kcall bridge started");
        Ok(())
    }

    pub(crate) fn submit(&self, job: KcallJob) -> EngineResult<()> {
        if self.inner.stop.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        self.ensure_started()?;
        if self.inner.submit.push(job).is_err() {
            return Err(EngineError::Capacity(Resource::KcallQueue));
        }
        self.inner.submitted.fetch_add(1, Ordering::Relaxed);
        self.inner.sem.post(1);
        Ok(())
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            threads: self.handles.lock().unwrap_or_else(PoisonError::into_inner).len(),
            submitted: self.inner.submitted.load(Ordering::Relaxed),
            completed: self.inner.completed.load(Ordering::Relaxed),
            pending: self.inner.submit.len(),
        }
    }

    /// Stop and join the threads. In-flight calls finish first.
    pub fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
            guard.drain(..).collect()
        };
        self.inner.sem.post(handles.len());
        for h in handles {
            let _ = h.join();
        }
        debug!("kcall bridge stopped");
    }
}

impl Drop for KcallBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn bridge_loop(inner: Arc<BridgeInner>, index: usize) {
    loop {
        inner.sem.wait();
        if inner.stop.load(Ordering::Acquire) {
            break;
        }
        let Some(job) = inner.submit.pop() else { continue };

        inner.active.fetch_add(1, Ordering::Relaxed);
        trace!(thread = index, kev = %job.kev, op = ?job.op, "kcall");
        let result = execute(job.op);
        inner.active.fetch_sub(1, Ordering::Relaxed);
        inner.completed.fetch_add(1, Ordering::Relaxed);

        job.reply.push((job.kev, result));
    }
}
