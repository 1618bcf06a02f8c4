//! Worker event loop
//!
//! A worker is one OS thread multiplexing three event sources through one
//! epoll instance:
//!
//! - the post eventfd, shared by the task queue and the kernel call
//!   completion ring, so other threads can wake the loop;
//! - a timerfd ticking at the timer resolution while timers are armed;
//! - kernel event slots registered with `kq_attach`.
//!
//! The shared half ([`Worker`]) is reachable from any thread and only
//! supports posting tasks and stopping. Everything else lives in
//! [`WorkerCx`], which is created for the worker thread and handed by
//! `&mut` to every callback that runs there.

use std::cell::Cell;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};
use trackline_core::{clock, KevHandle, WorkerId};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult, Resource};
use crate::kcall::{self, CompletionRing, KcallBridge, KcallJob, KcallOp};
use crate::kev::{KevEvent, KevFn, KevPool, POST_TOKEN, TIMER_TOKEN};
use crate::platform::{Event, EventFd, Interest, Poller, TimerFd};
use crate::task::{Task, TaskQueue};
use crate::timer::{Interval, Timer, TimerQueue};

thread_local! {
    static CURRENT_WORKER: Cell<Option<WorkerId>> = const { Cell::new(None) };
}

/// Id of the worker running on this thread, if any
#[inline]
pub fn current_worker_id() -> Option<WorkerId> {
    CURRENT_WORKER.with(|c| c.get())
}

/// Shared half of a worker
pub struct Worker {
    id: WorkerId,
    tasks: TaskQueue,
    post: Arc<EventFd>,
    completions: Arc<CompletionRing>,
    stop: AtomicBool,
    /// Tracks currently assigned
    jobs: AtomicUsize,
    iterations: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
}

impl Worker {
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Post a task to run on this worker. Thread-safe and idempotent.
    pub fn post(&self, task: &Task) -> EngineResult<bool> {
        if self.stop.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        self.tasks.post(task)
    }

    /// Tracks currently assigned to this worker
    #[inline]
    pub fn jobs(&self) -> usize {
        self.jobs.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_job(&self) {
        self.jobs.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_job(&self) {
        let _ = self
            .jobs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Completed loop iterations
    #[inline]
    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    /// Posted and executed task counts
    pub fn task_counters(&self) -> (u64, u64) {
        self.tasks.counters()
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.thread_id.get().copied()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Ask the loop to exit after its current iteration
    pub(crate) fn stop(&self) {
        if !self.stop.swap(true, Ordering::AcqRel) {
            if let Err(e) = self.post.notify() {
                warn!(worker = %self.id, error = %e, "failed to wake worker for stop");
            }
        }
    }

    /// Wait for the loop thread to exit. A no-op on the worker's own thread.
    pub(crate) fn join(&self) {
        let handle = self.thread.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(h) = handle {
            if h.thread().id() == thread::current().id() {
                return;
            }
            if h.join().is_err() {
                error!(worker = %self.id, "worker thread panicked");
            }
        }
    }
}

/// Create a worker and start its loop thread.
///
/// The OS facilities are created here, on the calling thread, so a failure
/// is reported to the caller instead of killing the new thread.
pub(crate) fn spawn(
    id: WorkerId,
    config: &EngineConfig,
    bridge: Arc<KcallBridge>,
) -> EngineResult<Arc<Worker>> {
    let post = Arc::new(EventFd::new()?);
    let poller = Poller::new(256)?;
    let tick = TimerFd::new()?;

    poller
        .add(post.as_raw_fd(), POST_TOKEN, Interest::READABLE)
        .map_err(|e| EngineError::os("epoll_ctl(post)", &e))?;
    poller
        .add(tick.as_raw_fd(), TIMER_TOKEN, Interest::READABLE)
        .map_err(|e| EngineError::os("epoll_ctl(timer)", &e))?;

    let worker = Arc::new(Worker {
        id,
        tasks: TaskQueue::new(config.max_tasks, Arc::clone(&post)),
        completions: Arc::new(CompletionRing::new(config.kcall_queue_depth, Arc::clone(&post))),
        post,
        stop: AtomicBool::new(false),
        jobs: AtomicUsize::new(0),
        iterations: AtomicU64::new(0),
        thread: Mutex::new(None),
        thread_id: OnceLock::new(),
    });

    let cx = WorkerCx {
        worker: Arc::clone(&worker),
        poller,
        tick,
        timers: TimerQueue::new(),
        kevs: KevPool::new(config.max_kevs),
        bridge,
        now: clock::monotonic(),
        poll_mode: config.poll_mode,
        resolution: config.timer_resolution,
        grace: config.timer_grace,
        idle_since: None,
    };

    let handle = thread::Builder::new()
        .name(format!("trackline-{id}"))
        .spawn(move || cx.run())
        .map_err(EngineError::Spawn)?;
    let _ = worker.thread_id.set(handle.thread().id());
    *worker.thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

    debug!(worker = %id, "worker started");
    Ok(worker)
}

/// Loop-owned half of a worker, passed to every callback it runs
pub struct WorkerCx {
    worker: Arc<Worker>,
    poller: Poller,
    tick: TimerFd,
    timers: TimerQueue,
    kevs: KevPool,
    bridge: Arc<KcallBridge>,
    /// Cached once per loop iteration
    now: Instant,
    poll_mode: bool,
    resolution: Duration,
    grace: Duration,
    /// When the timer queue last became empty with the tick still armed
    idle_since: Option<Instant>,
}

impl WorkerCx {
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.worker.id
    }

    #[inline]
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Monotonic time cached at the start of this loop iteration
    #[inline]
    pub fn now(&self) -> Instant {
        self.now
    }

    /// Wall clock time since the Unix epoch
    #[inline]
    pub fn wall(&self) -> Duration {
        clock::wall()
    }

    /// Post a task to this worker
    pub fn task(&mut self, task: &Task) -> EngineResult<bool> {
        self.worker.post(task)
    }

    /// Withdraw a pending task
    pub fn cancel_task(&mut self, task: &Task) -> bool {
        task.cancel()
    }

    /// Arm, re-arm or remove (`Interval::Off`) a timer on this worker
    pub fn timer(
        &mut self,
        timer: Timer,
        interval: Interval,
        func: impl FnMut(&mut WorkerCx) + Send + 'static,
    ) -> EngineResult<()> {
        let armed = self.timers.set(timer, interval, Box::new(func), self.now);
        if armed {
            self.idle_since = None;
            if !self.tick.is_armed() {
                self.tick
                    .arm_periodic(self.resolution)
                    .map_err(|e| EngineError::os("timerfd_settime", &e))?;
                trace!(worker = %self.worker.id, "timer tick armed");
            }
        }
        Ok(())
    }

    /// Remove a timer. Returns false if it was not armed.
    pub fn cancel_timer(&mut self, timer: Timer) -> bool {
        self.timers.remove(timer)
    }

    pub fn timer_armed(&self, timer: Timer) -> bool {
        self.timers.is_armed(timer)
    }

    /// Allocate a kernel event slot. Fails with `Capacity(Kevs)` when the
    /// configured maximum is live.
    pub fn kev_alloc(
        &mut self,
        handler: impl FnMut(&mut WorkerCx, KevHandle, KevEvent) + Send + 'static,
    ) -> EngineResult<KevHandle> {
        let handler: KevFn = Box::new(handler);
        self.kevs.alloc(handler).ok_or(EngineError::Capacity(Resource::Kevs))
    }

    /// Free a slot and drop its registration. Pending notifications and
    /// in-flight kernel calls for it are discarded when they arrive.
    pub fn kev_free(&mut self, kev: KevHandle) -> bool {
        match self.kevs.free(kev) {
            Some(Some(fd)) => {
                if let Err(e) = self.poller.delete(fd) {
                    trace!(%kev, fd, error = %e, "epoll_ctl(DEL) failed");
                }
                true
            }
            Some(None) => true,
            None => false,
        }
    }

    pub fn kev_live(&self, kev: KevHandle) -> bool {
        self.kevs.contains(kev)
    }

    /// Live kernel event slots
    pub fn kevs_in_use(&self) -> usize {
        self.kevs.len()
    }

    /// Register `fd` for readiness events delivered to `kev`'s handler
    pub fn kq_attach(&mut self, kev: KevHandle, fd: RawFd, interest: Interest) -> EngineResult<()> {
        if !self.kevs.contains(kev) {
            return Err(EngineError::Config("kq_attach on a freed kernel event slot"));
        }
        let res = if self.kevs.fd(kev) == Some(fd) {
            self.poller.modify(fd, kev.to_token(), interest)
        } else {
            self.poller.add(fd, kev.to_token(), interest)
        };
        res.map_err(|e| EngineError::os("epoll_ctl", &e))?;
        self.kevs.set_fd(kev, fd);
        Ok(())
    }

    /// Run a blocking call off this thread; its result arrives as
    /// `KevEvent::Completed` on `kev`.
    ///
    /// Without bridge threads the call runs inline and is delivered on the
    /// next loop iteration. Fails with `Capacity(KcallQueue)`, without
    /// running the call, while this worker's completion ring is full.
    pub fn kcall(&mut self, kev: KevHandle, op: KcallOp) -> EngineResult<()> {
        if !self.kevs.contains(kev) {
            return Err(EngineError::Config("kcall on a freed kernel event slot"));
        }
        if !self.bridge.is_async() {
            let ring = &self.worker.completions;
            if ring.is_full() {
                return Err(EngineError::Capacity(Resource::KcallQueue));
            }
            let result = kcall::execute(op);
            return ring.try_push((kev, result)).map_err(|(kev, _)| {
                warn!(%kev, "completion ring full; inline result dropped");
                EngineError::Capacity(Resource::KcallQueue)
            });
        }
        self.bridge.submit(KcallJob {
            kev,
            op,
            reply: Arc::clone(&self.worker.completions),
        })
    }

    fn run(mut self) {
        CURRENT_WORKER.with(|c| c.set(Some(self.worker.id)));
        let _ = self.worker.thread_id.set(thread::current().id());
        let span = tracing::debug_span!("worker", worker = %self.worker.id);
        let _enter = span.enter();
        debug!("event loop running");

        let timeout = if self.poll_mode { Some(Duration::ZERO) } else { None };
        let mut events: Vec<Event> = Vec::with_capacity(64);

        loop {
            if let Err(e) = self.poller.wait(&mut events, timeout) {
                error!(error = %e, "epoll_wait failed; worker exiting");
                break;
            }
            self.now = clock::monotonic();

            for ev in &events {
                self.dispatch(*ev);
            }
            self.fire_timers();
            self.update_tick();

            self.worker.iterations.fetch_add(1, Ordering::Relaxed);
            if self.worker.stop.load(Ordering::Acquire) {
                break;
            }
            if self.poll_mode && events.is_empty() {
                thread::yield_now();
            }
        }

        self.worker.completions.close();
        debug!(kevs = self.kevs.len(), timers = self.timers.len(), "event loop exited");
    }

    fn dispatch(&mut self, ev: Event) {
        match ev.token {
            POST_TOKEN => {
                self.worker.post.drain();
                let worker = Arc::clone(&self.worker);
                worker.tasks.drain(|task| task.run(self));
                worker
                    .completions
                    .drain(|(kev, result)| self.deliver(kev, KevEvent::Completed(result)));
            }
            TIMER_TOKEN => {
                self.tick.drain();
            }
            token => {
                let kev = KevHandle::from_token(token);
                if ev.readable {
                    self.deliver(kev, KevEvent::Readable);
                }
                if ev.writable {
                    self.deliver(kev, KevEvent::Writable);
                }
            }
        }
    }

    fn deliver(&mut self, kev: KevHandle, event: KevEvent) {
        let Some(mut handler) = self.kevs.take_handler(kev) else {
            trace!(%kev, ?event, "stale kernel event dropped");
            return;
        };
        handler(self, kev, event);
        self.kevs.restore_handler(kev, handler);
    }

    fn fire_timers(&mut self) {
        for mut fired in self.timers.take_due(self.now) {
            (fired.func)(self);
            self.timers.restore(fired);
        }
    }

    fn update_tick(&mut self) {
        if !self.tick.is_armed() {
            return;
        }
        if !self.timers.is_empty() {
            self.idle_since = None;
            return;
        }
        let since = *self.idle_since.get_or_insert(self.now);
        if self.now.duration_since(since) >= self.grace {
            if let Err(e) = self.tick.disarm() {
                warn!(error = %e, "failed to disarm timer tick");
            }
            self.idle_since = None;
            trace!("timer tick disarmed");
        }
    }
}
