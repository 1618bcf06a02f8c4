//! Task queue
//!
//! A [`Task`] is a reusable callback handle. Posting it to a worker is
//! thread-safe and idempotent: a task that is already queued is not queued
//! again, and once it has fired it can be posted again.
//!
//! ```text
//!   post():   Idle --CAS--> Queued   push onto ArrayQueue, wake worker
//!   cancel(): Queued --CAS--> Idle   entry stays in the queue, skipped
//!   drain():  Queued --CAS--> Idle   then run the callback
//! ```
//!
//! Cancellation is lazy: the queue entry is dropped when the worker pops
//! it and finds the task no longer queued.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_queue::ArrayQueue;

use crate::error::{EngineError, EngineResult, Resource};
use crate::platform::EventFd;
use crate::worker::WorkerCx;

const IDLE: u8 = 0;
const QUEUED: u8 = 1;

/// Task callback, run on the worker the task was posted to
pub type TaskFn = Box<dyn FnMut(&mut WorkerCx) + Send>;

struct TaskInner {
    label: &'static str,
    state: AtomicU8,
    func: Mutex<TaskFn>,
}

/// Reusable, idempotently-postable callback handle
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    pub fn new(label: &'static str, func: impl FnMut(&mut WorkerCx) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                label,
                state: AtomicU8::new(IDLE),
                func: Mutex::new(Box::new(func)),
            }),
        }
    }

    #[inline]
    pub fn label(&self) -> &'static str {
        self.inner.label
    }

    /// Whether the task is waiting to run
    #[inline]
    pub fn is_queued(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == QUEUED
    }

    /// Withdraw a pending task. Returns false if it was not queued.
    pub fn cancel(&self) -> bool {
        self.inner
            .state
            .compare_exchange(QUEUED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Claim a popped queue entry for execution
    fn claim(&self) -> bool {
        self.inner
            .state
            .compare_exchange(QUEUED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run the callback on the current worker
    pub(crate) fn run(&self, cx: &mut WorkerCx) {
        let mut func = self.inner.func.lock().unwrap_or_else(PoisonError::into_inner);
        (func)(cx);
    }

    /// Same underlying task
    #[inline]
    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("label", &self.inner.label)
            .field("queued", &self.is_queued())
            .finish()
    }
}

/// Per-worker FIFO of posted tasks
pub struct TaskQueue {
    queue: ArrayQueue<Task>,
    /// Set while a wakeup is outstanding, so bursts post one notification
    signalled: AtomicBool,
    post: Arc<EventFd>,
    posted: AtomicU64,
    executed: AtomicU64,
}

impl TaskQueue {
    pub fn new(capacity: usize, post: Arc<EventFd>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            signalled: AtomicBool::new(false),
            post,
            posted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        }
    }

    /// Queue `task` unless it is already queued.
    ///
    /// Returns `Ok(true)` if this call queued it, `Ok(false)` if it was
    /// already pending.
    pub fn post(&self, task: &Task) -> EngineResult<bool> {
        if task
            .inner
            .state
            .compare_exchange(IDLE, QUEUED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        if self.queue.push(task.clone()).is_err() {
            task.inner.state.store(IDLE, Ordering::Release);
            return Err(EngineError::Capacity(Resource::Tasks));
        }
        self.posted.fetch_add(1, Ordering::Relaxed);

        if !self.signalled.swap(true, Ordering::AcqRel) {
            self.post.notify().map_err(|e| EngineError::os("eventfd write", &e))?;
        }
        Ok(true)
    }

    /// Pop and hand every claimable task to `run`.
    ///
    /// Only entries present when the drain starts are taken; a task that
    /// re-posts itself runs on the next drain.
    pub fn drain(&self, mut run: impl FnMut(Task)) -> usize {
        self.signalled.store(false, Ordering::Release);

        let mut ran = 0;
        for _ in 0..self.queue.len() {
            let Some(task) = self.queue.pop() else { break };
            if task.claim() {
                run(task);
                ran += 1;
            }
        }
        self.executed.fetch_add(ran as u64, Ordering::Relaxed);
        ran
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// (posted, executed) counters
    pub fn counters(&self) -> (u64, u64) {
        (self.posted.load(Ordering::Relaxed), self.executed.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(cap: usize) -> TaskQueue {
        TaskQueue::new(cap, Arc::new(EventFd::new().unwrap()))
    }

    #[test]
    fn test_post_is_idempotent() {
        let q = queue(8);
        let t = Task::new("t", |_| {});
        assert!(q.post(&t).unwrap());
        assert!(!q.post(&t).unwrap());
        assert_eq!(q.len(), 1);

        assert_eq!(q.drain(|_| {}), 1);
        assert!(!t.is_queued());

        // Reusable after firing
        assert!(q.post(&t).unwrap());
        assert_eq!(q.drain(|_| {}), 1);
    }

    #[test]
    fn test_fifo_order() {
        let q = queue(8);
        let a = Task::new("a", |_| {});
        let b = Task::new("b", |_| {});
        q.post(&a).unwrap();
        q.post(&b).unwrap();

        let mut order = Vec::new();
        q.drain(|t| order.push(t.label()));
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_cancel_is_lazy() {
        let q = queue(8);
        let t = Task::new("t", |_| {});
        q.post(&t).unwrap();
        assert!(t.cancel());
        assert!(!t.cancel());
        assert_eq!(q.len(), 1);
        assert_eq!(q.drain(|_| panic!("cancelled task ran")), 0);
    }

    #[test]
    fn test_repost_after_cancel_runs_once() {
        let q = queue(8);
        let t = Task::new("t", |_| {});
        q.post(&t).unwrap();
        t.cancel();
        q.post(&t).unwrap();
        assert_eq!(q.drain(|_| {}), 1);
    }

    #[test]
    fn test_capacity() {
        let q = queue(1);
        let a = Task::new("a", |_| {});
        let b = Task::new("b", |_| {});
        q.post(&a).unwrap();
        assert!(matches!(q.post(&b), Err(EngineError::Capacity(Resource::Tasks))));
        // The rejected task is postable again later
        assert!(!b.is_queued());
    }

    #[test]
    fn test_single_wakeup_per_burst() {
        let efd = Arc::new(EventFd::new().unwrap());
        let q = TaskQueue::new(8, Arc::clone(&efd));
        for label in ["a", "b", "c"] {
            q.post(&Task::new(label, |_| {})).unwrap();
        }
        assert_eq!(efd.drain(), 1);
        q.drain(|_| {});
        q.post(&Task::new("d", |_| {})).unwrap();
        assert_eq!(efd.drain(), 1);
    }
}
