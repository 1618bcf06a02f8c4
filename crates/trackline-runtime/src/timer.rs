//! Per-worker timer queue
//!
//! A [`Timer`] is a small copyable handle that owners embed by value. Arming,
//! re-arming and removal go through `WorkerCx::timer` on the owning worker;
//! timers are never touched from another thread.
//!
//! Entries live in a `BinaryHeap` keyed by deadline. Re-arming or removing
//! bumps the timer's generation, and heap entries with an old generation are
//! discarded when they surface (lazy cancellation).

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::worker::WorkerCx;

/// Timer callback, run on the owning worker
pub type TimerFn = Box<dyn FnMut(&mut WorkerCx) + Send>;

/// Timer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timer(u64);

impl Timer {
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Timer(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// How a timer fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interval {
    /// Remove the timer
    Off,
    /// Fire once after the duration
    Once(Duration),
    /// Fire every duration
    Every(Duration),
}

impl Interval {
    /// Signed-milliseconds form: 0 removes, negative is one-shot, positive
    /// is periodic
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => Interval::Off,
            ms if ms < 0 => Interval::Once(Duration::from_millis(ms.unsigned_abs())),
            ms => Interval::Every(Duration::from_millis(ms as u64)),
        }
    }
}

struct Armed {
    generation: u64,
    interval: Interval,
    /// `None` while the callback is running
    func: Option<TimerFn>,
}

#[derive(PartialEq, Eq)]
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    timer: Timer,
    generation: u64,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Min-heap on (deadline, seq)
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

/// A timer whose deadline passed; its callback is out of the queue until
/// `restore` puts it back
pub(crate) struct Fired {
    pub timer: Timer,
    pub generation: u64,
    pub func: TimerFn,
}

/// Heap of armed timers for one worker
pub struct TimerQueue {
    heap: BinaryHeap<HeapEntry>,
    armed: HashMap<Timer, Armed>,
    next_generation: u64,
    seq: u64,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            armed: HashMap::new(),
            next_generation: 1,
            seq: 0,
        }
    }

    /// Arm, re-arm or (with `Interval::Off`) remove a timer.
    ///
    /// Returns true if a timer is armed afterwards.
    pub fn set(&mut self, timer: Timer, interval: Interval, func: TimerFn, now: Instant) -> bool {
        let period = match interval {
            Interval::Off => {
                self.armed.remove(&timer);
                return false;
            }
            Interval::Once(d) | Interval::Every(d) => d,
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        self.armed.insert(timer, Armed { generation, interval, func: Some(func) });
        self.push(timer, generation, now + period);
        true
    }

    /// Remove a timer. Returns false if it was not armed.
    pub fn remove(&mut self, timer: Timer) -> bool {
        self.armed.remove(&timer).is_some()
    }

    pub fn is_armed(&self, timer: Timer) -> bool {
        self.armed.contains_key(&timer)
    }

    /// Pull out every timer due at `now`. Periodic timers are rescheduled;
    /// one-shot timers are disarmed (their callback still runs).
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<Fired> {
        let mut fired = Vec::new();

        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Some(entry) = self.heap.pop() else { break };

            let Some(armed) = self.armed.get_mut(&entry.timer) else { continue };
            if armed.generation != entry.generation {
                continue;
            }
            let Some(func) = armed.func.take() else { continue };

            match armed.interval {
                Interval::Every(period) => {
                    // Catch up without a burst if the worker fell behind
                    let mut next = entry.deadline + period;
                    if next <= now {
                        next = now + period;
                    }
                    let generation = armed.generation;
                    self.push(entry.timer, generation, next);
                }
                _ => {
                    self.armed.remove(&entry.timer);
                }
            }
            fired.push(Fired { timer: entry.timer, generation: entry.generation, func });
        }
        fired
    }

    /// Give a fired periodic timer its callback back, unless the callback
    /// re-armed or removed the timer meanwhile
    pub(crate) fn restore(&mut self, fired: Fired) {
        if let Some(armed) = self.armed.get_mut(&fired.timer) {
            if armed.generation == fired.generation && armed.func.is_none() {
                armed.func = Some(fired.func);
            }
        }
    }

    /// Earliest pending deadline
    pub fn next_deadline(&mut self) -> Option<Instant> {
        // Pop stale entries so the answer is exact
        while let Some(top) = self.heap.peek() {
            match self.armed.get(&top.timer) {
                Some(a) if a.generation == top.generation => return Some(top.deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Number of armed timers
    #[inline]
    pub fn len(&self) -> usize {
        self.armed.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    fn push(&mut self, timer: Timer, generation: u64, deadline: Instant) {
        self.seq += 1;
        self.heap.push(HeapEntry { deadline, seq: self.seq, timer, generation });
    }
}
