//! Tracks and the filter run loop
//!
//! A track is one processing job: a conveyor of filters plus the buffers
//! flowing between them. All filter calls for a track happen on the worker
//! it was assigned at creation, from its wake task. Other threads only
//! touch atomics (state, stop flag) and post that task.
//!
//! ```text
//!   Created ──start──► Running ◄──wake──► Suspended
//!      │                  │
//!      └──stop──┐         ├── Fin / Err / chain drained ──► Finished ─┐
//!               ▼         └── stop requested ────────────► Stopping ─┴─► Closed
//!            Stopping
//! ```

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, trace, warn};
use trackline_core::{
    ChainError, Conveyor, FilterError, FilterResult, Flags, Position, ScratchArena, ScratchBox,
    Step, TrackError, TrackId, WorkerId,
};

use crate::config::{OnClose, TrackConfig};
use crate::engine::EngineShared;
use crate::error::{EngineError, EngineResult};
use crate::task::Task;
use crate::worker::{current_worker_id, WorkerCx};

/// Lifecycle state of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackState {
    Created = 0,
    Running = 1,
    Suspended = 2,
    Finished = 3,
    Stopping = 4,
    Closed = 5,
}

impl TrackState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TrackState::Created,
            1 => TrackState::Running,
            2 => TrackState::Suspended,
            3 => TrackState::Finished,
            4 => TrackState::Stopping,
            _ => TrackState::Closed,
        }
    }
}

/// A per-track filter instance
pub trait Filter: Send {
    /// Consume `input`, produce `output`, and say where the chain goes next
    fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult;

    /// Called exactly once, after the last `process`
    fn close(&mut self, _t: &mut TrackCtx<'_>) {}
}

/// What a descriptor's `open` produced
pub enum Opened {
    Instance(Box<dyn Filter>),
    /// Bypass this filter for this track: its input goes straight through
    Skip,
}

type OpenFn = dyn Fn(&mut OpenCtx<'_>) -> Result<Opened, FilterError> + Send + Sync;

/// Shared, immutable filter factory
pub struct FilterDescriptor {
    name: &'static str,
    open: Box<OpenFn>,
}

impl FilterDescriptor {
    pub fn new(
        name: &'static str,
        open: impl Fn(&mut OpenCtx<'_>) -> Result<Opened, FilterError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { name, open: Box::new(open) })
    }

    /// Descriptor whose `open` always succeeds with `make()`
    pub fn with<F, M>(name: &'static str, make: M) -> Arc<Self>
    where
        F: Filter + 'static,
        M: Fn() -> F + Send + Sync + 'static,
    {
        Self::new(name, move |_| Ok(Opened::Instance(Box::new(make()))))
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for FilterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterDescriptor").field("name", &self.name).finish()
    }
}

enum Instance {
    Pending,
    Active(Box<dyn Filter>),
}

struct Stage {
    desc: Arc<FilterDescriptor>,
    instance: Instance,
}

impl Stage {
    fn new(desc: Arc<FilterDescriptor>) -> Self {
        Stage { desc, instance: Instance::Pending }
    }
}

/// Data and settings visible to filters
struct Buffers {
    input: Vec<u8>,
    output: Vec<u8>,
    forward: bool,
    /// Inserts requested during `process`, applied when it returns
    pending: Vec<(Arc<FilterDescriptor>, Position)>,
    params: HashMap<String, String>,
    arena: ScratchArena,
}

struct TrackCore {
    chain: Conveyor<Stage>,
    bufs: Buffers,
    final_output: Option<Vec<u8>>,
    invocations: u64,
    on_close: Option<OnClose>,
}

/// Snapshot of a closed track
#[derive(Debug, Clone)]
pub struct TrackReport {
    pub id: TrackId,
    pub name: String,
    /// `Finished`, or `Stopping` if a stop was requested
    pub state: TrackState,
    pub error: Option<TrackError>,
    /// Last output that left the tail of the chain
    pub output: Vec<u8>,
    /// Total `process` calls
    pub invocations: u64,
}

pub(crate) struct TrackInner {
    id: TrackId,
    name: String,
    engine: Arc<EngineShared>,
    worker: WorkerId,
    state: AtomicU8,
    stop: AtomicBool,
    error: OnceLock<TrackError>,
    current: Mutex<Option<&'static str>>,
    core: Mutex<TrackCore>,
    wake: Task,
    report: Mutex<Option<TrackReport>>,
    closed: Condvar,
}

/// Cloneable handle to a track, usable from any thread
#[derive(Clone)]
pub struct TrackHandle {
    inner: Arc<TrackInner>,
}

enum Exit {
    Suspend,
    Finish,
    Fail,
}

impl TrackInner {
    pub(crate) fn new(
        engine: Arc<EngineShared>,
        worker: WorkerId,
        mut config: TrackConfig,
    ) -> Arc<Self> {
        let core = TrackCore {
            chain: Conveyor::new(),
            bufs: Buffers {
                input: config.input.take().unwrap_or_default(),
                output: Vec::new(),
                forward: false,
                pending: Vec::new(),
                params: mem::take(&mut config.params),
                arena: ScratchArena::new(engine.config.scratch_size),
            },
            final_output: None,
            invocations: 0,
            on_close: config.on_close.take(),
        };

        Arc::new_cyclic(|weak: &Weak<TrackInner>| {
            let weak = weak.clone();
            let wake = Task::new("track-wake", move |cx| {
                if let Some(track) = weak.upgrade() {
                    track.run(cx);
                }
            });
            TrackInner {
                id: TrackId::next(),
                name: config.name,
                engine,
                worker,
                state: AtomicU8::new(TrackState::Created as u8),
                stop: AtomicBool::new(false),
                error: OnceLock::new(),
                current: Mutex::new(None),
                core: Mutex::new(core),
                wake,
                report: Mutex::new(None),
                closed: Condvar::new(),
            }
        })
    }

    pub(crate) fn id(&self) -> TrackId {
        self.id
    }

    fn state(&self) -> TrackState {
        TrackState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: TrackState) {
        self.state.store(s as u8, Ordering::Release);
    }

    fn cas_state(&self, from: TrackState, to: TrackState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// First error wins
    fn fail(&self, err: TrackError) {
        if self.error.get().is_none() {
            warn!(track = %self.id, error = %err, "track failed");
        }
        let _ = self.error.set(err);
    }

    fn set_current(&self, name: Option<&'static str>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = name;
    }

    fn schedule(&self) -> EngineResult<bool> {
        let worker = self.engine.pool.get(self.worker).ok_or(EngineError::Shutdown)?;
        worker.post(&self.wake)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if self.cas_state(TrackState::Created, TrackState::Stopping) {
            debug!(track = %self.id, "stopped before start");
        }
        match self.schedule() {
            Ok(_) => {}
            Err(EngineError::Shutdown) => trace!(track = %self.id, "stop after shutdown"),
            Err(e) => warn!(track = %self.id, error = %e, "failed to wake track for stop"),
        }
    }

    /// Wake task body, always on the owning worker
    fn run(self: &Arc<Self>, cx: &mut WorkerCx) {
        debug_assert_eq!(cx.id(), self.worker, "track ran on a foreign worker");
        let span = tracing::debug_span!("track", track = %self.id, worker = %cx.id());
        let _enter = span.enter();

        let closed = {
            let mut guard = self.core.lock().unwrap_or_else(PoisonError::into_inner);
            let core = &mut *guard;

            let exit = match self.state() {
                TrackState::Closed | TrackState::Created | TrackState::Finished => return,
                TrackState::Stopping => Exit::Finish,
                _ => {
                    self.set_state(TrackState::Running);
                    core.pump(self, cx)
                }
            };
            match exit {
                Exit::Suspend => {
                    self.set_state(TrackState::Suspended);
                    None
                }
                Exit::Finish | Exit::Fail => Some(core.teardown(self, cx)),
            }
        };

        if let Some((report, on_close)) = closed {
            self.finish(report, on_close);
        }
    }

    fn finish(&self, report: TrackReport, on_close: Option<OnClose>) {
        self.engine.pool.release(self.worker);
        self.engine.forget(self.id);
        if let Some(f) = on_close {
            f(&report);
        }
        info!(
            track = %self.id,
            name = %self.name,
            state = ?report.state,
            invocations = report.invocations,
            error = ?report.error,
            "track closed"
        );
        let mut slot = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(report);
        self.set_state(TrackState::Closed);
        self.closed.notify_all();
    }
}


impl TrackCore {
    /// Drive the chain until it suspends, finishes or fails
    fn pump(&mut self, track: &Arc<TrackInner>, cx: &mut WorkerCx) -> Exit {
        let TrackCore { chain, bufs, final_output, invocations, .. } = self;

        loop {
            if chain.position().is_none() && chain.forward() == Step::End {
                return Exit::Finish;
            }
            let first = chain.is_first();
            let opened = chain.is_opened();
            let Some(stage) = chain.current_mut() else { return Exit::Finish };
            let desc = Arc::clone(&stage.desc);
            let name = desc.name();

            if !opened {
                let mut octx = OpenCtx { track, bufs: &mut *bufs, worker: cx.id(), filter: name };
                match (desc.open)(&mut octx) {
                    Ok(Opened::Instance(f)) => {
                        stage.instance = Instance::Active(f);
                        chain.mark_opened();
                        debug!(filter = name, "opened");
                    }
                    Ok(Opened::Skip) => {
                        debug!(filter = name, "skipped");
                        bufs.output = mem::take(&mut bufs.input);
                        match finish_stage(chain, bufs, final_output) {
                            Some(exit) => return exit,
                            None => continue,
                        }
                    }
                    Err(e) => {
                        track.fail(TrackError::Open { filter: name, reason: e.to_string() });
                        return Exit::Fail;
                    }
                }
            }

            let flags = Flags {
                first,
                forward: bufs.forward,
                stop: track.stop.load(Ordering::Acquire),
            };
            track.set_current(Some(name));
            let result = {
                let Some(Stage { instance: Instance::Active(filter), .. }) = chain.current_mut() else {
                    return Exit::Fail;
                };
                let mut t = TrackCtx { track, bufs: &mut *bufs, cx: &mut *cx, flags, filter: name };
                filter.process(&mut t)
            };
            *invocations += 1;
            bufs.forward = false;
            trace!(filter = name, ?result, ?flags, "processed");

            for (desc, pos) in mem::take(&mut bufs.pending) {
                let inserted = desc.name();
                if let Err(e) = chain.insert(Stage::new(desc), pos) {
                    track.fail(TrackError::Chain(e));
                    return Exit::Fail;
                }
                debug!(filter = inserted, ?pos, "inserted");
            }

            match result {
                FilterResult::Data | FilterResult::Ok => {
                    if result == FilterResult::Ok {
                        chain.set_pass_once();
                    }
                    bufs.input = mem::take(&mut bufs.output);
                    bufs.forward = true;
                    if chain.forward() == Step::End {
                        // Output left the tail; ask upstream for more
                        *final_output = Some(mem::take(&mut bufs.input));
                        bufs.forward = false;
                        chain.backward();
                    }
                }
                FilterResult::Done => {
                    if let Some(exit) = finish_stage(chain, bufs, final_output) {
                        return exit;
                    }
                }
                FilterResult::LastOut => {
                    let dropped = chain.remove_upstream();
                    debug!(filter = name, upstream = dropped, "last output");
                    if let Some(exit) = finish_stage(chain, bufs, final_output) {
                        return exit;
                    }
                }
                FilterResult::More | FilterResult::Back => {
                    if chain.is_first() {
                        track.fail(TrackError::Chain(ChainError::MoreFromFirst(name)));
                        return Exit::Fail;
                    }
                    if result == FilterResult::Back {
                        bufs.input = mem::take(&mut bufs.output);
                    } else {
                        bufs.input.clear();
                    }
                    chain.backward();
                }
                FilterResult::Async => return Exit::Suspend,
                FilterResult::Fin => return Exit::Finish,
                FilterResult::Err(code) => {
                    track.fail(TrackError::Filter { filter: name, code });
                    return Exit::Fail;
                }
            }
        }
    }

    /// Close every opened filter, newest first, and build the report
    fn teardown(&mut self, track: &Arc<TrackInner>, cx: &mut WorkerCx) -> (TrackReport, Option<OnClose>) {
        for stage in self.chain.drain_close_order() {
            close_stage(stage, &mut self.bufs, track, cx);
        }

        let state = if track.stop.load(Ordering::Acquire) {
            TrackState::Stopping
        } else {
            TrackState::Finished
        };
        track.set_state(state);

        let report = TrackReport {
            id: track.id,
            name: track.name.clone(),
            state,
            error: track.error.get().cloned(),
            output: self.final_output.take().unwrap_or_default(),
            invocations: self.invocations,
        };
        (report, self.on_close.take())
    }
}

/// Take the filter under the cursor out of the chain, passing its output
/// on. The instance stays alive until teardown closes it.
///
/// Returns `Some` when that ends the track.
fn finish_stage(
    chain: &mut Conveyor<Stage>,
    bufs: &mut Buffers,
    final_output: &mut Option<Vec<u8>>,
) -> Option<Exit> {
    let was_last = chain.is_last();
    chain.remove_current();

    if was_last || chain.is_empty() {
        if !bufs.output.is_empty() || final_output.is_none() {
            *final_output = Some(mem::take(&mut bufs.output));
        }
        return Some(Exit::Finish);
    }

    bufs.input = mem::take(&mut bufs.output);
    bufs.forward = true;
    match chain.forward() {
        Step::Moved(_) => None,
        Step::End => {
            *final_output = Some(mem::take(&mut bufs.input));
            Some(Exit::Finish)
        }
    }
}

fn close_stage(stage: Stage, bufs: &mut Buffers, track: &Arc<TrackInner>, cx: &mut WorkerCx) {
    let Instance::Active(mut filter) = stage.instance else { return };
    let name = stage.desc.name();
    let flags = Flags {
        first: false,
        forward: false,
        stop: track.stop.load(Ordering::Acquire),
    };
    let mut t = TrackCtx { track, bufs: &mut *bufs, cx, flags, filter: name };
    filter.close(&mut t);
    // Chain edits from close have nowhere to go
    bufs.pending.clear();
    debug!(filter = name, "closed");
}

/// What a filter's `open` can see and allocate
pub struct OpenCtx<'a> {
    track: &'a Arc<TrackInner>,
    bufs: &'a mut Buffers,
    worker: WorkerId,
    filter: &'static str,
}

impl<'a> OpenCtx<'a> {
    #[inline]
    pub fn filter_name(&self) -> &'static str {
        self.filter
    }

    #[inline]
    pub fn track_id(&self) -> TrackId {
        self.track.id
    }

    pub fn track(&self) -> TrackHandle {
        TrackHandle { inner: Arc::clone(self.track) }
    }

    /// Worker every call for this track runs on
    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.bufs.params.get(key).map(String::as_str)
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.bufs.params
    }

    /// Input the filter will see first, for format probing
    pub fn input(&self) -> &[u8] {
        &self.bufs.input
    }

    /// Place filter state in the track's scratch arena
    pub fn alloc<T>(&self, value: T) -> ScratchBox<T> {
        self.bufs.arena.alloc(value)
    }

    pub fn arena(&self) -> &ScratchArena {
        &self.bufs.arena
    }
}

/// What a filter's `process` and `close` can see and do
pub struct TrackCtx<'a> {
    track: &'a Arc<TrackInner>,
    bufs: &'a mut Buffers,
    cx: &'a mut WorkerCx,
    flags: Flags,
    filter: &'static str,
}

impl<'a> TrackCtx<'a> {
    #[inline]
    pub fn filter_name(&self) -> &'static str {
        self.filter
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Whether someone asked the track to stop
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.flags.stop || self.track.stop.load(Ordering::Acquire)
    }

    #[inline]
    pub fn input(&self) -> &[u8] {
        &self.bufs.input
    }

    pub fn input_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bufs.input
    }

    pub fn take_input(&mut self) -> Vec<u8> {
        mem::take(&mut self.bufs.input)
    }

    #[inline]
    pub fn output(&self) -> &[u8] {
        &self.bufs.output
    }

    pub fn output_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bufs.output
    }

    pub fn set_output(&mut self, data: impl Into<Vec<u8>>) {
        self.bufs.output = data.into();
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.bufs.params.get(key).map(String::as_str)
    }

    #[inline]
    pub fn track_id(&self) -> TrackId {
        self.track.id
    }

    /// Handle for waking this track from an async completion
    pub fn track(&self) -> TrackHandle {
        TrackHandle { inner: Arc::clone(self.track) }
    }

    /// The owning worker: timers, tasks, kernel event slots, kernel calls
    pub fn worker(&mut self) -> &mut WorkerCx {
        self.cx
    }

    /// Insert a filter; applied when this call returns
    pub fn insert(&mut self, desc: &Arc<FilterDescriptor>, pos: Position) {
        self.bufs.pending.push((Arc::clone(desc), pos));
    }

    /// Insert a filter upstream of this one
    pub fn insert_before(&mut self, desc: &Arc<FilterDescriptor>) {
        self.insert(desc, Position::BeforeCurrent);
    }

    /// Insert a filter downstream of this one
    pub fn insert_after(&mut self, desc: &Arc<FilterDescriptor>) {
        self.insert(desc, Position::AfterCurrent);
    }

    /// Record a system error for this filter and return the matching result
    pub fn fail_io(&mut self, e: &io::Error) -> FilterResult {
        let errno = e.raw_os_error().unwrap_or(-1);
        self.track.fail(TrackError::System { filter: self.filter, errno });
        FilterResult::Err(errno)
    }
}

impl TrackHandle {
    pub(crate) fn from_inner(inner: Arc<TrackInner>) -> Self {
        Self { inner }
    }

    #[inline]
    pub fn id(&self) -> TrackId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Worker this track runs on, fixed for its lifetime
    #[inline]
    pub fn worker(&self) -> WorkerId {
        self.inner.worker
    }

    #[inline]
    pub fn state(&self) -> TrackState {
        self.inner.state()
    }

    /// The sticky error, if any
    pub fn error(&self) -> Option<TrackError> {
        self.inner.error.get().cloned()
    }

    /// Filter currently executing, or the last one that did
    pub fn current_filter(&self) -> Option<&'static str> {
        *self.inner.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    /// Add a filter. Only allowed before `start`.
    pub fn filter(&self, desc: &Arc<FilterDescriptor>, pos: Position) -> EngineResult<()> {
        self.expect_state(TrackState::Created, "add a filter")?;
        let mut core = self.inner.core.lock().unwrap_or_else(PoisonError::into_inner);
        core.chain.insert(Stage::new(Arc::clone(desc)), pos)?;
        Ok(())
    }

    /// Schedule the first run. If the wake cannot be posted the track
    /// stays `Created` and `start` may be retried.
    pub fn start(&self) -> EngineResult<()> {
        if !self.inner.cas_state(TrackState::Created, TrackState::Running) {
            return Err(EngineError::InvalidState {
                track: self.inner.id,
                state: self.state(),
                op: "start",
            });
        }
        if let Err(e) = self.inner.schedule() {
            self.inner.cas_state(TrackState::Running, TrackState::Created);
            return Err(e);
        }
        debug!(track = %self.inner.id, worker = %self.inner.worker, "track started");
        Ok(())
    }

    /// Ask the track to wind down. Every active filter still gets called
    /// with the stop flag set before the track closes.
    pub fn stop(&self) {
        self.inner.request_stop();
    }

    /// Resume a suspended track. Safe from any thread; extra wakes are
    /// coalesced.
    pub fn wake(&self) -> EngineResult<bool> {
        self.inner.schedule()
    }

    /// Report of a closed track, without waiting
    pub fn report(&self) -> Option<TrackReport> {
        self.inner.report.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Block until the track closes, up to `timeout` (`None`: forever).
    ///
    /// Returns `None` on timeout, or immediately when called from the
    /// track's own worker, which would otherwise deadlock.
    pub fn wait(&self, timeout: Option<Duration>) -> Option<TrackReport> {
        if current_worker_id() == Some(self.inner.worker) {
            return self.report();
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.inner.report.lock().unwrap_or_else(PoisonError::into_inner);
        while guard.is_none() {
            guard = match deadline {
                None => self.inner.closed.wait(guard).unwrap_or_else(PoisonError::into_inner),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return None;
                    }
                    self.inner
                        .closed
                        .wait_timeout(guard, d - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        guard.clone()
    }

    fn expect_state(&self, want: TrackState, op: &'static str) -> EngineResult<()> {
        let state = self.state();
        if state != want {
            return Err(EngineError::InvalidState { track: self.inner.id, state, op });
        }
        Ok(())
    }
}

impl fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("worker", &self.inner.worker)
            .field("state", &self.state())
            .finish()
    }
}
