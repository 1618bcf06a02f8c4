//! Engine: the process-wide scheduler instance
//!
//! One engine owns the worker pool, the kernel call bridge and the registry
//! of live tracks. Create it once with [`Engine::create`] and tear it down
//! with [`Engine::destroy`] (or by dropping it).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use trackline_core::{TrackError, TrackId, WorkerId};

use crate::config::{Assign, EngineConfig, TrackConfig};
use crate::error::{EngineError, EngineResult};
use crate::kcall::{BridgeStats, KcallBridge};
use crate::pool::WorkerPool;
use crate::track::{TrackHandle, TrackInner, TrackState};
use crate::worker::{current_worker_id, Worker};

/// How long `destroy` waits for stopped tracks to close
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub(crate) struct EngineShared {
    pub(crate) config: EngineConfig,
    pub(crate) pool: WorkerPool,
    bridge: Arc<KcallBridge>,
    tracks: Mutex<HashMap<TrackId, Arc<TrackInner>>>,
    destroyed: AtomicBool,
}

impl EngineShared {
    /// Drop a closed track from the registry
    pub(crate) fn forget(&self, id: TrackId) {
        self.registry().remove(&id);
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<TrackId, Arc<TrackInner>>> {
        self.tracks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live(&self) -> Vec<Arc<TrackInner>> {
        self.registry().values().cloned().collect()
    }
}

/// Out-of-band track queries and requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackCmd {
    /// Name of the filter executing now, or the last one that did
    CurrentFilter,
    State,
    Error,
    /// Request a cooperative stop of this track
    Stop,
    /// Request a cooperative stop of every live track
    StopAll,
}

/// Answer to a [`TrackCmd`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdReply {
    CurrentFilter(Option<&'static str>),
    State(TrackState),
    Error(Option<TrackError>),
    /// Number of tracks asked to stop
    Stopped(usize),
}

/// Per-worker counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub id: WorkerId,
    pub jobs: usize,
    pub iterations: u64,
    pub tasks_posted: u64,
    pub tasks_run: u64,
}

/// Snapshot of engine counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineStats {
    pub workers: Vec<WorkerStats>,
    pub live_tracks: usize,
    pub bridge: BridgeStats,
}

pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Validate the config, prepare the kernel call bridge and start worker 0
    pub fn create(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let bridge = Arc::new(KcallBridge::with_start(
            config.kcall_threads,
            config.kcall_queue_depth,
            config.kcall_start,
        )?);
        let pool = WorkerPool::new(&config, Arc::clone(&bridge))?;

        info!(
            workers = pool.cap(),
            kcall_threads = config.kcall_threads,
            kcall_start = ?config.kcall_start,
            poll_mode = config.poll_mode,
            "engine created"
        );
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                pool,
                bridge,
                tracks: Mutex::new(HashMap::new()),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Create a track and bind it to a worker for its whole lifetime
    pub fn track_create(&self, config: TrackConfig) -> EngineResult<TrackHandle> {
        if self.shared.destroyed.load(Ordering::Acquire) {
            return Err(EngineError::Shutdown);
        }
        let worker = self.shared.pool.assign(config.assign);
        let inner = TrackInner::new(Arc::clone(&self.shared), worker, config);
        self.shared.registry().insert(inner.id(), Arc::clone(&inner));
        debug!(track = %inner.id(), worker = %worker, "track created");
        Ok(TrackHandle::from_inner(inner))
    }

    pub fn cmd(&self, track: &TrackHandle, cmd: TrackCmd) -> CmdReply {
        match cmd {
            TrackCmd::CurrentFilter => CmdReply::CurrentFilter(track.current_filter()),
            TrackCmd::State => CmdReply::State(track.state()),
            TrackCmd::Error => CmdReply::Error(track.error()),
            TrackCmd::Stop => {
                track.stop();
                CmdReply::Stopped(1)
            }
            TrackCmd::StopAll => CmdReply::Stopped(self.stop_all()),
        }
    }

    /// Ask every live track to stop; returns how many were asked
    pub fn stop_all(&self) -> usize {
        let live = self.shared.live();
        for t in &live {
            t.request_stop();
        }
        live.len()
    }

    /// Number of tracks not yet closed
    pub fn live_tracks(&self) -> usize {
        self.shared.registry().len()
    }

    pub fn workers_available(&self) -> bool {
        self.shared.pool.available()
    }

    /// Assign a worker and count a job against it
    pub fn worker_assign(&self, mode: Assign) -> WorkerId {
        self.shared.pool.assign(mode)
    }

    pub fn worker_release(&self, id: WorkerId) {
        self.shared.pool.release(id);
    }

    pub fn worker(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.shared.pool.get(id)
    }

    pub fn bridge(&self) -> &Arc<KcallBridge> {
        &self.shared.bridge
    }

    pub fn stats(&self) -> EngineStats {
        let workers = self
            .shared
            .pool
            .workers()
            .iter()
            .map(|w| {
                let (tasks_posted, tasks_run) = w.task_counters();
                WorkerStats {
                    id: w.id(),
                    jobs: w.jobs(),
                    iterations: w.iterations(),
                    tasks_posted,
                    tasks_run,
                }
            })
            .collect();
        EngineStats {
            workers,
            live_tracks: self.live_tracks(),
            bridge: self.shared.bridge.stats(),
        }
    }

    /// Stop all tracks, give them a moment to close, then stop the workers
    /// and the bridge. Safe to call more than once.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let asked = self.stop_all();

        // Tracks close on their workers; waiting from one would deadlock
        if asked > 0 && current_worker_id().is_none() {
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while self.live_tracks() > 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        }
        let leftover = self.live_tracks();
        if leftover > 0 {
            warn!(tracks = leftover, "tracks still open at shutdown");
        }

        self.shared.pool.shutdown();
        self.shared.bridge.shutdown();
        self.shared.registry().clear();
        info!("engine destroyed");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.destroy();
    }
}
