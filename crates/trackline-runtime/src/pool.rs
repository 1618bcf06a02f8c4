//! Worker pool and track scheduler
//!
//! Workers are created on demand, up to the configured cap, and live until
//! the engine shuts down. Worker 0 is created with the pool; once there is
//! more than one worker it is left out of load balancing so bookkeeping
//! tasks posted to it are not stuck behind track processing.

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, warn};
use trackline_core::WorkerId;

use crate::config::{Assign, EngineConfig};
use crate::error::EngineResult;
use crate::kcall::KcallBridge;
use crate::worker::{self, Worker};

pub struct WorkerPool {
    workers: RwLock<Vec<Arc<Worker>>>,
    /// Serializes worker creation
    create: Mutex<()>,
    cap: usize,
    config: EngineConfig,
    bridge: Arc<KcallBridge>,
}

impl WorkerPool {
    /// Create the pool with worker 0 running
    pub fn new(config: &EngineConfig, bridge: Arc<KcallBridge>) -> EngineResult<Self> {
        let first = worker::spawn(WorkerId::ZERO, config, Arc::clone(&bridge))?;
        Ok(Self {
            workers: RwLock::new(vec![first]),
            create: Mutex::new(()),
            cap: config.workers.resolve(),
            config: config.clone(),
            bridge,
        })
    }

    #[inline]
    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<Worker>> {
        self.read().get(id.as_usize()).cloned()
    }

    /// Snapshot of all workers
    pub fn workers(&self) -> Vec<Arc<Worker>> {
        self.read().clone()
    }

    /// True if another worker can still be created, or some worker (other
    /// than worker 0 in a multi-worker pool) has nothing assigned
    pub fn available(&self) -> bool {
        let workers = self.read();
        if workers.len() < self.cap {
            return true;
        }
        let skip = usize::from(workers.len() > 1);
        workers.iter().skip(skip).any(|w| w.jobs() == 0)
    }

    /// Pick a worker for a new track and count the job against it
    pub fn assign(&self, mode: Assign) -> WorkerId {
        let chosen = match mode {
            Assign::Sequential => self.read()[0].clone(),
            Assign::LeastBusy => self.least_busy_or_grow(),
        };
        chosen.acquire_job();
        chosen.id()
    }

    /// Drop one job from a worker's count. Workers are never destroyed here.
    pub fn release(&self, id: WorkerId) {
        if let Some(w) = self.get(id) {
            w.release_job();
        }
    }

    fn least_busy_or_grow(&self) -> Arc<Worker> {
        let (best, len) = {
            let workers = self.read();
            (least_busy(&workers), workers.len())
        };
        if best.jobs() == 0 || len >= self.cap {
            return best;
        }

        let _guard = self.create.lock().unwrap_or_else(PoisonError::into_inner);
        // Someone may have grown the pool while we waited for the lock
        let len = self.len();
        if len >= self.cap {
            return least_busy(&self.read());
        }

        let id = WorkerId::new(len as u32);
        match worker::spawn(id, &self.config, Arc::clone(&self.bridge)) {
            Ok(w) => {
                self.workers.write().unwrap_or_else(PoisonError::into_inner).push(Arc::clone(&w));
                debug!(worker = %id, total = len + 1, "pool grew");
                w
            }
            Err(e) => {
                warn!(worker = %id, error = %e, "worker creation failed; reusing existing worker");
                best
            }
        }
    }

    /// Stop every worker and wait for its thread, skipping the caller's own
    pub fn shutdown(&self) {
        let workers = self.workers();
        for w in &workers {
            w.stop();
        }
        for w in &workers {
            w.join();
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Worker>>> {
        self.workers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Fewest jobs wins; ties go to the earliest worker. Worker 0 only
/// competes when it is alone.
fn least_busy(workers: &[Arc<Worker>]) -> Arc<Worker> {
    let skip = usize::from(workers.len() > 1);
    workers
        .iter()
        .skip(skip)
        .min_by_key(|w| w.jobs())
        .unwrap_or(&workers[0])
        .clone()
}
