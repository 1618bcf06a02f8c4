//! Engine and track configuration
//!
//! `EngineConfig` follows the builder pattern: start from `new()` (library
//! defaults) or `from_env()` (defaults with `TRACKLINE_*` overrides) and
//! chain setters.
//!
//! ```rust,ignore
//! use trackline_runtime::config::{EngineConfig, WorkerCount};
//!
//! let config = EngineConfig::from_env()
//!     .workers(WorkerCount::Fixed(4))
//!     .kcall_threads(2);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use trackline_core::constants::{
    DEFAULT_KCALL_QUEUE_DEPTH, DEFAULT_MAX_KEVS, DEFAULT_MAX_TASKS, DEFAULT_SCRATCH_SIZE,
    MAX_WORKERS,
};
use trackline_core::env::{env_get, env_get_bool, env_get_opt};

use crate::error::{EngineError, EngineResult};
use crate::track::TrackReport;

/// Library defaults
pub mod defaults {
    pub const KCALL_THREADS: usize = 2;
    pub const TIMER_RESOLUTION_MS: u64 = 10;
    pub const TIMER_GRACE_MS: u64 = 250;
}

/// Upper bound on the worker pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCount {
    /// A single worker
    One,
    /// One worker per CPU
    All,
    /// A fixed cap, clamped to `MAX_WORKERS`
    Fixed(usize),
}

impl WorkerCount {
    /// Resolve to a concrete worker cap
    pub fn resolve(self) -> usize {
        match self {
            WorkerCount::One => 1,
            WorkerCount::All => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
                .min(MAX_WORKERS),
            WorkerCount::Fixed(n) => n.clamp(1, MAX_WORKERS),
        }
    }
}

impl FromStr for WorkerCount {
    type Err = &'static str;

    /// `0` is one worker, `all` is one per CPU, anything else a fixed cap
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "0" => Ok(WorkerCount::One),
            s if s.eq_ignore_ascii_case("all") => Ok(WorkerCount::All),
            s => s.parse().map(WorkerCount::Fixed).map_err(|_| "expected 0, all or a number"),
        }
    }
}

/// When the kernel call bridge threads start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KcallStart {
    /// With the engine
    Eager,
    /// On the first submitted call
    Lazy,
}

/// Engine configuration with builder pattern
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool cap; workers are created on demand up to it
    pub workers: WorkerCount,
    /// Kernel call bridge threads; 0 runs calls inline on the worker
    pub kcall_threads: usize,
    pub kcall_start: KcallStart,
    /// Depth of the bridge submission ring and of each completion ring
    pub kcall_queue_depth: usize,
    /// Live kernel event slots per worker
    pub max_kevs: usize,
    /// Pending tasks per worker
    pub max_tasks: usize,
    /// Timer tick period
    pub timer_resolution: Duration,
    /// How long the tick keeps running with no timers armed
    pub timer_grace: Duration,
    /// Never block in the OS wait
    pub poll_mode: bool,
    /// Per-track scratch arena size in bytes
    pub scratch_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Library defaults, no environment overrides
    pub fn new() -> Self {
        Self {
            workers: WorkerCount::All,
            kcall_threads: defaults::KCALL_THREADS,
            kcall_start: KcallStart::Lazy,
            kcall_queue_depth: DEFAULT_KCALL_QUEUE_DEPTH,
            max_kevs: DEFAULT_MAX_KEVS,
            max_tasks: DEFAULT_MAX_TASKS,
            timer_resolution: Duration::from_millis(defaults::TIMER_RESOLUTION_MS),
            timer_grace: Duration::from_millis(defaults::TIMER_GRACE_MS),
            poll_mode: false,
            scratch_size: DEFAULT_SCRATCH_SIZE,
        }
    }

    /// Library defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `TRACKLINE_WORKERS` - `0`, `all` or a worker cap
    /// - `TRACKLINE_KCALL_THREADS` - bridge threads (0 disables the bridge)
    /// - `TRACKLINE_KCALL_LAZY` - start bridge threads on first use (0/1)
    /// - `TRACKLINE_MAX_KEVS` - live kernel event slots per worker
    /// - `TRACKLINE_MAX_TASKS` - pending tasks per worker
    /// - `TRACKLINE_POLL` - busy-poll instead of blocking (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            workers: env_get_opt("TRACKLINE_WORKERS").unwrap_or(base.workers),
            kcall_threads: env_get("TRACKLINE_KCALL_THREADS", base.kcall_threads),
            kcall_start: if env_get_bool("TRACKLINE_KCALL_LAZY", true) {
                KcallStart::Lazy
            } else {
                KcallStart::Eager
            },
            max_kevs: env_get("TRACKLINE_MAX_KEVS", base.max_kevs),
            max_tasks: env_get("TRACKLINE_MAX_TASKS", base.max_tasks),
            poll_mode: env_get_bool("TRACKLINE_POLL", base.poll_mode),
            ..base
        }
    }

    // Builder methods

    pub fn workers(mut self, n: WorkerCount) -> Self {
        self.workers = n;
        self
    }

    pub fn kcall_threads(mut self, n: usize) -> Self {
        self.kcall_threads = n;
        self
    }

    pub fn kcall_start(mut self, start: KcallStart) -> Self {
        self.kcall_start = start;
        self
    }

    pub fn kcall_queue_depth(mut self, depth: usize) -> Self {
        self.kcall_queue_depth = depth;
        self
    }

    pub fn max_kevs(mut self, n: usize) -> Self {
        self.max_kevs = n;
        self
    }

    pub fn max_tasks(mut self, n: usize) -> Self {
        self.max_tasks = n;
        self
    }

    pub fn timer_resolution(mut self, d: Duration) -> Self {
        self.timer_resolution = d;
        self
    }

    pub fn timer_grace(mut self, d: Duration) -> Self {
        self.timer_grace = d;
        self
    }

    pub fn poll_mode(mut self, enable: bool) -> Self {
        self.poll_mode = enable;
        self
    }

    pub fn scratch_size(mut self, bytes: usize) -> Self {
        self.scratch_size = bytes;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> EngineResult<()> {
        if let WorkerCount::Fixed(n) = self.workers {
            if n == 0 {
                return Err(EngineError::Config("fixed worker count must be > 0; use WorkerCount::One"));
            }
            if n > MAX_WORKERS {
                return Err(EngineError::Config("worker count exceeds MAX_WORKERS"));
            }
        }
        if self.kcall_threads > 64 {
            return Err(EngineError::Config("kcall_threads must be <= 64"));
        }
        if self.kcall_queue_depth == 0 {
            return Err(EngineError::Config("kcall_queue_depth must be > 0"));
        }
        if self.max_kevs == 0 || self.max_kevs >= u32::MAX as usize {
            return Err(EngineError::Config("max_kevs must be in 1..u32::MAX"));
        }
        if self.max_tasks == 0 {
            return Err(EngineError::Config("max_tasks must be > 0"));
        }
        if self.timer_resolution.is_zero() {
            return Err(EngineError::Config("timer_resolution must be > 0"));
        }
        Ok(())
    }
}

/// How a track picks its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Assign {
    /// Always worker 0
    Sequential,
    /// The least busy worker, growing the pool if everyone is busy
    #[default]
    LeastBusy,
}

/// Callback run once after a track closes
pub type OnClose = Box<dyn FnOnce(&TrackReport) + Send>;

/// Per-track settings
pub struct TrackConfig {
    pub name: String,
    pub assign: Assign,
    /// Input seen by the first filter on its first call
    pub input: Option<Vec<u8>>,
    pub on_close: Option<OnClose>,
    /// Opaque key/value settings for filters
    pub params: HashMap<String, String>,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self::new("track")
    }
}

impl TrackConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            assign: Assign::LeastBusy,
            input: None,
            on_close: None,
            params: HashMap::new(),
        }
    }

    pub fn assign(mut self, assign: Assign) -> Self {
        self.assign = assign;
        self
    }

    pub fn input(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.input = Some(data.into());
        self
    }

    pub fn on_close(mut self, f: impl FnOnce(&TrackReport) + Send + 'static) -> Self {
        self.on_close = Some(Box::new(f));
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for TrackConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackConfig")
            .field("name", &self.name)
            .field("assign", &self.assign)
            .field("input", &self.input.as_ref().map(Vec::len))
            .field("on_close", &self.on_close.is_some())
            .field("params", &self.params)
            .finish()
    }
}
