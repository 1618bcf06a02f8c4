//! # trackline - streaming filter pipeline engine
//!
//! A track is a chain of filters that pass byte buffers to one another.
//! Each track is bound to one worker thread, which runs all of its filter
//! calls from an epoll event loop alongside timers, kernel event slots and
//! the completions of blocking calls offloaded to the kernel call bridge.
//!
//! ## Quick Start
//!
//! ```ignore
//! use trackline::prelude::*;
//!
//! struct Upper;
//!
//! impl Filter for Upper {
//!     fn process(&mut self, t: &mut TrackCtx<'_>) -> FilterResult {
//!         let data = t.take_input().to_ascii_uppercase();
//!         t.set_output(data);
//!         FilterResult::Done
//!     }
//! }
//!
//! let engine = Engine::create(EngineConfig::from_env())?;
//! let track = engine.track_create(TrackConfig::new("demo").input(b"hello".to_vec()))?;
//! track.filter(&FilterDescriptor::with("upper", || Upper), Position::Last)?;
//! track.start()?;
//! let report = track.wait(None);
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        Engine                            │
//! │      track registry, worker pool, kernel call bridge     │
//! └──────────────────────────────────────────────────────────┘
//!                            │
//!          ┌─────────────────┼─────────────────┐
//!          ▼                 ▼                 ▼
//!    ┌───────────┐     ┌───────────┐     ┌───────────┐
//!    │ Worker 0  │     │ Worker 1  │     │  kcall    │
//!    │ epoll loop│     │ epoll loop│ ◄── │  threads  │
//!    └───────────┘     └───────────┘     └───────────┘
//!          │                 │
//!          ▼                 ▼
//!     tracks: filter chain ──► filter ──► filter
//! ```

// Re-export core types
pub use trackline_core::{
    constants, ChainError, Conveyor, Cursor, FilterError, FilterResult, Flags, KevHandle,
    Position, ScratchArena, ScratchBox, Step, TrackError, TrackId, WorkerId,
};

// Re-export env and clock utilities
pub use trackline_core::clock;
pub use trackline_core::{env_get, env_get_bool, env_get_opt};

// Re-export runtime types
pub use trackline_runtime::{
    current_worker_id, execute, Assign, BridgeStats, CmdReply, Engine, EngineConfig,
    EngineError, EngineResult, EngineStats, Filter, FilterDescriptor, Interest, Interval,
    KcallOp, KcallOutput, KcallStart, KevEvent, KevFn, OnClose, OpenCtx, Opened, Resource, Task,
    Timer, TrackCmd, TrackConfig, TrackCtx, TrackHandle, TrackReport, TrackState, Worker,
    WorkerCount, WorkerCx, WorkerStats,
};

/// Everything a filter author usually needs
pub mod prelude {
    pub use crate::{
        Engine, EngineConfig, Filter, FilterDescriptor, FilterError, FilterResult, Flags,
        Interval, KcallOp, KcallOutput, KevEvent, OpenCtx, Opened, Position, Task, Timer,
        TrackConfig, TrackCtx, TrackHandle, TrackReport, TrackState, WorkerCount, WorkerCx,
    };
}
