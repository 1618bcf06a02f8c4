//! # trackline-runtime
//!
//! Linux runtime for the trackline filter pipeline engine.
//!
//! This crate provides:
//! - The OS event facility (epoll, eventfd, timerfd)
//! - Per-worker task queues, timer queues and kernel event slot pools
//! - The worker event loop and the worker pool
//! - The kernel call bridge for blocking file I/O
//! - Tracks, filters and the engine that owns them

pub mod config;
pub mod error;
pub mod task;
pub mod timer;
pub mod kev;
pub mod kcall;
pub mod worker;
pub mod pool;
pub mod track;
pub mod engine;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        #[path = "platform_linux.rs"]
        pub mod platform;
    } else {
        compile_error!("Unsupported platform");
    }
}

// Re-exports
pub use config::{Assign, EngineConfig, KcallStart, OnClose, TrackConfig, WorkerCount};
pub use engine::{CmdReply, Engine, EngineStats, TrackCmd, WorkerStats};
pub use error::{EngineError, EngineResult, Resource};
pub use kcall::{execute, BridgeStats, KcallBridge, KcallOp, KcallOutput};
pub use kev::{KevEvent, KevFn};
pub use platform::Interest;
pub use pool::WorkerPool;
pub use task::Task;
pub use timer::{Interval, Timer};
pub use track::{
    Filter, FilterDescriptor, OpenCtx, Opened, TrackCtx, TrackHandle, TrackReport, TrackState,
};
pub use worker::{current_worker_id, Worker, WorkerCx};
