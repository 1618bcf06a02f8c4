//! # trackline-core
//!
//! Core types for the trackline pipeline engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! The event loop, worker pool and kernel call bridge live in
//! `trackline-runtime`.
//!
//! ## Modules
//!
//! - `id` - Worker, track and kernel event slot identifiers
//! - `error` - Track and chain error types
//! - `filter` - Filter result kinds, invocation flags, insert positions
//! - `conveyor` - The filter chain and its cursor state machine
//! - `slot` - Generation-tagged slot pool
//! - `arena` - Per-track scratch arena
//! - `clock` - Monotonic and wall clock accessors
//! - `env` - Environment variable utilities

pub mod id;
pub mod error;
pub mod filter;
pub mod conveyor;
pub mod slot;
pub mod arena;
pub mod clock;
pub mod env;

// Re-exports for convenience
pub use id::{KevHandle, TrackId, WorkerId};
pub use error::{ChainError, FilterError, TrackError};
pub use filter::{Flags, FilterResult, Position};
pub use conveyor::{Conveyor, Cursor, Step};
pub use slot::GenSlots;
pub use arena::{ScratchArena, ScratchBox};
pub use env::{env_get, env_get_bool, env_get_opt};

/// Engine-wide limits
pub mod constants {
    /// Maximum filters in one chain
    pub const MAX_FILTERS: usize = 24;

    /// Maximum workers (event loop threads)
    pub const MAX_WORKERS: usize = 64;

    /// Default per-track scratch arena size
    pub const DEFAULT_SCRATCH_SIZE: usize = 4096;

    /// Default cap on live kernel event slots per worker
    pub const DEFAULT_MAX_KEVS: usize = 1024;

    /// Default cap on pending tasks per worker
    pub const DEFAULT_MAX_TASKS: usize = 4096;

    /// Default kernel call submission/completion ring depth
    pub const DEFAULT_KCALL_QUEUE_DEPTH: usize = 256;
}
