//! Engine error types

use std::fmt;
use std::io;

use nix::errno::Errno;
use thiserror::Error;
use trackline_core::{ChainError, TrackId};

use crate::track::TrackState;

/// A bounded resource that can run out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    /// Per-worker pending task queue
    Tasks,
    /// Per-worker kernel event slots
    Kevs,
    /// Kernel call bridge submission ring
    KcallQueue,
    /// Worker pool
    Workers,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Resource::Tasks => "task queue",
            Resource::Kevs => "kernel event slots",
            Resource::KcallQueue => "kernel call queue",
            Resource::Workers => "worker pool",
        })
    }
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid config: {0}")]
    Config(&'static str),

    #[error("{what} failed: {errno}")]
    Os { what: &'static str, errno: Errno },

    #[error("{0} is at capacity")]
    Capacity(Resource),

    #[error("track {track} is {state:?}; cannot {op}")]
    InvalidState {
        track: TrackId,
        state: TrackState,
        op: &'static str,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error("failed to spawn thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("engine is shut down")]
    Shutdown,
}

impl EngineError {
    /// Capture errno after a failed libc call
    pub(crate) fn last_os(what: &'static str) -> Self {
        EngineError::Os { what, errno: Errno::last() }
    }

    /// Wrap a failed I/O call on an OS facility
    pub(crate) fn os(what: &'static str, err: &io::Error) -> Self {
        EngineError::Os { what, errno: Errno::from_raw(err.raw_os_error().unwrap_or(0)) }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
