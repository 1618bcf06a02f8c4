//! Error types shared by the chain and the runtime

use thiserror::Error;

/// Errors in the shape of a filter chain or its cursor movement.
///
/// These are programming errors in a filter (or its collaborator) and are
/// always fatal to the track that hit them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChainError {
    /// The first filter asked for more input
    #[error("filter '{0}' requested more input but is the first in the chain")]
    MoreFromFirst(&'static str),

    /// Insertion would exceed the maximum chain length
    #[error("chain is full ({0} filters)")]
    Full(usize),

    /// Cursor-relative operation with no active slot
    #[error("no filter is active")]
    NoCursor,
}

/// Error returned by a filter's `open` operation
#[derive(Error, Debug)]
pub enum FilterError {
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error code {0}")]
    Code(i32),
}

/// The sticky error recorded on a track.
///
/// Only the first error a track hits is kept.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TrackError {
    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("filter '{filter}' failed to open: {reason}")]
    Open { filter: &'static str, reason: String },

    #[error("filter '{filter}' reported error {code}")]
    Filter { filter: &'static str, code: i32 },

    #[error("filter '{filter}' hit a system error: errno {errno}")]
    System { filter: &'static str, errno: i32 },
}

impl TrackError {
    /// Numeric code suitable for process exit status or FFI
    pub fn code(&self) -> i32 {
        match self {
            TrackError::Chain(_) => -1,
            TrackError::Open { .. } => -2,
            TrackError::Filter { code, .. } => *code,
            TrackError::System { errno, .. } => *errno,
        }
    }
}
