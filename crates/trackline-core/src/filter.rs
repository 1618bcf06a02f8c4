//! Filter result kinds and invocation flags
//!
//! Every `process` call returns a [`FilterResult`]. The conveyor uses it to
//! decide where the cursor goes next and which buffer the next filter sees.

/// What a filter asks the engine to do after one `process` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterResult {
    /// Output is ready; move one filter forward with it as input
    Data,

    /// Like `Data`, and skip this filter once on the next backward walk
    Ok,

    /// This filter is finished and leaves the chain. Its output (possibly
    /// empty) still flows forward. Finishing the last filter completes the
    /// track.
    Done,

    /// Like `Done`, and every filter before this one leaves the chain too
    LastOut,

    /// Need more input; move one filter backward
    More,

    /// Resubmit this filter's output as the upstream filter's new input
    Back,

    /// Suspend the track until something calls `wake`
    Async,

    /// Stop processing and close the track without an error
    Fin,

    /// Stop processing and close the track with this error code
    Err(i32),
}

impl FilterResult {
    /// Map an I/O error onto `Err` with its OS error code (or -1)
    pub fn from_io(e: &std::io::Error) -> Self {
        FilterResult::Err(e.raw_os_error().unwrap_or(-1))
    }

    /// Whether the track stops being scheduled after this result
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, FilterResult::Fin | FilterResult::Err(_))
    }
}

/// Flags passed into each `process` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags {
    /// This filter is at the head of the chain; no upstream input will come
    pub first: bool,
    /// The previous step produced output flowing forward into this filter
    pub forward: bool,
    /// Somebody asked the track to stop
    pub stop: bool,
}

/// Where a filter is placed in a chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Append at the end (sink side)
    Last,
    /// Insert at the head (source side)
    First,
    /// Immediately before the filter under the cursor
    BeforeCurrent,
    /// Immediately after the filter under the cursor
    AfterCurrent,
}
