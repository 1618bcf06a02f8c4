//! Identifier types

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index of a worker in the pool.
///
/// Worker 0 is always the first worker created and is kept free for
/// bookkeeping once the pool grows past one worker.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    /// The bookkeeping worker
    pub const ZERO: WorkerId = WorkerId(0);

    #[inline]
    pub const fn new(id: u32) -> Self {
        WorkerId(id)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Process-unique track identifier
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[repr(transparent)]
pub struct TrackId(u64);

impl TrackId {
    /// Allocate the next track id
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        TrackId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "*{}", self.0)
    }
}

/// Generation-tagged handle to a kernel event slot.
///
/// The generation changes every time the slot is freed, so a handle (or a
/// readiness notification carrying one) that outlives its registration no
/// longer matches the slot and is dropped instead of dispatched.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct KevHandle {
    index: u32,
    generation: u32,
}

impl KevHandle {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        KevHandle { index, generation }
    }

    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the 64-bit user data word of an OS notification
    #[inline]
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_token(token: u64) -> Self {
        KevHandle {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Display for KevHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "kev{}.{}", self.index, self.generation)
    }
}
