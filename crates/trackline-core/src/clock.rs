//! Clock accessors
//!
//! Workers cache a monotonic timestamp once per loop iteration; timers and
//! filters read that cached value instead of calling into the OS.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Current monotonic time
#[inline]
pub fn monotonic() -> Instant {
    Instant::now()
}

/// Wall clock time since the Unix epoch
#[inline]
pub fn wall() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO)
}

/// A cached pair of monotonic and wall readings
#[derive(Debug, Clone, Copy)]
pub struct Timestamp {
    pub mono: Instant,
    pub wall: Duration,
}

impl Timestamp {
    pub fn now() -> Self {
        Timestamp { mono: monotonic(), wall: wall() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monotonic_advances() {
        let a = monotonic();
        let b = monotonic();
        assert!(b >= a);
        assert!(wall() > Duration::from_secs(1_000_000_000));
    }
}
