//! Kernel event slot pool
//!
//! A kernel event slot ("kev") correlates one OS readiness source or one
//! in-flight kernel call with the handler that wants to hear about it. The
//! slot's [`KevHandle`] is packed into the epoll user-data word and into
//! every kernel call job, so when a notification arrives for a slot that
//! has since been freed (and maybe reused) the generation no longer
//! matches and the notification is dropped.

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;

use trackline_core::{GenSlots, KevHandle};

use crate::kcall::KcallOutput;
use crate::worker::WorkerCx;

/// Token reserved for the worker's post eventfd
pub(crate) const POST_TOKEN: u64 = u64::MAX;
/// Token reserved for the worker's timer tick
pub(crate) const TIMER_TOKEN: u64 = u64::MAX - 1;

/// What happened on a kernel event slot
pub enum KevEvent {
    Readable,
    Writable,
    /// A kernel call submitted on this slot finished
    Completed(io::Result<KcallOutput>),
}

impl fmt::Debug for KevEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KevEvent::Readable => f.write_str("Readable"),
            KevEvent::Writable => f.write_str("Writable"),
            KevEvent::Completed(Ok(out)) => write!(f, "Completed({out:?})"),
            KevEvent::Completed(Err(e)) => write!(f, "Completed(Err({e}))"),
        }
    }
}

/// Handler invoked on the owning worker for every event on a slot
pub type KevFn = Box<dyn FnMut(&mut WorkerCx, KevHandle, KevEvent) + Send>;

struct KevSlot {
    /// `None` while the handler is running
    handler: Option<KevFn>,
    /// Registered descriptor, removed from epoll on free
    fd: Option<RawFd>,
}

/// Bounded pool of kernel event slots owned by one worker
pub struct KevPool {
    slots: GenSlots<KevSlot>,
}

impl KevPool {
    pub fn new(max_live: usize) -> Self {
        Self { slots: GenSlots::new(max_live) }
    }

    /// Allocate a slot, or `None` at capacity
    pub fn alloc(&mut self, handler: KevFn) -> Option<KevHandle> {
        self.slots.insert(KevSlot { handler: Some(handler), fd: None })
    }

    /// Free a slot, returning the descriptor that was attached to it
    pub fn free(&mut self, handle: KevHandle) -> Option<Option<RawFd>> {
        self.slots.remove(handle).map(|slot| slot.fd)
    }

    /// Record the descriptor registered for a slot
    pub(crate) fn set_fd(&mut self, handle: KevHandle, fd: RawFd) -> bool {
        match self.slots.get_mut(handle) {
            Some(slot) => {
                slot.fd = Some(fd);
                true
            }
            None => false,
        }
    }

    pub fn fd(&self, handle: KevHandle) -> Option<RawFd> {
        self.slots.get(handle).and_then(|s| s.fd)
    }

    #[inline]
    pub fn contains(&self, handle: KevHandle) -> bool {
        self.slots.contains(handle)
    }

    /// Take a slot's handler out for dispatch. `None` means the handle is
    /// stale or the handler is already running.
    pub(crate) fn take_handler(&mut self, handle: KevHandle) -> Option<KevFn> {
        self.slots.get_mut(handle)?.handler.take()
    }

    /// Return a handler after dispatch, unless the slot was freed meanwhile
    pub(crate) fn restore_handler(&mut self, handle: KevHandle, handler: KevFn) {
        if let Some(slot) = self.slots.get_mut(handle) {
            if slot.handler.is_none() {
                slot.handler = Some(handler);
            }
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn max_live(&self) -> usize {
        self.slots.max_live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> KevFn {
        Box::new(|_, _, _| {})
    }

    #[test]
    fn test_alloc_until_full() {
        let mut pool = KevPool::new(2);
        let a = pool.alloc(noop()).unwrap();
        let _b = pool.alloc(noop()).unwrap();
        assert!(pool.alloc(noop()).is_none());

        pool.free(a);
        assert!(pool.alloc(noop()).is_some());
    }

    #[test]
    fn test_stale_handle_has_no_handler() {
        let mut pool = KevPool::new(4);
        let old = pool.alloc(noop()).unwrap();
        pool.free(old);
        let new = pool.alloc(noop()).unwrap();
        assert_eq!(new.index(), old.index());

        assert!(pool.take_handler(old).is_none());
        assert!(pool.take_handler(new).is_some());
    }

    #[test]
    fn test_take_restore() {
        let mut pool = KevPool::new(4);
        let h = pool.alloc(noop()).unwrap();
        let f = pool.take_handler(h).unwrap();
        // Re-entrant dispatch sees no handler
        assert!(pool.take_handler(h).is_none());
        pool.restore_handler(h, f);
        assert!(pool.take_handler(h).is_some());
    }

    #[test]
    fn test_free_returns_fd() {
        let mut pool = KevPool::new(4);
        let h = pool.alloc(noop()).unwrap();
        assert!(pool.set_fd(h, 9));
        assert_eq!(pool.fd(h), Some(9));
        assert_eq!(pool.free(h), Some(Some(9)));
        assert_eq!(pool.free(h), None);
    }

    #[test]
    fn test_tokens_do_not_collide() {
        let h = KevHandle::new(0, u32::MAX);
        assert_ne!(h.to_token(), POST_TOKEN);
        assert_ne!(h.to_token(), TIMER_TOKEN);
    }
}
