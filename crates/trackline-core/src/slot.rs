//! Generation-tagged slot pool
//!
//! Backs the per-worker kernel event slots. Freed indices go onto a LIFO
//! free stack so recently released slots are reused first. Every free bumps
//! the slot's generation; a [`KevHandle`] minted before the free no longer
//! resolves.
//!
//! The pool is owned by one worker and is not synchronized.

use crate::id::KevHandle;

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Fixed-capacity pool of values addressed by generation-tagged handles
pub struct GenSlots<T> {
    entries: Vec<Entry<T>>,
    /// LIFO stack of free indices
    free_stack: Vec<u32>,
    max_live: usize,
    live: usize,
}

impl<T> GenSlots<T> {
    /// Create a pool that holds at most `max_live` values at once
    pub fn new(max_live: usize) -> Self {
        Self {
            entries: Vec::new(),
            free_stack: Vec::new(),
            max_live,
            live: 0,
        }
    }

    /// Store a value, returning its handle, or `None` at capacity
    pub fn insert(&mut self, value: T) -> Option<KevHandle> {
        if self.live >= self.max_live {
            return None;
        }

        let index = match self.free_stack.pop() {
            Some(i) => i,
            None => {
                self.entries.push(Entry { generation: 0, value: None });
                (self.entries.len() - 1) as u32
            }
        };
        let entry = &mut self.entries[index as usize];
        entry.value = Some(value);
        self.live += 1;
        Some(KevHandle::new(index, entry.generation))
    }

    /// Remove a value. Stale handles return `None` and change nothing.
    pub fn remove(&mut self, handle: KevHandle) -> Option<T> {
        let entry = self.entry_mut(handle)?;
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_stack.push(handle.index());
        self.live -= 1;
        Some(value)
    }

    pub fn get(&self, handle: KevHandle) -> Option<&T> {
        let entry = self.entries.get(handle.index() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        entry.value.as_ref()
    }

    pub fn get_mut(&mut self, handle: KevHandle) -> Option<&mut T> {
        self.entry_mut(handle)?.value.as_mut()
    }

    /// Whether the handle still names a live value
    #[inline]
    pub fn contains(&self, handle: KevHandle) -> bool {
        self.get(handle).is_some()
    }

    /// Number of live values
    #[inline]
    pub fn len(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn max_live(&self) -> usize {
        self.max_live
    }

    fn entry_mut(&mut self, handle: KevHandle) -> Option<&mut Entry<T>> {
        let entry = self.entries.get_mut(handle.index() as usize)?;
        if entry.generation != handle.generation() {
            return None;
        }
        Some(entry)
    }
}
