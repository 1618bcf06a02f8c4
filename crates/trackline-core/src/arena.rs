//! Per-track scratch arena
//!
//! Each track owns one fixed block of memory. Filters place private state
//! in it when they open, so short chains need no per-filter heap
//! allocation. When the block is exhausted (or a value needs stricter
//! alignment than the block provides) allocation silently falls back to
//! the global allocator.
//!
//! Space is bump-allocated and never reused; it is released when the arena
//! and every [`ScratchBox`] carved from it are gone.

use std::alloc::{self, Layout};
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Alignment of the arena block
const BLOCK_ALIGN: usize = 16;

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// The block is plain memory; values placed in it are owned by their
// ScratchBox, which carries its own Send/Sync bounds.
unsafe impl Send for Block {}
unsafe impl Sync for Block {}

impl Drop for Block {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Bump allocator scoped to one track
pub struct ScratchArena {
    block: Option<Arc<Block>>,
    capacity: usize,
    offset: AtomicUsize,
}

impl ScratchArena {
    /// Create an arena with `size` bytes. Size 0 disables the arena and
    /// every allocation goes to the heap.
    pub fn new(size: usize) -> Self {
        let block = Layout::from_size_align(size, BLOCK_ALIGN)
            .ok()
            .filter(|l| l.size() > 0)
            .and_then(|layout| {
                let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
                Some(Arc::new(Block { ptr, layout }))
            });
        let capacity = if block.is_some() { size } else { 0 };
        Self { block, capacity, offset: AtomicUsize::new(0) }
    }

    /// Move `value` into the arena, or onto the heap if it does not fit
    pub fn alloc<T>(&self, value: T) -> ScratchBox<T> {
        match self.reserve(Layout::new::<T>()) {
            Some((ptr, block)) => {
                let ptr = ptr.cast::<T>();
                unsafe { ptr.as_ptr().write(value) };
                ScratchBox { inner: Inner::Arena { ptr, _block: block }, _owns: PhantomData }
            }
            None => ScratchBox { inner: Inner::Heap(Box::new(value)), _owns: PhantomData },
        }
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn reserve(&self, layout: Layout) -> Option<(NonNull<u8>, Arc<Block>)> {
        let block = self.block.as_ref()?;
        if layout.size() == 0 || layout.align() > BLOCK_ALIGN {
            return None;
        }

        let mut cur = self.offset.load(Ordering::Relaxed);
        loop {
            let start = (cur + layout.align() - 1) & !(layout.align() - 1);
            let end = start.checked_add(layout.size())?;
            if end > self.capacity {
                return None;
            }
            match self.offset.compare_exchange_weak(cur, end, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => {
                    let ptr = unsafe { NonNull::new_unchecked(block.ptr.as_ptr().add(start)) };
                    return Some((ptr, Arc::clone(block)));
                }
                Err(actual) => cur = actual,
            }
        }
    }
}

impl fmt::Debug for ScratchArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchArena")
            .field("used", &self.used())
            .field("capacity", &self.capacity)
            .finish()
    }
}

enum Inner<T> {
    Arena { ptr: NonNull<T>, _block: Arc<Block> },
    Heap(Box<T>),
}

/// Unique owner of a value placed by [`ScratchArena::alloc`]
pub struct ScratchBox<T> {
    inner: Inner<T>,
    _owns: PhantomData<T>,
}

unsafe impl<T: Send> Send for ScratchBox<T> {}
unsafe impl<T: Sync> Sync for ScratchBox<T> {}

impl<T> ScratchBox<T> {
    /// Whether the value lives in the arena rather than on the heap
    pub fn is_inline(&self) -> bool {
        matches!(self.inner, Inner::Arena { .. })
    }
}

impl<T> Deref for ScratchBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.inner {
            Inner::Arena { ptr, .. } => unsafe { ptr.as_ref() },
            Inner::Heap(b) => b,
        }
    }
}

impl<T> DerefMut for ScratchBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.inner {
            Inner::Arena { ptr, .. } => unsafe { ptr.as_mut() },
            Inner::Heap(b) => b,
        }
    }
}

impl<T> Drop for ScratchBox<T> {
    fn drop(&mut self) {
        if let Inner::Arena { ptr, .. } = &self.inner {
            unsafe { std::ptr::drop_in_place(ptr.as_ptr()) };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ScratchBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
