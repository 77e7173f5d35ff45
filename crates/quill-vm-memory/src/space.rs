//! Raw contiguous memory backing the copying and region spaces.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::object::OBJECT_ALIGNMENT;

/// A fixed-size, zero-initialized chunk of memory with a bump cursor.
///
/// Allocation is a CAS loop on the cursor, so multiple contexts can carve
/// from the same space without a lock. Reset is single-threaded and only
/// happens while mutators are stopped.
pub struct Space {
    base: *mut u8,
    size: usize,
    cursor: AtomicUsize,
}

// The raw pointer is owned by this struct and only handed out as usize
// addresses; all object state behind it is atomic.
unsafe impl Send for Space {}
unsafe impl Sync for Space {}

impl Space {
    /// Reserve and zero `size` bytes.
    pub fn new(size: usize) -> Space {
        let layout = Layout::from_size_align(size, OBJECT_ALIGNMENT)
            .expect("space size fits a valid layout");
        // SAFETY: layout has non-zero size and valid alignment.
        let base = unsafe { alloc::alloc_zeroed(layout) };
        if base.is_null() {
            alloc::handle_alloc_error(layout);
        }
        Space {
            base,
            size,
            cursor: AtomicUsize::new(base as usize),
        }
    }

    /// Base address of the space.
    #[inline]
    pub fn start(&self) -> usize {
        self.base as usize
    }

    /// One past the last usable address.
    #[inline]
    pub fn end(&self) -> usize {
        self.base as usize + self.size
    }

    /// Bytes currently allocated.
    pub fn used(&self) -> usize {
        self.cursor.load(Ordering::Acquire) - self.start()
    }

    /// Current bump cursor.
    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// True if `addr` falls inside this space.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start() && addr < self.end()
    }

    /// Bump-allocate `size` aligned bytes; `None` when the space is full.
    pub fn allocate(&self, size: usize) -> Option<usize> {
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            let next = current.checked_add(size)?;
            if next > self.end() {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }

    /// Rewind the cursor and zero the used prefix.
    ///
    /// Callers must guarantee no live object remains in the space and no
    /// other thread is allocating from it.
    pub fn reset(&self) {
        let used = self.used();
        // SAFETY: the memory is owned by this space and, per the contract
        // above, no other thread touches it during reset.
        unsafe {
            std::ptr::write_bytes(self.base, 0, used);
        }
        self.cursor.store(self.start(), Ordering::Release);
    }
}

impl Drop for Space {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, OBJECT_ALIGNMENT)
            .expect("space size fits a valid layout");
        // SAFETY: base was allocated with this exact layout.
        unsafe {
            alloc::dealloc(self.base, layout);
        }
    }
}
