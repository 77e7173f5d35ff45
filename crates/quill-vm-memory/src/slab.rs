//! Per-context bump slabs over the young generation.
//!
//! Each execution context holds one slab and allocates from it with plain
//! arithmetic, no synchronization. A young collection invalidates every
//! outstanding slab at once by bumping the shared epoch; a stale slab simply
//! refuses to allocate and the context refills under the allocation lock.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::object::OBJECT_ALIGNMENT;

/// A contiguous run of young-space bytes owned by one execution context.
pub struct Slab {
    start: usize,
    cursor: usize,
    end: usize,
    epoch: u64,
}

impl Slab {
    /// An empty slab that fails every allocation; contexts start with this.
    pub fn empty() -> Slab {
        Slab {
            start: 0,
            cursor: 0,
            end: 0,
            epoch: 0,
        }
    }

    /// A live slab over `[start, start + size)` stamped with the epoch it
    /// was carved under.
    pub fn new(start: usize, size: usize, epoch: u64) -> Slab {
        Slab {
            start,
            cursor: start,
            end: start + size,
            epoch,
        }
    }

    /// Bump-allocate `size` aligned bytes.
    ///
    /// Returns `None` when the slab is exhausted or was carved under an
    /// earlier epoch, i.e. its memory belongs to a semispace that has since
    /// been flipped.
    #[inline]
    pub fn allocate(&mut self, size: usize, current_epoch: u64) -> Option<usize> {
        debug_assert!(size % OBJECT_ALIGNMENT == 0);
        if self.epoch != current_epoch {
            return None;
        }
        let next = self.cursor.checked_add(size)?;
        if next > self.end {
            return None;
        }
        let addr = self.cursor;
        self.cursor = next;
        Some(addr)
    }

    /// Bytes still available (zero once stale).
    pub fn remaining(&self) -> usize {
        self.end - self.cursor
    }

    /// Bytes handed out from this slab.
    pub fn used(&self) -> usize {
        self.cursor - self.start
    }
}

/// Shared epoch counter; bumped once per young collection.
pub struct SlabEpoch(AtomicU64);

impl SlabEpoch {
    pub fn new() -> SlabEpoch {
        SlabEpoch(AtomicU64::new(1))
    }

    /// Current epoch.
    #[inline]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    /// Invalidate every slab carved under the current epoch.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

impl Default for SlabEpoch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_until_exhausted() {
        let mut slab = Slab::new(0x1000, 64, 1);
        assert_eq!(slab.allocate(24, 1), Some(0x1000));
        assert_eq!(slab.allocate(24, 1), Some(0x1018));
        assert_eq!(slab.remaining(), 16);
        assert_eq!(slab.allocate(24, 1), None);
        assert_eq!(slab.allocate(16, 1), Some(0x1030));
        assert_eq!(slab.allocate(8, 1), None);
    }

    #[test]
    fn stale_epoch_refuses() {
        let epoch = SlabEpoch::new();
        let mut slab = Slab::new(0x1000, 4096, epoch.current());
        assert!(slab.allocate(32, epoch.current()).is_some());
        epoch.advance();
        assert_eq!(slab.allocate(32, epoch.current()), None);
        assert!(slab.remaining() > 0);
    }

    #[test]
    fn empty_slab_never_allocates() {
        let mut slab = Slab::empty();
        assert_eq!(slab.allocate(8, 0), None);
        assert_eq!(slab.allocate(8, 1), None);
    }
}
