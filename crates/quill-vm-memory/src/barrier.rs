//! Generational and concurrent-mark write barriers.
//!
//! Two consumers hang off the same store hook. The remembered set records
//! mature/large objects that have gained a young field, so young collections
//! can treat them as roots without scanning the whole mature heap. The mark
//! feed records objects mutated while the concurrent marker runs, so the
//! marker can re-scan them before declaring the cycle complete.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use crate::object::{FLAG_REMEMBERED, ObjectRef, Zone};

/// Shared write-barrier state.
pub struct WriteBarrier {
    /// Mature/large objects holding at least one young reference. Deduped
    /// via [`FLAG_REMEMBERED`] on the source header, so this stays a plain
    /// vector with no per-store set lookup.
    remembered: Mutex<Vec<ObjectRef>>,
    /// Set while the concurrent marker is between snapshot and completion.
    marking: AtomicBool,
    /// Objects mutated during concurrent marking, drained by the marker.
    feed: Mutex<FxHashSet<ObjectRef>>,
}

impl WriteBarrier {
    pub fn new() -> WriteBarrier {
        WriteBarrier {
            remembered: Mutex::new(Vec::new()),
            marking: AtomicBool::new(false),
            feed: Mutex::new(FxHashSet::default()),
        }
    }

    /// Record the store `source.field = target` after the field write.
    pub fn record_store(&self, source: ObjectRef, target: Option<ObjectRef>) {
        if let Some(target) = target {
            if source.header().zone() != Zone::Young
                && target.header().zone() == Zone::Young
            {
                self.remember(source);
            }
        }
        if self.marking.load(Ordering::Acquire) {
            self.feed.lock().insert(source);
        }
    }

    /// Add `source` to the remembered set unless it is already there.
    pub fn remember(&self, source: ObjectRef) {
        if !source.header().test_and_set_flag(FLAG_REMEMBERED) {
            self.remembered.lock().push(source);
        }
    }

    /// Take the remembered set for a young collection. The collector clears
    /// each source's flag, rescans it, and re-records survivors that still
    /// point young.
    pub fn take_remembered(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.remembered.lock())
    }

    /// Number of remembered sources (diagnostics).
    pub fn remembered_len(&self) -> usize {
        self.remembered.lock().len()
    }

    /// Begin routing mutated objects to the mark feed.
    pub fn enable_mark_feed(&self) {
        self.feed.lock().clear();
        self.marking.store(true, Ordering::Release);
    }

    /// Stop routing to the mark feed.
    pub fn disable_mark_feed(&self) {
        self.marking.store(false, Ordering::Release);
    }

    /// Drain objects mutated since the last drain. Empty means the marker
    /// has caught up with the mutators.
    pub fn drain_mark_feed(&self) -> Vec<ObjectRef> {
        self.feed.lock().drain().collect()
    }

    /// Put sources back on the feed after a collection rewrote their
    /// addresses; they still owe the marker a rescan.
    pub fn refeed(&self, sources: impl IntoIterator<Item = ObjectRef>) {
        self.feed.lock().extend(sources);
    }
}

impl Default for WriteBarrier {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HEADER_SIZE, MARK_FRESH, init_object};

    fn make(buf: &[u64], zone: Zone) -> ObjectRef {
        let size = (HEADER_SIZE + 8) as u32;
        unsafe { init_object(buf.as_ptr() as usize, 0, 0, size, zone, MARK_FRESH) }
    }

    #[test]
    fn old_to_young_store_is_remembered_once() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let mature = make(&a, Zone::Mature);
        let young = make(&b, Zone::Young);

        let barrier = WriteBarrier::new();
        barrier.record_store(mature, Some(young));
        barrier.record_store(mature, Some(young));
        assert_eq!(barrier.remembered_len(), 1);
        assert!(mature.header().flag(FLAG_REMEMBERED));
    }

    #[test]
    fn young_to_young_store_is_not_remembered() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let src = make(&a, Zone::Young);
        let dst = make(&b, Zone::Young);

        let barrier = WriteBarrier::new();
        barrier.record_store(src, Some(dst));
        barrier.record_store(src, None);
        assert_eq!(barrier.remembered_len(), 0);
    }

    #[test]
    fn mark_feed_collects_mutated_sources() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let src = make(&a, Zone::Mature);
        let other = make(&b, Zone::Mature);

        let barrier = WriteBarrier::new();
        barrier.record_store(src, Some(other));
        assert!(barrier.drain_mark_feed().is_empty());

        barrier.enable_mark_feed();
        barrier.record_store(src, Some(other));
        barrier.record_store(src, None);
        let drained = barrier.drain_mark_feed();
        assert_eq!(drained, vec![src]);
        assert!(barrier.drain_mark_feed().is_empty());
        barrier.disable_mark_feed();
    }
}
