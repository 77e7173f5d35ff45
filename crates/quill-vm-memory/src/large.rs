//! Non-moving large object space.
//!
//! Objects at or above the configured threshold get their own allocation,
//! bucketed by power-of-two size class. Nothing here ever moves; the space
//! is swept at the end of each mature cycle by freeing entries whose mark
//! word does not carry the live sentinel.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::object::{OBJECT_ALIGNMENT, ObjectRef, Zone, init_object};

struct LargeEntry {
    addr: usize,
    class: usize,
}

/// Large object space: one allocation per object, bucketed by size class.
pub struct LargeObjectSpace {
    buckets: Mutex<FxHashMap<usize, Vec<LargeEntry>>>,
    used_bytes: AtomicUsize,
}

fn size_class(size: usize) -> usize {
    size.next_power_of_two()
}

fn class_layout(class: usize) -> Layout {
    Layout::from_size_align(class, OBJECT_ALIGNMENT)
        .expect("size class fits a valid layout")
}

impl LargeObjectSpace {
    pub fn new() -> LargeObjectSpace {
        LargeObjectSpace {
            buckets: Mutex::new(FxHashMap::default()),
            used_bytes: AtomicUsize::new(0),
        }
    }

    /// Allocate and initialize a large object. `mark` is the mark word the
    /// fresh header gets; during concurrent marking that is the live
    /// sentinel (black allocation).
    pub fn allocate(
        &self,
        class_id: u32,
        tag: u16,
        size: usize,
        mark: u32,
    ) -> Option<ObjectRef> {
        let class = size_class(size);
        let layout = class_layout(class);
        // SAFETY: layout has non-zero size and valid alignment.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        let addr = ptr as usize;
        // SAFETY: addr points at `class` >= `size` fresh zeroed bytes.
        let obj = unsafe { init_object(addr, class_id, tag, size as u32, Zone::Large, mark) };
        self.buckets
            .lock()
            .entry(class)
            .or_default()
            .push(LargeEntry { addr, class });
        self.used_bytes.fetch_add(class, Ordering::AcqRel);
        Some(obj)
    }

    /// Free every object whose mark word is not the live sentinel.
    /// Returns the number of objects freed.
    pub fn sweep(&self, sentinel: u32) -> usize {
        let mut buckets = self.buckets.lock();
        let mut freed = 0;
        for entries in buckets.values_mut() {
            entries.retain(|entry| {
                let obj = ObjectRef::from_addr(entry.addr);
                if obj.header().is_marked(sentinel) {
                    true
                } else {
                    // SAFETY: the entry owns this allocation; dead objects
                    // have no remaining references after table sweeps.
                    unsafe {
                        alloc::dealloc(entry.addr as *mut u8, class_layout(entry.class));
                    }
                    self.used_bytes.fetch_sub(entry.class, Ordering::AcqRel);
                    freed += 1;
                    false
                }
            });
        }
        buckets.retain(|_, entries| !entries.is_empty());
        freed
    }

    /// Visit every entry carrying `sentinel`.
    pub fn for_each_marked(&self, sentinel: u32, mut visit: impl FnMut(ObjectRef)) {
        for entries in self.buckets.lock().values() {
            for entry in entries {
                let obj = ObjectRef::from_addr(entry.addr);
                if obj.header().is_marked(sentinel) {
                    visit(obj);
                }
            }
        }
    }

    /// Bytes currently held, rounded up to size classes.
    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Number of live entries (diagnostics).
    pub fn object_count(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }
}

impl Default for LargeObjectSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeObjectSpace {
    fn drop(&mut self) {
        let buckets = self.buckets.get_mut();
        for entries in buckets.values() {
            for entry in entries {
                // SAFETY: each entry owns exactly one allocation of its
                // class layout.
                unsafe {
                    alloc::dealloc(entry.addr as *mut u8, class_layout(entry.class));
                }
            }
        }
    }
}
