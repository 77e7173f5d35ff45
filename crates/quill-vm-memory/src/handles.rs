//! Native handles: stable indirection cells for code outside the heap.
//!
//! A handle survives object movement because collectors rewrite its target
//! after every cycle. A handle does not keep its target alive; when the
//! target dies the handle is invalidated and dereferencing it reports
//! [`MemoryError::InvalidHandle`]. Handles registered as globals are the
//! exception: their targets are scanned as roots.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::MemoryError;
use crate::object::ObjectRef;

/// A stable cell pointing at a (possibly moving) heap object.
pub struct Handle {
    target: AtomicUsize,
    valid: AtomicBool,
}

impl Handle {
    /// The current target, or an error if it has been collected.
    pub fn get(&self) -> Result<ObjectRef, MemoryError> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(MemoryError::InvalidHandle);
        }
        Ok(ObjectRef::from_addr(self.target.load(Ordering::Acquire)))
    }

    /// Whether the target is still live.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }
}

/// All outstanding handles plus the registered global handle locations.
pub struct HandleTable {
    handles: Mutex<Vec<Weak<Handle>>>,
    globals: Mutex<Vec<Arc<Handle>>>,
}

impl HandleTable {
    pub fn new() -> HandleTable {
        HandleTable {
            handles: Mutex::new(Vec::new()),
            globals: Mutex::new(Vec::new()),
        }
    }

    /// Create a handle for `obj`. Dropping every clone of the returned `Arc`
    /// retires the handle at the next collection.
    pub fn create(&self, obj: ObjectRef) -> Arc<Handle> {
        let handle = Arc::new(Handle {
            target: AtomicUsize::new(obj.addr()),
            valid: AtomicBool::new(true),
        });
        self.handles.lock().push(Arc::downgrade(&handle));
        handle
    }

    /// Register a handle as a global location; its target becomes a root.
    pub fn register_global(&self, handle: Arc<Handle>) {
        self.globals.lock().push(handle);
    }

    /// Remove a previously registered global location.
    pub fn unregister_global(&self, handle: &Arc<Handle>) {
        self.globals
            .lock()
            .retain(|g| !Arc::ptr_eq(g, handle));
    }

    /// Targets of all registered global locations, for root scanning.
    pub fn global_roots(&self) -> Vec<ObjectRef> {
        self.globals
            .lock()
            .iter()
            .filter(|g| g.is_valid())
            .map(|g| ObjectRef::from_addr(g.target.load(Ordering::Acquire)))
            .collect()
    }

    /// Rewrite each global location's target after a collection. Globals
    /// are roots, so `resolve` must find every one of them alive.
    pub fn update_globals<F>(&self, resolve: F)
    where
        F: Fn(ObjectRef) -> Option<ObjectRef>,
    {
        for global in self.globals.lock().iter() {
            if !global.is_valid() {
                continue;
            }
            let target = ObjectRef::from_addr(global.target.load(Ordering::Acquire));
            let new_target = resolve(target)
                .expect("registered global handle targets are roots");
            global.target.store(new_target.addr(), Ordering::Release);
        }
    }

    /// Validate every handle after a collection: moved targets are
    /// rewritten, dead targets invalidate the handle, dropped handles are
    /// pruned from the table.
    pub fn validate<F>(&self, resolve: F)
    where
        F: Fn(ObjectRef) -> Option<ObjectRef>,
    {
        self.handles.lock().retain(|weak| {
            let Some(handle) = weak.upgrade() else {
                return false;
            };
            if !handle.is_valid() {
                return true;
            }
            let target = ObjectRef::from_addr(handle.target.load(Ordering::Acquire));
            match resolve(target) {
                Some(new_target) => {
                    handle.target.store(new_target.addr(), Ordering::Release);
                }
                None => handle.valid.store(false, Ordering::Release),
            }
            true
        });
    }

    /// Number of live handle cells (diagnostics).
    pub fn live_handles(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HEADER_SIZE, MARK_FRESH, Zone, init_object};

    fn make(buf: &[u64]) -> ObjectRef {
        let size = (HEADER_SIZE + 8) as u32;
        unsafe { init_object(buf.as_ptr() as usize, 0, 0, size, Zone::Young, MARK_FRESH) }
    }

    #[test]
    fn handle_tracks_moved_target() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let old = make(&a);
        let new = make(&b);

        let table = HandleTable::new();
        let handle = table.create(old);
        assert_eq!(handle.get(), Ok(old));
        // Repeated creation yields distinct cells, not a cached one.
        let second = table.create(old);
        assert!(!Arc::ptr_eq(&handle, &second));

        table.validate(|target| if target == old { Some(new) } else { None });
        assert_eq!(handle.get(), Ok(new));
    }

    #[test]
    fn handle_invalidated_when_target_dies() {
        let a = vec![0u64; 16];
        let obj = make(&a);

        let table = HandleTable::new();
        let handle = table.create(obj);
        table.validate(|_| None);
        assert!(!handle.is_valid());
        assert_eq!(handle.get(), Err(MemoryError::InvalidHandle));
    }

    #[test]
    fn dropped_handles_are_pruned() {
        let a = vec![0u64; 16];
        let obj = make(&a);

        let table = HandleTable::new();
        let handle = table.create(obj);
        assert_eq!(table.live_handles(), 1);
        drop(handle);
        table.validate(Some);
        assert_eq!(table.live_handles(), 0);
    }

    #[test]
    fn globals_are_roots() {
        let a = vec![0u64; 16];
        let obj = make(&a);

        let table = HandleTable::new();
        let handle = table.create(obj);
        table.register_global(Arc::clone(&handle));
        assert_eq!(table.global_roots(), vec![obj]);

        table.unregister_global(&handle);
        assert!(table.global_roots().is_empty());
    }
}
