//! Code resources: out-of-heap allocations owned by managed objects.
//!
//! Compiled stubs, inline caches and similar artifacts live outside the
//! object heap but die with a managed owner. The manager sweeps them at the
//! end of each mature cycle; freeing is never triggered by reference counts.

use parking_lot::Mutex;
use tracing::debug;

use crate::object::ObjectRef;

/// An out-of-heap resource tied to the lifetime of a managed object.
pub trait CodeResource: Send {
    /// Bytes the resource occupies, for accounting.
    fn size(&self) -> usize;
    /// Release whatever the resource owns. Called exactly once, on the
    /// collecting thread, after the owner is known dead.
    fn cleanup(&mut self);
}

struct CodeEntry {
    owner: ObjectRef,
    resource: Box<dyn CodeResource>,
}

/// Registry of code resources keyed by their managed owner.
pub struct CodeManager {
    entries: Mutex<Vec<CodeEntry>>,
}

impl CodeManager {
    pub fn new() -> CodeManager {
        CodeManager {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Tie `resource`'s lifetime to `owner`.
    pub fn add_resource(&self, resource: Box<dyn CodeResource>, owner: ObjectRef) {
        self.entries.lock().push(CodeEntry { owner, resource });
    }

    /// Sweep at mature-cycle end: rewrite moved owners, clean up and drop
    /// resources whose owner died. Returns bytes released.
    pub fn sweep<F>(&self, resolve: F) -> usize
    where
        F: Fn(ObjectRef) -> Option<ObjectRef>,
    {
        let mut entries = self.entries.lock();
        let mut released = 0usize;
        let mut index = 0;
        while index < entries.len() {
            match resolve(entries[index].owner) {
                Some(new_owner) => {
                    entries[index].owner = new_owner;
                    index += 1;
                }
                None => {
                    let mut entry = entries.swap_remove(index);
                    released += entry.resource.size();
                    entry.resource.cleanup();
                }
            }
        }
        if released > 0 {
            debug!(target: "quill::gc", released, "code resources swept");
        }
        released
    }

    /// Bytes currently held by live resources.
    pub fn resource_bytes(&self) -> usize {
        self.entries.lock().iter().map(|e| e.resource.size()).sum()
    }

    /// Number of live resources (diagnostics).
    pub fn resource_count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for CodeManager {
    fn default() -> Self {
        Self::new()
    }
}
