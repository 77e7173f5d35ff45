//! Finalization registration and the finalizer thread.
//!
//! Interest is registered at most once per object. When a collection finds a
//! registered object unreachable, its entry moves to the pending queue and
//! is gone from the registry, so a finalizer runs exactly once. Callbacks
//! are invoked by a dedicated thread, never inline on the collecting thread,
//! which keeps arbitrary user code out of the stop-the-world window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::object::{FLAG_FINALIZER, ObjectRef};

/// Who the finalizer belongs to. Managed finalizers come from the hosted
/// program's finalize protocol; native ones from embedding code. Both run as
/// callbacks on the finalizer thread; the kind is kept for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerKind {
    Managed,
    Native,
}

type FinalizerFn = Box<dyn FnOnce() + Send>;

struct Entry {
    target: ObjectRef,
    kind: FinalizerKind,
    callback: FinalizerFn,
}

struct Pending {
    kind: FinalizerKind,
    callback: FinalizerFn,
}

/// Registry of finalizable objects plus the pending queue.
pub struct FinalizerRegistry {
    entries: Mutex<Vec<Entry>>,
    pending: Mutex<VecDeque<Pending>>,
    pending_ready: Condvar,
    shutdown: AtomicBool,
}

impl FinalizerRegistry {
    pub fn new() -> FinalizerRegistry {
        FinalizerRegistry {
            entries: Mutex::new(Vec::new()),
            pending: Mutex::new(VecDeque::new()),
            pending_ready: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Register finalization interest for `obj`. Returns false if the object
    /// already has a finalizer; the first registration wins.
    pub fn register(
        &self,
        obj: ObjectRef,
        kind: FinalizerKind,
        callback: FinalizerFn,
    ) -> bool {
        if obj.header().test_and_set_flag(FLAG_FINALIZER) {
            return false;
        }
        self.entries.lock().push(Entry {
            target: obj,
            kind,
            callback,
        });
        true
    }

    /// Walk the registry after a collection. Live targets are rewritten to
    /// their new location; dead targets move to the pending queue.
    pub fn sweep<F>(&self, resolve: F)
    where
        F: Fn(ObjectRef) -> Option<ObjectRef>,
    {
        let mut entries = self.entries.lock();
        let mut queued = 0usize;
        let mut index = 0;
        while index < entries.len() {
            match resolve(entries[index].target) {
                Some(new_target) => {
                    entries[index].target = new_target;
                    index += 1;
                }
                None => {
                    let entry = entries.swap_remove(index);
                    self.pending.lock().push_back(Pending {
                        kind: entry.kind,
                        callback: entry.callback,
                    });
                    queued += 1;
                }
            }
        }
        if queued > 0 {
            debug!(target: "quill::gc", queued, "finalizers queued");
            self.pending_ready.notify_one();
        }
    }

    /// Run pending finalizers until the registry shuts down. The dedicated
    /// finalizer thread body.
    pub fn run(&self) {
        loop {
            let pending = {
                let mut queue = self.pending.lock();
                loop {
                    if let Some(pending) = queue.pop_front() {
                        break pending;
                    }
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    self.pending_ready.wait(&mut queue);
                }
            };
            // Queue lock dropped; the callback may touch the registry.
            debug!(target: "quill::gc", kind = ?pending.kind, "running finalizer");
            (pending.callback)();
        }
    }

    /// Ask the finalizer thread to exit once the queue is empty.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.pending_ready.notify_all();
    }

    /// Registered, not-yet-dead entries (diagnostics).
    pub fn live_entries(&self) -> usize {
        self.entries.lock().len()
    }

    /// Dead entries awaiting their callback (diagnostics).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Default for FinalizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the dedicated finalizer thread over a shared registry.
pub fn spawn_finalizer_thread(registry: Arc<FinalizerRegistry>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("quill-finalizer".into())
        .spawn(move || registry.run())
        .expect("finalizer thread spawns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::object::{HEADER_SIZE, MARK_FRESH, Zone, init_object};

    fn make(buf: &[u64]) -> ObjectRef {
        let size = (HEADER_SIZE + 8) as u32;
        unsafe { init_object(buf.as_ptr() as usize, 0, 0, size, Zone::Mature, MARK_FRESH) }
    }

    #[test]
    fn registers_once_per_object() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let registry = FinalizerRegistry::new();

        assert!(registry.register(obj, FinalizerKind::Native, Box::new(|| {})));
        assert!(!registry.register(obj, FinalizerKind::Managed, Box::new(|| {})));
        assert_eq!(registry.live_entries(), 1);
    }

    #[test]
    fn dead_target_queued_exactly_once() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let registry = FinalizerRegistry::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_cb = Arc::clone(&fired);
        registry.register(
            obj,
            FinalizerKind::Native,
            Box::new(move || {
                fired_in_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.sweep(|_| None);
        registry.sweep(|_| None);
        assert_eq!(registry.live_entries(), 0);
        assert_eq!(registry.pending_count(), 1);

        let registry = Arc::new(registry);
        let thread = spawn_finalizer_thread(Arc::clone(&registry));
        registry.shutdown();
        thread.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn live_target_rewritten_on_move() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let old = make(&a);
        let new = make(&b);
        let registry = FinalizerRegistry::new();
        registry.register(old, FinalizerKind::Managed, Box::new(|| {}));

        registry.sweep(|target| if target == old { Some(new) } else { None });
        assert_eq!(registry.live_entries(), 1);
        assert_eq!(registry.pending_count(), 0);

        // The rewritten entry dies on the next sweep.
        registry.sweep(|target| if target == old { Some(old) } else { None });
        assert_eq!(registry.pending_count(), 1);
    }
}
