//! Concurrent marker thread.
//!
//! Marking runs on a dedicated thread while mutators keep allocating. The
//! marker traces in small batches, holding the heap lock for read during
//! each batch; collectors that move objects take it for write, so a batch
//! never observes a half-moved heap. Addresses picked up before a move are
//! resolved by chasing forwarding at pop time. The write barrier feeds
//! mutated objects back to the marker, which rescans their fields until the
//! feed runs dry; completion sets the mature-collection flag and the cycle
//! is finished stop-the-world at the next safe point.
//!
//! The worklist and live list are shared so a young collection (under the
//! heap write lock) can rewrite moved entries and drop dead ones before the
//! from-space they point into is reused.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::barrier::WriteBarrier;
use crate::object::ObjectRef;
use crate::young::young_resolver;

/// Objects traced per heap read-lock acquisition.
const MARK_BATCH: usize = 256;

/// State machine of the concurrent cycle.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerState {
    /// No cycle in flight.
    Idle = 0,
    /// A root snapshot is queued for the marker thread.
    MarkRequested = 1,
    /// The marker is tracing.
    Marking = 2,
    /// Tracing finished; awaiting the stop-the-world finish.
    MarkComplete = 3,
    /// The finish is running census and sweeps.
    Sweeping = 4,
}

impl MarkerState {
    fn from_u8(v: u8) -> MarkerState {
        match v {
            0 => MarkerState::Idle,
            1 => MarkerState::MarkRequested,
            2 => MarkerState::Marking,
            3 => MarkerState::MarkComplete,
            _ => MarkerState::Sweeping,
        }
    }
}

struct MarkRequest {
    roots: Vec<ObjectRef>,
    sentinel: u32,
}

/// State shared between the marker thread and the coordinator.
pub struct MarkerShared {
    state: AtomicU8,
    request: Mutex<Option<MarkRequest>>,
    request_ready: Condvar,
    worklist: Mutex<VecDeque<ObjectRef>>,
    live: Mutex<Vec<ObjectRef>>,
    barrier: Arc<WriteBarrier>,
    heap_lock: Arc<RwLock<()>>,
    /// Set on completion so the next safe point runs the finish.
    collect_mature_now: Arc<AtomicBool>,
    shutdown: AtomicBool,
}

impl MarkerShared {
    pub fn new(
        barrier: Arc<WriteBarrier>,
        heap_lock: Arc<RwLock<()>>,
        collect_mature_now: Arc<AtomicBool>,
    ) -> MarkerShared {
        MarkerShared {
            state: AtomicU8::new(MarkerState::Idle as u8),
            request: Mutex::new(None),
            request_ready: Condvar::new(),
            worklist: Mutex::new(VecDeque::new()),
            live: Mutex::new(Vec::new()),
            barrier,
            heap_lock,
            collect_mature_now,
            shutdown: AtomicBool::new(false),
        }
    }

    /// Current cycle state.
    pub fn state(&self) -> MarkerState {
        MarkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: MarkerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Queue a cycle with the given root snapshot. A request while a cycle
    /// is already in flight coalesces into it; returns false in that case.
    /// The caller enables the barrier's mark feed before snapshotting roots.
    pub fn request_mark(&self, roots: Vec<ObjectRef>, sentinel: u32) -> bool {
        let mut request = self.request.lock();
        if self.state() != MarkerState::Idle {
            return false;
        }
        self.set_state(MarkerState::MarkRequested);
        *request = Some(MarkRequest { roots, sentinel });
        self.request_ready.notify_one();
        true
    }

    /// Repair shared marking state after a young collection moved objects.
    /// Called with the heap write lock held. Runs for every in-flight phase
    /// including MarkComplete, where the live list is parked awaiting the
    /// finish.
    pub fn fixup_after_young(&self) {
        if self.state() == MarkerState::Idle {
            return;
        }
        // Fed sources are re-fed at their new addresses; they still need a
        // field rescan, by the marker or by the stop-the-world finish.
        let fed: Vec<ObjectRef> = self
            .barrier
            .drain_mark_feed()
            .into_iter()
            .filter_map(young_resolver)
            .collect();
        self.barrier.refeed(fed);

        let mut worklist = self.worklist.lock();
        retain_resolved(&mut worklist);
        let mut live = self.live.lock();
        let mut index = 0;
        while index < live.len() {
            match young_resolver(live[index]) {
                Some(new) => {
                    live[index] = new;
                    index += 1;
                }
                None => {
                    live.swap_remove(index);
                }
            }
        }
        // A queued request's roots have already been fixed by the young
        // collector through the caller's root set, except promoted copies.
        if let Some(request) = self.request.lock().as_mut() {
            for slot in request.roots.iter_mut() {
                if let Some(new) = young_resolver(*slot) {
                    *slot = new;
                }
            }
            request.roots.retain(|slot| young_resolver(*slot).is_some());
        }
    }

    /// Take the traced live list at the stop-the-world finish.
    pub fn take_live(&self) -> Vec<ObjectRef> {
        std::mem::take(&mut *self.live.lock())
    }

    /// MarkComplete -> Sweeping, at the start of the finish.
    pub fn begin_sweep(&self) {
        debug_assert_eq!(self.state(), MarkerState::MarkComplete);
        self.set_state(MarkerState::Sweeping);
    }

    /// Sweeping -> Idle, once the finish is done.
    pub fn finish_cycle(&self) {
        self.set_state(MarkerState::Idle);
    }

    /// Ask the marker thread to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.request_ready.notify_all();
    }

    fn run(&self) {
        loop {
            let request = {
                let mut slot = self.request.lock();
                loop {
                    if self.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if let Some(request) = slot.take() {
                        break request;
                    }
                    self.request_ready.wait(&mut slot);
                }
            };
            self.set_state(MarkerState::Marking);
            debug!(
                target: "quill::gc",
                roots = request.roots.len(),
                "concurrent mark start"
            );
            self.worklist.lock().extend(request.roots);
            self.trace(request.sentinel);
            let live = self.live.lock().len();
            info!(target: "quill::gc", live, "concurrent mark complete");
            self.set_state(MarkerState::MarkComplete);
            self.collect_mature_now.store(true, Ordering::Release);
        }
    }

    fn trace(&self, sentinel: u32) {
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let mut drained_empty = false;
            {
                let _heap = self.heap_lock.read();
                let mut processed = 0;
                while processed < MARK_BATCH {
                    let Some(obj) = self.worklist.lock().pop_front() else {
                        break;
                    };
                    let obj = obj.chase_forwarding();
                    if obj.header().is_marked(sentinel) {
                        continue;
                    }
                    obj.header().set_mark(sentinel);
                    self.live.lock().push(obj);
                    let mut worklist = self.worklist.lock();
                    for index in 0..obj.header().field_count() {
                        if let Some(target) = obj.field(index) {
                            worklist.push_back(target);
                        }
                    }
                    processed += 1;
                }
                if self.worklist.lock().is_empty() {
                    // Rescan objects mutated since the last drain; the cycle
                    // ends when the mutators stop outrunning us.
                    let fed = self.barrier.drain_mark_feed();
                    drained_empty = fed.is_empty();
                    let mut worklist = self.worklist.lock();
                    for source in fed {
                        let source = source.chase_forwarding();
                        for index in 0..source.header().field_count() {
                            if let Some(target) = source.field(index) {
                                worklist.push_back(target);
                            }
                        }
                    }
                }
            }
            if drained_empty && self.worklist.lock().is_empty() {
                return;
            }
        }
    }
}

fn retain_resolved(worklist: &mut VecDeque<ObjectRef>) {
    let entries = std::mem::take(worklist);
    for entry in entries {
        if let Some(resolved) = young_resolver(entry) {
            worklist.push_back(resolved);
        }
    }
}

/// Spawn the marker thread over shared state.
pub fn spawn_marker_thread(shared: Arc<MarkerShared>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("quill-marker".into())
        .spawn(move || shared.run())
        .expect("marker thread spawns")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::object::{HEADER_SIZE, MARK_B, MARK_FRESH, Zone, init_object};

    fn make(buf: &[u64], fields: usize) -> ObjectRef {
        let size = (HEADER_SIZE + fields * 8) as u32;
        unsafe { init_object(buf.as_ptr() as usize, 0, 0, size, Zone::Mature, MARK_FRESH) }
    }

    fn wait_for(shared: &MarkerShared, state: MarkerState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while shared.state() != state {
            assert!(Instant::now() < deadline, "marker did not reach {state:?}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn marks_graph_and_completes() {
        let barrier = Arc::new(WriteBarrier::new());
        let heap_lock = Arc::new(RwLock::new(()));
        let flag = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(MarkerShared::new(
            Arc::clone(&barrier),
            heap_lock,
            Arc::clone(&flag),
        ));
        let thread = spawn_marker_thread(Arc::clone(&shared));

        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let c = vec![0u64; 16];
        let root = make(&a, 1);
        let child = make(&b, 0);
        let dead = make(&c, 0);
        root.set_field(0, Some(child));

        barrier.enable_mark_feed();
        assert!(shared.request_mark(vec![root], MARK_B));
        wait_for(&shared, MarkerState::MarkComplete);

        assert!(flag.load(Ordering::SeqCst));
        assert!(root.header().is_marked(MARK_B));
        assert!(child.header().is_marked(MARK_B));
        assert!(!dead.header().is_marked(MARK_B));

        shared.begin_sweep();
        let live = shared.take_live();
        assert_eq!(live.len(), 2);
        shared.finish_cycle();
        barrier.disable_mark_feed();

        shared.shutdown();
        thread.join().unwrap();
    }

    #[test]
    fn requests_coalesce_while_in_flight() {
        let barrier = Arc::new(WriteBarrier::new());
        let heap_lock = Arc::new(RwLock::new(()));
        let flag = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(MarkerShared::new(barrier, heap_lock, flag));

        let a = vec![0u64; 16];
        let root = make(&a, 0);
        // No thread running: the first request parks in MarkRequested.
        assert!(shared.request_mark(vec![root], MARK_B));
        assert!(!shared.request_mark(vec![root], MARK_B));
        assert_eq!(shared.state(), MarkerState::MarkRequested);
    }

    #[test]
    fn barrier_feed_reaches_late_stores() {
        let barrier = Arc::new(WriteBarrier::new());
        let heap_lock = Arc::new(RwLock::new(()));
        let flag = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(MarkerShared::new(
            Arc::clone(&barrier),
            Arc::clone(&heap_lock),
            flag,
        ));

        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let root = make(&a, 1);
        let hidden = make(&b, 0);

        // Store happens after the snapshot but before the marker drains.
        barrier.enable_mark_feed();
        shared.request_mark(vec![root], MARK_B);
        root.set_field(0, Some(hidden));
        barrier.record_store(root, Some(hidden));

        let thread = spawn_marker_thread(Arc::clone(&shared));
        wait_for(&shared, MarkerState::MarkComplete);
        assert!(hidden.header().is_marked(MARK_B));

        shared.shutdown();
        thread.join().unwrap();
    }
}
