//! The object memory coordinator.
//!
//! `ObjectMemory` owns every subsystem and routes allocation between the
//! generations: per-context slab first, slab refill under the allocation
//! lock, mature/large fallback, and finally an emergency full collection
//! before reporting exhaustion. Collections run at safe points: mutators
//! call [`ObjectMemory::collect_if_needed`] at their safe points, and the
//! caller of a collecting entry point is responsible for having quiesced
//! the other mutator threads. The concurrent marker synchronizes with
//! moving collectors through the heap read/write lock on its own.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashSet;
use tracing::{debug, info};

use crate::barrier::WriteBarrier;
use crate::code::{CodeManager, CodeResource};
use crate::config::MemoryConfig;
use crate::error::{LockStatus, MemoryError};
use crate::finalize::{FinalizerKind, FinalizerRegistry, spawn_finalizer_thread};
use crate::handles::{Handle, HandleTable};
use crate::headers::HeaderTable;
use crate::large::LargeObjectSpace;
use crate::marker::{MarkerShared, MarkerState, spawn_marker_thread};
use crate::mature::{MatureCollector, MatureSpace, mark_live, mature_resolver};
use crate::object::{
    FLAG_PINNED, FLAG_REMEMBERED, Forwarding, HEADER_SIZE, LOCK_FREE, LockWord, MARK_A,
    MARK_FRESH, ObjectRef, Zone, align_size, copy_object_bytes, decode_lock_word, init_object,
    lock_word_inline, rotate_mark,
};
use crate::slab::Slab;
use crate::young::{YoungCollector, YoungSpace, young_resolver};

const WORD: usize = std::mem::size_of::<usize>();

/// Per-thread mutator state: identity, allocation slab, and the root set
/// the thread exposes at safe points.
pub struct ExecutionContext {
    thread_id: u32,
    slab: Slab,
    /// Root slots; collectors rewrite them in place when objects move.
    pub roots: Vec<ObjectRef>,
    interrupt: Arc<AtomicBool>,
}

impl ExecutionContext {
    fn new(thread_id: u32) -> ExecutionContext {
        ExecutionContext {
            thread_id,
            slab: Slab::empty(),
            roots: Vec::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context id; doubles as the inline lock owner.
    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    /// Flag another thread can set to interrupt this context's lock waits.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }
}

/// Point-in-time diagnostics snapshot.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    pub young_used_bytes: usize,
    pub mature_used_bytes: usize,
    pub mature_regions: usize,
    pub large_used_bytes: usize,
    pub large_objects: usize,
    pub code_bytes: usize,
    pub objects_allocated: u64,
    pub young_collections: u64,
    pub mature_collections: u64,
    pub reclaimed_bytes: u64,
    /// Accumulated stop-the-world time across all pauses.
    pub total_pause_us: u64,
    pub live_handles: usize,
    pub pending_finalizers: usize,
}

/// RAII guard suppressing collections; allocation failures while one is
/// held surface immediately instead of triggering an emergency collection.
pub struct GcInhibit<'a> {
    memory: &'a ObjectMemory,
}

impl Drop for GcInhibit<'_> {
    fn drop(&mut self) {
        self.memory.inhibit_depth.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The object memory manager.
pub struct ObjectMemory {
    config: MemoryConfig,
    young: YoungSpace,
    mature: MatureSpace,
    large: LargeObjectSpace,
    barrier: Arc<WriteBarrier>,
    headers: HeaderTable,
    handles: HandleTable,
    finalizers: Arc<FinalizerRegistry>,
    code: CodeManager,

    /// Serializes slab refill and mature/large fallback allocation.
    allocation_lock: Mutex<()>,
    /// Read by marker batches, written by moving collectors.
    heap_lock: Arc<RwLock<()>>,
    /// Current live mark sentinel.
    mark: AtomicU32,
    collect_young_now: AtomicBool,
    collect_mature_now: Arc<AtomicBool>,
    inhibit_depth: AtomicUsize,
    next_thread_id: AtomicU32,

    marker: Option<Arc<MarkerShared>>,
    marker_thread: Mutex<Option<JoinHandle<()>>>,
    finalizer_thread: Mutex<Option<JoinHandle<()>>>,

    objects_allocated: CachePadded<AtomicU64>,
    young_collections: CachePadded<AtomicU64>,
    mature_collections: CachePadded<AtomicU64>,
    reclaimed_bytes: CachePadded<AtomicU64>,
    total_pause_us: CachePadded<AtomicU64>,
}

impl ObjectMemory {
    pub fn new(config: MemoryConfig) -> ObjectMemory {
        let barrier = Arc::new(WriteBarrier::new());
        let heap_lock = Arc::new(RwLock::new(()));
        let collect_mature_now = Arc::new(AtomicBool::new(false));
        let finalizers = Arc::new(FinalizerRegistry::new());
        let finalizer_thread = spawn_finalizer_thread(Arc::clone(&finalizers));

        let (marker, marker_thread) = if config.concurrent_mark {
            let shared = Arc::new(MarkerShared::new(
                Arc::clone(&barrier),
                Arc::clone(&heap_lock),
                Arc::clone(&collect_mature_now),
            ));
            let thread = spawn_marker_thread(Arc::clone(&shared));
            (Some(shared), Some(thread))
        } else {
            (None, None)
        };

        ObjectMemory {
            young: YoungSpace::new(config.young_size),
            mature: MatureSpace::new(config.region_size, config.max_regions),
            large: LargeObjectSpace::new(),
            barrier,
            headers: HeaderTable::new(),
            handles: HandleTable::new(),
            finalizers,
            code: CodeManager::new(),
            allocation_lock: Mutex::new(()),
            heap_lock,
            mark: AtomicU32::new(MARK_A),
            collect_young_now: AtomicBool::new(false),
            collect_mature_now,
            inhibit_depth: AtomicUsize::new(0),
            next_thread_id: AtomicU32::new(1),
            marker,
            marker_thread: Mutex::new(marker_thread),
            finalizer_thread: Mutex::new(Some(finalizer_thread)),
            objects_allocated: CachePadded::new(AtomicU64::new(0)),
            young_collections: CachePadded::new(AtomicU64::new(0)),
            mature_collections: CachePadded::new(AtomicU64::new(0)),
            reclaimed_bytes: CachePadded::new(AtomicU64::new(0)),
            total_pause_us: CachePadded::new(AtomicU64::new(0)),
            config,
        }
    }

    /// Create a mutator context with a fresh thread id and an empty slab.
    pub fn new_context(&self) -> ExecutionContext {
        ExecutionContext::new(self.next_thread_id.fetch_add(1, Ordering::AcqRel))
    }

    // ---- allocation ----

    /// Allocate an object with `field_count` reference slots. Young by
    /// default; objects over the large threshold go straight to the large
    /// object space. A transient full heap triggers one emergency full
    /// collection before the request fails.
    pub fn allocate(
        &self,
        ctx: &mut ExecutionContext,
        class_id: u32,
        tag: u16,
        field_count: usize,
    ) -> Result<ObjectRef, MemoryError> {
        let total = align_size(HEADER_SIZE + field_count * WORD);
        if let Some(obj) = self.try_allocate(ctx, class_id, tag, total) {
            self.objects_allocated.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }
        if self.gc_inhibited() {
            return Err(MemoryError::Exhausted { requested: total });
        }
        debug!(target: "quill::gc", requested = total, "emergency full collection");
        self.collect_full(ctx);
        match self.try_allocate(ctx, class_id, tag, total) {
            Some(obj) => {
                self.objects_allocated.fetch_add(1, Ordering::Relaxed);
                Ok(obj)
            }
            None => Err(MemoryError::Exhausted { requested: total }),
        }
    }

    /// Allocate an object that will never move: large-threshold sizes go to
    /// the large object space, everything else lands in the mature
    /// generation, pinned. The slab is never used.
    pub fn allocate_pinned(
        &self,
        ctx: &mut ExecutionContext,
        class_id: u32,
        tag: u16,
        field_count: usize,
    ) -> Result<ObjectRef, MemoryError> {
        let total = align_size(HEADER_SIZE + field_count * WORD);
        let attempt = |memory: &Self| -> Option<ObjectRef> {
            let _alloc = memory.allocation_lock.lock();
            let obj = if total >= memory.config.large_object_threshold {
                memory
                    .large
                    .allocate(class_id, tag, total, memory.allocation_mark())?
            } else {
                let addr = memory.mature.allocate_raw(total)?;
                // SAFETY: addr is a fresh mature allocation of `total` bytes.
                unsafe {
                    init_object(
                        addr,
                        class_id,
                        tag,
                        total as u32,
                        Zone::Mature,
                        memory.allocation_mark(),
                    )
                }
            };
            obj.header().set_flag(FLAG_PINNED);
            Some(obj)
        };
        if let Some(obj) = attempt(self) {
            self.objects_allocated.fetch_add(1, Ordering::Relaxed);
            return Ok(obj);
        }
        if self.gc_inhibited() {
            return Err(MemoryError::Exhausted { requested: total });
        }
        self.collect_full(ctx);
        match attempt(self) {
            Some(obj) => {
                self.objects_allocated.fetch_add(1, Ordering::Relaxed);
                Ok(obj)
            }
            None => Err(MemoryError::Exhausted { requested: total }),
        }
    }

    fn try_allocate(
        &self,
        ctx: &mut ExecutionContext,
        class_id: u32,
        tag: u16,
        total: usize,
    ) -> Option<ObjectRef> {
        if total >= self.config.large_object_threshold {
            let _alloc = self.allocation_lock.lock();
            return self
                .large
                .allocate(class_id, tag, total, self.allocation_mark());
        }

        // Lock-free fast path.
        if let Some(addr) = ctx.slab.allocate(total, self.young.epoch()) {
            // SAFETY: slab memory is fresh young space.
            return Some(unsafe {
                init_object(addr, class_id, tag, total as u32, Zone::Young, MARK_FRESH)
            });
        }

        let _alloc = self.allocation_lock.lock();
        // The slab may have gone stale rather than full while we waited.
        let epoch = self.young.epoch();
        if let Some(addr) = ctx.slab.allocate(total, epoch) {
            // SAFETY: as above.
            return Some(unsafe {
                init_object(addr, class_id, tag, total as u32, Zone::Young, MARK_FRESH)
            });
        }
        let slab_size = self.config.slab_size.max(total);
        if let Some(slab) = self.young.alloc_slab(slab_size) {
            ctx.slab = slab;
            let addr = ctx
                .slab
                .allocate(total, epoch)
                .expect("fresh slab fits its first allocation");
            // SAFETY: as above.
            return Some(unsafe {
                init_object(addr, class_id, tag, total as u32, Zone::Young, MARK_FRESH)
            });
        }

        // Young generation is full: flag a collection for the next safe
        // point and fall back to the mature generation for now.
        self.collect_young_now.store(true, Ordering::Release);
        let addr = self.mature.allocate_raw(total)?;
        // SAFETY: as above, in mature space.
        Some(unsafe {
            init_object(
                addr,
                class_id,
                tag,
                total as u32,
                Zone::Mature,
                self.allocation_mark(),
            )
        })
    }

    /// Mark word for objects allocated directly in mature/large space.
    /// Black during an in-flight concurrent cycle so the sweep keeps them.
    fn allocation_mark(&self) -> u32 {
        match &self.marker {
            Some(marker) if marker.state() != MarkerState::Idle => {
                self.mark.load(Ordering::Acquire)
            }
            _ => MARK_FRESH,
        }
    }

    // ---- mutation ----

    /// Store `target` into `source.fields[index]` and run the write barrier.
    /// All reference stores go through here.
    pub fn write_ref(&self, source: ObjectRef, index: usize, target: Option<ObjectRef>) {
        source.set_field(index, target);
        self.barrier.record_store(source, target);
    }

    /// Move a young object into the mature generation immediately. The
    /// returned reference replaces the caller's; other references resolve
    /// through the forwarding left behind at the next young collection.
    pub fn promote(&self, obj: ObjectRef) -> Result<ObjectRef, MemoryError> {
        if obj.header().zone() != Zone::Young {
            return Ok(obj);
        }
        let _heap = self.heap_lock.write();
        let _alloc = self.allocation_lock.lock();
        if let Forwarding::Forwarded(new) = obj.header().forwarding() {
            return Ok(new);
        }
        let size = obj.header().size() as usize;
        let addr = self
            .mature
            .allocate_raw(size)
            .ok_or(MemoryError::Exhausted { requested: size })?;
        // SAFETY: addr is a fresh mature allocation of `size` bytes.
        unsafe { copy_object_bytes(obj, addr) };
        let new = ObjectRef::from_addr(addr);
        new.header().set_zone(Zone::Mature);
        new.header().set_mark(self.mark.load(Ordering::Acquire));
        obj.header().forward_to(new);

        let points_young = (0..new.header().field_count())
            .filter_map(|index| new.field(index))
            .any(|target| target.header().zone() == Zone::Young);
        if points_young {
            self.barrier.remember(new);
        }
        Ok(new)
    }

    // ---- collection ----

    /// Safe-point hook: consume the one-shot flags and run whatever
    /// collection work is due.
    pub fn collect_if_needed(&self, ctx: &mut ExecutionContext) {
        if self.gc_inhibited() {
            return;
        }
        if self.collect_young_now.swap(false, Ordering::AcqRel) {
            self.collect_young(ctx);
        }
        if self.collect_mature_now.swap(false, Ordering::AcqRel) {
            match &self.marker {
                Some(marker) => match marker.state() {
                    MarkerState::MarkComplete => self.finish_concurrent_mature(ctx),
                    MarkerState::Idle => self.start_concurrent_mark(ctx),
                    // Already in flight; the request coalesces.
                    _ => {}
                },
                None => self.collect_mature(ctx),
            }
        }
    }

    /// Flag a young collection for the next safe point.
    pub fn request_young_collection(&self) {
        self.collect_young_now.store(true, Ordering::Release);
    }

    /// Flag a mature collection for the next safe point.
    pub fn request_mature_collection(&self) {
        self.collect_mature_now.store(true, Ordering::Release);
    }

    /// Suppress collections until the guard drops.
    pub fn inhibit_gc(&self) -> GcInhibit<'_> {
        self.inhibit_depth.fetch_add(1, Ordering::AcqRel);
        GcInhibit { memory: self }
    }

    fn gc_inhibited(&self) -> bool {
        self.inhibit_depth.load(Ordering::Acquire) > 0
    }

    /// Run a young collection now. Other mutators must be at safe points.
    pub fn collect_young(&self, ctx: &mut ExecutionContext) {
        let started = Instant::now();
        let _heap = self.heap_lock.write();
        let _alloc = self.allocation_lock.lock();
        self.collect_young_now.store(false, Ordering::Release);

        let root_count = ctx.roots.len();
        let mut roots = std::mem::take(&mut ctx.roots);
        roots.extend(self.handles.global_roots());

        let collector = YoungCollector {
            young: &self.young,
            mature: &self.mature,
            barrier: &self.barrier,
            mark: self.mark.load(Ordering::Acquire),
            promote_age: self.config.promote_age,
        };
        let outcome = collector.collect(&mut roots);
        roots.truncate(root_count);
        ctx.roots = roots;

        self.handles.update_globals(young_resolver);
        self.handles.validate(young_resolver);
        self.finalizers.sweep(young_resolver);
        self.headers.sweep(young_resolver);
        self.code.sweep(young_resolver);
        if let Some(marker) = &self.marker {
            marker.fixup_after_young();
        }

        // The sentinel rotates at young-cycle end unless a mature cycle is
        // in flight with the current one.
        let mature_in_flight = self
            .marker
            .as_ref()
            .is_some_and(|m| m.state() != MarkerState::Idle);
        if !mature_in_flight {
            let mark = self.mark.load(Ordering::Acquire);
            self.mark.store(rotate_mark(mark), Ordering::Release);
        }
        if outcome.mature_pressure {
            self.collect_mature_now.store(true, Ordering::Release);
        }

        self.young_collections.fetch_add(1, Ordering::Relaxed);
        self.reclaimed_bytes
            .fetch_add(outcome.reclaimed_bytes as u64, Ordering::Relaxed);
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.total_pause_us.fetch_add(elapsed_us, Ordering::Relaxed);
        info!(target: "quill::gc", elapsed_us, "young pause");
    }

    /// Run a synchronous stop-the-world mature collection now.
    pub fn collect_mature(&self, ctx: &mut ExecutionContext) {
        let started = Instant::now();
        let _heap = self.heap_lock.write();
        let _alloc = self.allocation_lock.lock();
        self.collect_mature_now.store(false, Ordering::Release);

        let sentinel = rotate_mark(self.mark.load(Ordering::Acquire));
        self.mark.store(sentinel, Ordering::Release);

        let root_count = ctx.roots.len();
        let mut roots = std::mem::take(&mut ctx.roots);
        roots.extend(self.handles.global_roots());

        let mut live = mark_live(&roots, sentinel);
        self.mature_epilogue(sentinel, &mut live, &mut roots);

        roots.truncate(root_count);
        ctx.roots = roots;
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.total_pause_us.fetch_add(elapsed_us, Ordering::Relaxed);
        info!(target: "quill::gc", elapsed_us, "mature pause");
    }

    fn start_concurrent_mark(&self, ctx: &ExecutionContext) {
        let marker = self
            .marker
            .as_ref()
            .expect("concurrent mark requires the marker thread");
        let sentinel = rotate_mark(self.mark.load(Ordering::Acquire));
        self.mark.store(sentinel, Ordering::Release);
        self.barrier.enable_mark_feed();

        let mut roots = ctx.roots.clone();
        roots.extend(self.handles.global_roots());
        if !marker.request_mark(roots, sentinel) {
            // Lost a race with another requester; keep their sentinel.
            self.mark.store(rotate_mark(sentinel), Ordering::Release);
            self.barrier.disable_mark_feed();
        }
    }

    /// Stop-the-world finish of a concurrent cycle: final root and barrier
    /// rescan, then the shared census/sweep tail.
    fn finish_concurrent_mature(&self, ctx: &mut ExecutionContext) {
        let started = Instant::now();
        let marker = self
            .marker
            .as_ref()
            .expect("concurrent finish requires the marker thread");
        let _heap = self.heap_lock.write();
        let _alloc = self.allocation_lock.lock();
        marker.begin_sweep();

        let sentinel = self.mark.load(Ordering::Acquire);
        let mut live = marker.take_live();

        let root_count = ctx.roots.len();
        let mut roots = std::mem::take(&mut ctx.roots);
        roots.extend(self.handles.global_roots());
        live.extend(mark_live(&roots, sentinel));

        for source in self.barrier.drain_mark_feed() {
            let source = source.chase_forwarding();
            let targets: Vec<ObjectRef> = (0..source.header().field_count())
                .filter_map(|index| source.field(index))
                .collect();
            live.extend(mark_live(&targets, sentinel));
        }
        self.barrier.disable_mark_feed();

        // Mature and large allocations made black during the cycle carry
        // the sentinel but never passed through the trace. Fold them in so
        // the census counts them and the fixup pass rewrites their fields.
        let mut seen: FxHashSet<usize> = live.iter().map(|obj| obj.addr()).collect();
        self.mature.for_each_marked(sentinel, |obj| {
            if seen.insert(obj.addr()) {
                live.push(obj);
            }
        });
        self.large.for_each_marked(sentinel, |obj| {
            if seen.insert(obj.addr()) {
                live.push(obj);
            }
        });

        self.mature_epilogue(sentinel, &mut live, &mut roots);
        marker.finish_cycle();

        roots.truncate(root_count);
        ctx.roots = roots;
        let elapsed_us = started.elapsed().as_micros() as u64;
        self.total_pause_us.fetch_add(elapsed_us, Ordering::Relaxed);
        info!(target: "quill::gc", elapsed_us, "mature finish pause");
    }

    /// Census, evacuation, table sweeps and region recycling over a marked
    /// heap. Region memory is only recycled after every table has been
    /// resolved through the forwarding it may still need.
    fn mature_epilogue(
        &self,
        sentinel: u32,
        live: &mut Vec<ObjectRef>,
        roots: &mut Vec<ObjectRef>,
    ) {
        let collector = MatureCollector {
            mature: &self.mature,
            evacuate_occupancy: self.config.evacuate_occupancy,
        };
        let outcome = collector.collect(live, roots);

        let resolve = mature_resolver(sentinel);
        self.handles.update_globals(&resolve);
        self.handles.validate(&resolve);
        self.finalizers.sweep(&resolve);
        self.headers.sweep(&resolve);
        self.code.sweep(&resolve);
        self.sweep_remembered(&resolve);
        let freed_large = self.large.sweep(sentinel);
        self.mature.recycle(outcome.recyclable);

        self.mature_collections.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "quill::gc",
            evacuated = outcome.evacuated,
            freed_large,
            live_bytes = outcome.live_bytes,
            "mature cycle swept"
        );
    }

    /// Re-record remembered sources that survived, at their new addresses;
    /// dead sources drop out.
    fn sweep_remembered<F>(&self, resolve: &F)
    where
        F: Fn(ObjectRef) -> Option<ObjectRef>,
    {
        for source in self.barrier.take_remembered() {
            if let Some(new) = resolve(source) {
                new.header().clear_flag(FLAG_REMEMBERED);
                self.barrier.remember(new);
            }
        }
    }

    /// Emergency path for an allocation no generation can satisfy: a young
    /// collection followed by a completed mature cycle, using the calling
    /// context's roots.
    fn collect_full(&self, ctx: &mut ExecutionContext) {
        self.collect_young(ctx);
        let Some(marker) = &self.marker else {
            self.collect_mature(ctx);
            return;
        };
        let mut other_finished = false;
        loop {
            match marker.state() {
                MarkerState::Idle => {
                    if !other_finished {
                        self.collect_mature(ctx);
                    }
                    return;
                }
                MarkerState::MarkComplete => {
                    self.collect_mature_now.store(false, Ordering::Release);
                    self.finish_concurrent_mature(ctx);
                    return;
                }
                MarkerState::Sweeping => {
                    other_finished = true;
                    std::thread::sleep(Duration::from_millis(1));
                }
                MarkerState::MarkRequested | MarkerState::Marking => {
                    std::thread::sleep(Duration::from_millis(1));
                }
            }
        }
    }

    // ---- identity, locking, handles, finalization, code ----

    /// Identity id, assigned on first request; stable across moves.
    pub fn object_id(&self, obj: ObjectRef) -> u64 {
        self.headers.inflate_for_id(obj)
    }

    /// Acquire `obj`'s lock for `ctx`. Inline CAS when uncontended;
    /// contention inflates the header and parks the context.
    pub fn lock_object(
        &self,
        ctx: &ExecutionContext,
        obj: ObjectRef,
        timeout: Option<Duration>,
    ) -> LockStatus {
        let tid = ctx.thread_id;
        loop {
            let word = obj.header().lock_word();
            match decode_lock_word(word) {
                LockWord::Free => {
                    if obj.header().lock_cas(word, lock_word_inline(tid, 1)) {
                        return LockStatus::Acquired;
                    }
                }
                LockWord::Inline { owner, count } if owner == tid => {
                    if count == u16::MAX {
                        let record = self.headers.inflate(obj);
                        return record.lock(tid, timeout, &ctx.interrupt);
                    }
                    if obj.header().lock_cas(word, lock_word_inline(tid, count + 1)) {
                        return LockStatus::Acquired;
                    }
                }
                LockWord::Inline { .. } => {
                    let record = self.headers.inflate(obj);
                    return record.lock(tid, timeout, &ctx.interrupt);
                }
                LockWord::Inflated(index) => {
                    return self.headers.record(index).lock(tid, timeout, &ctx.interrupt);
                }
            }
        }
    }

    /// Release one recursion level of `obj`'s lock. False when `ctx` does
    /// not own it.
    pub fn unlock_object(&self, ctx: &ExecutionContext, obj: ObjectRef) -> bool {
        let tid = ctx.thread_id;
        loop {
            let word = obj.header().lock_word();
            match decode_lock_word(word) {
                LockWord::Free => return false,
                LockWord::Inline { owner, count } if owner == tid => {
                    let new = if count > 1 {
                        lock_word_inline(tid, count - 1)
                    } else {
                        LOCK_FREE
                    };
                    if obj.header().lock_cas(word, new) {
                        return true;
                    }
                }
                LockWord::Inline { .. } => return false,
                LockWord::Inflated(index) => {
                    return self.headers.record(index).unlock(tid);
                }
            }
        }
    }

    /// Create a native handle for `obj`. The target is pinned while any
    /// handle is attached: a young target promotes at the next young
    /// collection instead of being copied, and its region is never
    /// evacuated. Pair each handle with a [`Self::release_handle`].
    pub fn create_handle(&self, obj: ObjectRef) -> Arc<Handle> {
        self.headers.attach_handle(obj);
        self.handles.create(obj)
    }

    /// Release a native handle. When the last handle attached to the
    /// target goes away the target is unpinned and movable again.
    pub fn release_handle(&self, handle: Arc<Handle>) {
        if let Ok(target) = handle.get() {
            let record = self.headers.inflate(target);
            self.headers.release_handle(&record);
        }
    }

    /// Register a handle as a global location; its target becomes a root.
    pub fn register_global_handle(&self, handle: Arc<Handle>) {
        self.handles.register_global(handle);
    }

    /// Remove a global handle registration.
    pub fn unregister_global_handle(&self, handle: &Arc<Handle>) {
        self.handles.unregister_global(handle);
    }

    /// Register finalization interest; the callback runs on the finalizer
    /// thread after a collection finds `obj` unreachable. Returns false if
    /// the object already has a finalizer.
    pub fn needs_finalization(
        &self,
        obj: ObjectRef,
        kind: FinalizerKind,
        callback: Box<dyn FnOnce() + Send>,
    ) -> bool {
        self.finalizers.register(obj, kind, callback)
    }

    /// Tie a code resource's lifetime to `owner`.
    pub fn add_code_resource(&self, resource: Box<dyn CodeResource>, owner: ObjectRef) {
        self.code.add_resource(resource, owner);
    }

    // ---- diagnostics ----

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            young_used_bytes: self.young.used_bytes(),
            mature_used_bytes: self.mature.used_bytes(),
            mature_regions: self.mature.region_count(),
            large_used_bytes: self.large.used_bytes(),
            large_objects: self.large.object_count(),
            code_bytes: self.code.resource_bytes(),
            objects_allocated: self.objects_allocated.load(Ordering::Relaxed),
            young_collections: self.young_collections.load(Ordering::Relaxed),
            mature_collections: self.mature_collections.load(Ordering::Relaxed),
            reclaimed_bytes: self.reclaimed_bytes.load(Ordering::Relaxed),
            total_pause_us: self.total_pause_us.load(Ordering::Relaxed),
            live_handles: self.handles.live_handles(),
            pending_finalizers: self.finalizers.pending_count(),
        }
    }

    /// Current live mark sentinel (diagnostics).
    pub fn current_mark(&self) -> u32 {
        self.mark.load(Ordering::Acquire)
    }
}

impl Drop for ObjectMemory {
    fn drop(&mut self) {
        self.finalizers.shutdown();
        if let Some(thread) = self.finalizer_thread.lock().take() {
            let _ = thread.join();
        }
        if let Some(marker) = &self.marker {
            marker.shutdown();
        }
        if let Some(thread) = self.marker_thread.lock().take() {
            let _ = thread.join();
        }
    }
}
