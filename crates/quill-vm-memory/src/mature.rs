//! Mature generation: fixed-size regions with mark, census and evacuation.
//!
//! Allocation bumps through the open (newest) region and opens another when
//! it fills, up to `max_regions`. A collection marks the reachable graph
//! with the freshly rotated sentinel, takes a per-region census of live
//! bytes, evacuates sparse regions (copying their live objects out and
//! leaving forwarding behind), and recycles vacated and fully dead regions.
//! Dense regions are swept in place; holes inside them are not reused, the
//! region is reclaimed whole once its occupancy drops.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::object::{FLAG_PINNED, ObjectRef, Zone, align_size, copy_object_bytes};
use crate::space::Space;

/// One mature region.
pub struct Region {
    space: Space,
    /// Live bytes counted by the most recent census.
    live_bytes: AtomicUsize,
    /// A pinned object was seen here in the most recent census.
    has_pinned: AtomicBool,
}

impl Region {
    fn new(size: usize) -> Region {
        Region {
            space: Space::new(size),
            live_bytes: AtomicUsize::new(0),
            has_pinned: AtomicBool::new(false),
        }
    }
}

/// Region-based mature space.
pub struct MatureSpace {
    region_size: usize,
    max_regions: usize,
    /// Regions in allocation order; the last one is the open region.
    regions: Mutex<Vec<Arc<Region>>>,
    /// Recycled regions ready for reuse.
    free: Mutex<Vec<Arc<Region>>>,
}

impl MatureSpace {
    pub fn new(region_size: usize, max_regions: usize) -> MatureSpace {
        MatureSpace {
            region_size,
            max_regions,
            regions: Mutex::new(Vec::new()),
            free: Mutex::new(Vec::new()),
        }
    }

    /// Bump-allocate `size` raw bytes; the caller initializes the header.
    /// `None` when every region is full and the region cap is reached.
    pub fn allocate_raw(&self, size: usize) -> Option<usize> {
        self.allocate_raw_capped(size, self.max_regions)
    }

    /// Allocation that may open a region past the cap, for pinned
    /// promotions that must not fall back to a moving space.
    pub fn allocate_raw_over_cap(&self, size: usize) -> usize {
        self.allocate_raw_capped(size, usize::MAX)
            .expect("an uncapped mature allocation always finds a region")
    }

    fn allocate_raw_capped(&self, size: usize, max_regions: usize) -> Option<usize> {
        debug_assert!(size <= self.region_size);
        let mut regions = self.regions.lock();
        if let Some(open) = regions.last() {
            if let Some(addr) = open.space.allocate(size) {
                return Some(addr);
            }
        }
        let region = match self.free.lock().pop() {
            Some(region) => region,
            None => {
                if regions.len() >= max_regions {
                    return None;
                }
                Arc::new(Region::new(self.region_size))
            }
        };
        let addr = region
            .space
            .allocate(size)
            .expect("fresh region fits any sub-region allocation");
        regions.push(region);
        Some(addr)
    }

    /// True if `addr` lies in any live region.
    pub fn contains(&self, addr: usize) -> bool {
        self.regions
            .lock()
            .iter()
            .any(|region| region.space.contains(addr))
    }

    /// Number of live (non-free) regions.
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }

    /// Bytes bump-allocated across live regions (holes included).
    pub fn used_bytes(&self) -> usize {
        self.regions.lock().iter().map(|r| r.space.used()).sum()
    }

    /// Return regions to the free pool, wiping their contents. Must only be
    /// called after every reference into them has been rewritten.
    pub fn recycle(&self, recyclable: Vec<Arc<Region>>) {
        if recyclable.is_empty() {
            return;
        }
        let mut regions = self.regions.lock();
        regions.retain(|region| !recyclable.iter().any(|r| Arc::ptr_eq(r, region)));
        let mut free = self.free.lock();
        for region in recyclable {
            region.space.reset();
            region.live_bytes.store(0, Ordering::Release);
            region.has_pinned.store(false, Ordering::Release);
            free.push(region);
        }
        // Regions opened past the cap are dropped instead of pooled.
        let pool_room = self.max_regions.saturating_sub(regions.len());
        free.truncate(pool_room);
    }

    /// Visit every object carrying `sentinel`, by walking each region's
    /// bump sequence. Reaches objects that entered the generation already
    /// marked and so never passed through a trace.
    pub fn for_each_marked(&self, sentinel: u32, mut visit: impl FnMut(ObjectRef)) {
        for region in self.regions.lock().iter() {
            let end = region.space.cursor();
            let mut addr = region.space.start();
            while addr < end {
                let obj = ObjectRef::from_addr(addr);
                let size = obj.header().size() as usize;
                if obj.header().is_marked(sentinel) {
                    visit(obj);
                }
                addr += align_size(size);
            }
        }
    }
}

/// Trace the full object graph from `roots`, stamping every reached header
/// with `sentinel`. Returns the live objects in visit order. The mutators
/// are stopped; the rotated sentinel doubles as the visited test.
pub fn mark_live(roots: &[ObjectRef], sentinel: u32) -> Vec<ObjectRef> {
    let mut live = Vec::new();
    let mut worklist: VecDeque<ObjectRef> = VecDeque::new();
    for &root in roots {
        worklist.push_back(root.chase_forwarding());
    }
    while let Some(obj) = worklist.pop_front() {
        if obj.header().is_marked(sentinel) {
            continue;
        }
        obj.header().set_mark(sentinel);
        live.push(obj);
        for index in 0..obj.header().field_count() {
            if let Some(target) = obj.field(index) {
                worklist.push_back(target.chase_forwarding());
            }
        }
    }
    live
}

/// Result of the census/evacuation phase.
pub struct MatureOutcome {
    /// Objects copied out of sparse regions.
    pub evacuated: usize,
    /// Regions eligible for recycling once side tables are fixed up. The
    /// caller hands them back via [`MatureSpace::recycle`]; their forwarding
    /// words must stay readable until then.
    pub recyclable: Vec<Arc<Region>>,
    /// Live bytes in the mature generation after the cycle.
    pub live_bytes: usize,
}

/// Census, evacuation and fixup over a marked heap.
pub struct MatureCollector<'a> {
    pub mature: &'a MatureSpace,
    /// Fraction below which a region is evacuated rather than kept.
    pub evacuate_occupancy: f64,
}

impl<'a> MatureCollector<'a> {
    /// Run census and evacuation over `live` (the output of [`mark_live`]),
    /// then rewrite every live object's fields and the `roots` slots
    /// through forwarding. `live` entries are updated to final addresses.
    pub fn collect(&self, live: &mut [ObjectRef], roots: &mut [ObjectRef]) -> MatureOutcome {
        let regions: Vec<Arc<Region>> = self.mature.regions.lock().clone();
        debug!(
            target: "quill::gc",
            regions = regions.len(),
            live = live.len(),
            "mature census start"
        );

        // Sorted region intervals; live objects bin by binary search.
        let mut intervals: Vec<(usize, usize, usize)> = regions
            .iter()
            .enumerate()
            .map(|(index, region)| (region.space.start(), region.space.end(), index))
            .collect();
        intervals.sort_unstable_by_key(|&(start, _, _)| start);

        for region in &regions {
            region.live_bytes.store(0, Ordering::Release);
            region.has_pinned.store(false, Ordering::Release);
        }
        let mut mature_live_bytes = 0usize;
        for &obj in live.iter() {
            if obj.header().zone() != Zone::Mature {
                continue;
            }
            let Some(region) = find_region(&intervals, &regions, obj.addr()) else {
                continue;
            };
            let size = obj.header().size() as usize;
            region.live_bytes.fetch_add(size, Ordering::AcqRel);
            mature_live_bytes += size;
            if obj.header().flag(FLAG_PINNED) {
                region.has_pinned.store(true, Ordering::Release);
            }
        }

        // Pick victims: sparse, unpinned, not the open region. Fully dead
        // closed regions are recyclable without any copying.
        let open = regions.len().saturating_sub(1);
        let mut evacuating = vec![false; regions.len()];
        let mut recyclable_flag = vec![false; regions.len()];
        for (index, region) in regions.iter().enumerate() {
            if index == open {
                continue;
            }
            let live_bytes = region.live_bytes.load(Ordering::Acquire);
            if live_bytes == 0 {
                recyclable_flag[index] = true;
                continue;
            }
            let occupancy = live_bytes as f64 / self.mature.region_size as f64;
            if occupancy < self.evacuate_occupancy
                && !region.has_pinned.load(Ordering::Acquire)
            {
                evacuating[index] = true;
                recyclable_flag[index] = true;
            }
        }

        // Copy live objects out of victim regions. If the heap runs out of
        // room mid-region, the remainder stays put and the region survives.
        let mut evacuated = 0usize;
        for obj in live.iter() {
            if obj.header().zone() != Zone::Mature {
                continue;
            }
            let Some(index) = find_region_index(&intervals, obj.addr()) else {
                continue;
            };
            if !evacuating[index] {
                continue;
            }
            let size = obj.header().size() as usize;
            match self.mature.allocate_raw(size) {
                Some(addr) => {
                    // SAFETY: addr is a fresh mature allocation of `size`
                    // bytes outside every victim region.
                    unsafe { copy_object_bytes(*obj, addr) };
                    obj.header().forward_to(ObjectRef::from_addr(addr));
                    evacuated += 1;
                }
                None => {
                    evacuating[index] = false;
                    recyclable_flag[index] = false;
                }
            }
        }

        // Fixup: every live object's fields, the live list itself, and the
        // caller's roots chase forwarding to final addresses.
        for slot in live.iter_mut() {
            *slot = slot.chase_forwarding();
        }
        for obj in live.iter() {
            for index in 0..obj.header().field_count() {
                if let Some(target) = obj.field(index) {
                    let resolved = target.chase_forwarding();
                    if resolved != target {
                        obj.set_field(index, Some(resolved));
                    }
                }
            }
        }
        for slot in roots.iter_mut() {
            *slot = slot.chase_forwarding();
        }

        let recyclable: Vec<Arc<Region>> = regions
            .iter()
            .enumerate()
            .filter(|&(index, _)| recyclable_flag[index])
            .map(|(_, region)| Arc::clone(region))
            .collect();

        info!(
            target: "quill::gc",
            evacuated,
            recyclable = recyclable.len(),
            live_bytes = mature_live_bytes,
            "mature census done"
        );
        MatureOutcome {
            evacuated,
            recyclable,
            live_bytes: mature_live_bytes,
        }
    }
}

fn find_region_index(intervals: &[(usize, usize, usize)], addr: usize) -> Option<usize> {
    let pos = intervals.partition_point(|&(start, _, _)| start <= addr);
    if pos == 0 {
        return None;
    }
    let (start, end, index) = intervals[pos - 1];
    (addr >= start && addr < end).then_some(index)
}

fn find_region<'a>(
    intervals: &[(usize, usize, usize)],
    regions: &'a [Arc<Region>],
    addr: usize,
) -> Option<&'a Arc<Region>> {
    find_region_index(intervals, addr).map(|index| &regions[index])
}

/// Resolver for side tables after a mature cycle: mature/large objects live
/// only if they carry `sentinel`; young objects are never judged here (the
/// young collector owns their liveness) and map through forwarding.
pub fn mature_resolver(sentinel: u32) -> impl Fn(ObjectRef) -> Option<ObjectRef> {
    move |obj| {
        let obj = obj.chase_forwarding();
        match obj.header().zone() {
            Zone::Young => Some(obj),
            Zone::Mature | Zone::Large => obj.header().is_marked(sentinel).then_some(obj),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HEADER_SIZE, MARK_A, MARK_B, MARK_FRESH, init_object};

    const REGION: usize = 4096;

    fn alloc(mature: &MatureSpace, fields: usize) -> ObjectRef {
        let size = (HEADER_SIZE + fields * 8) as u32;
        let addr = mature.allocate_raw(size as usize).unwrap();
        unsafe { init_object(addr, 0, 0, size, Zone::Mature, MARK_FRESH) }
    }

    #[test]
    fn allocation_opens_regions_up_to_cap() {
        let mature = MatureSpace::new(REGION, 2);
        assert!(mature.allocate_raw(REGION).is_some());
        assert!(mature.allocate_raw(REGION).is_some());
        assert!(mature.allocate_raw(8).is_none());
        assert_eq!(mature.region_count(), 2);
    }

    #[test]
    fn over_cap_allocation_opens_an_extra_region() {
        let mature = MatureSpace::new(REGION, 1);
        assert!(mature.allocate_raw(REGION).is_some());
        assert!(mature.allocate_raw(8).is_none());

        let addr = mature.allocate_raw_over_cap(8);
        assert!(mature.contains(addr));
        assert_eq!(mature.region_count(), 2);
    }

    #[test]
    fn region_walk_finds_marked_objects() {
        let mature = MatureSpace::new(REGION, 8);
        let a = alloc(&mature, 0);
        let skipped = alloc(&mature, 2);
        let c = alloc(&mature, 1);
        a.header().set_mark(MARK_A);
        c.header().set_mark(MARK_A);

        let mut found = Vec::new();
        mature.for_each_marked(MARK_A, |obj| found.push(obj));
        assert_eq!(found, vec![a, c]);
        assert!(!skipped.header().is_marked(MARK_A));
    }

    #[test]
    fn mark_reaches_transitively() {
        let mature = MatureSpace::new(REGION, 8);
        let a = alloc(&mature, 1);
        let b = alloc(&mature, 1);
        let c = alloc(&mature, 0);
        let dead = alloc(&mature, 0);
        a.set_field(0, Some(b));
        b.set_field(0, Some(c));

        let live = mark_live(&[a], MARK_A);
        assert_eq!(live.len(), 3);
        assert!(a.header().is_marked(MARK_A));
        assert!(c.header().is_marked(MARK_A));
        assert!(!dead.header().is_marked(MARK_A));
    }

    #[test]
    fn stale_sentinel_counts_as_dead() {
        let mature = MatureSpace::new(REGION, 8);
        let survivor = alloc(&mature, 0);
        let stale = alloc(&mature, 0);
        stale.header().set_mark(MARK_A);

        mark_live(&[survivor], MARK_B);
        let resolve = mature_resolver(MARK_B);
        assert_eq!(resolve(survivor), Some(survivor));
        assert_eq!(resolve(stale), None);
    }

    #[test]
    fn sparse_region_is_evacuated_and_recycled() {
        let mature = MatureSpace::new(REGION, 8);
        // Fill region 0 with garbage plus one small survivor, then open
        // region 1 so region 0 is closed and sparse.
        let survivor = alloc(&mature, 0);
        while mature.region_count() == 1 {
            alloc(&mature, 2);
        }
        let anchor = alloc(&mature, 0);
        let old_addr = survivor.addr();

        let mut live = mark_live(&[survivor, anchor], MARK_A);
        let collector = MatureCollector {
            mature: &mature,
            evacuate_occupancy: 0.5,
        };
        let mut roots = [survivor, anchor];
        let outcome = collector.collect(&mut live, &mut roots);

        assert_eq!(outcome.evacuated, 1);
        assert_eq!(outcome.recyclable.len(), 1);
        assert_ne!(roots[0].addr(), old_addr);
        assert_eq!(roots[1], anchor);

        let regions_before = mature.region_count();
        mature.recycle(outcome.recyclable);
        assert_eq!(mature.region_count(), regions_before - 1);
    }

    #[test]
    fn pinned_region_is_not_evacuated() {
        let mature = MatureSpace::new(REGION, 8);
        let pinned = alloc(&mature, 0);
        pinned.header().set_flag(FLAG_PINNED);
        while mature.region_count() == 1 {
            alloc(&mature, 2);
        }
        let anchor = alloc(&mature, 0);
        let old_addr = pinned.addr();

        let mut live = mark_live(&[pinned, anchor], MARK_A);
        let collector = MatureCollector {
            mature: &mature,
            evacuate_occupancy: 0.9,
        };
        let mut roots = [pinned, anchor];
        let outcome = collector.collect(&mut live, &mut roots);

        assert_eq!(outcome.evacuated, 0);
        assert_eq!(roots[0].addr(), old_addr);
        assert!(outcome.recyclable.is_empty());
    }

    #[test]
    fn evacuation_rewrites_fields_into_victims() {
        let mature = MatureSpace::new(REGION, 8);
        let target = alloc(&mature, 0);
        while mature.region_count() == 1 {
            alloc(&mature, 2);
        }
        // Holder lives in the open region and points into the victim.
        let holder = alloc(&mature, 1);
        holder.set_field(0, Some(target));
        let old_target = target.addr();

        let mut live = mark_live(&[holder], MARK_A);
        let collector = MatureCollector {
            mature: &mature,
            evacuate_occupancy: 0.5,
        };
        let mut roots = [holder];
        collector.collect(&mut live, &mut roots);

        let new_target = holder.field(0).unwrap();
        assert_ne!(new_target.addr(), old_target);
        assert_eq!(new_target.header().size(), target.header().size());
    }

    #[test]
    fn fully_dead_region_recycles_without_copying() {
        let mature = MatureSpace::new(REGION, 8);
        while mature.region_count() <= 1 {
            alloc(&mature, 2);
        }
        let anchor = alloc(&mature, 0);

        let mut live = mark_live(&[anchor], MARK_A);
        let collector = MatureCollector {
            mature: &mature,
            evacuate_occupancy: 0.5,
        };
        let mut roots = [anchor];
        let outcome = collector.collect(&mut live, &mut roots);

        assert_eq!(outcome.evacuated, 0);
        assert_eq!(outcome.recyclable.len(), 1);
    }
}
