//! Young generation: semispace pair and copying collector.
//!
//! Mutators allocate young objects through per-context slabs carved from the
//! active semispace. A collection copies survivors into the other semispace
//! (or promotes them to the mature generation), flips the pair, and bumps
//! the slab epoch so every outstanding slab goes stale at once. From-space
//! headers are left intact after the flip; their forwarding words stay
//! readable until the space is reset at the start of the next collection.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info};

use crate::barrier::WriteBarrier;
use crate::mature::MatureSpace;
use crate::object::{FLAG_PINNED, FLAG_REMEMBERED, Forwarding, ObjectRef, Zone, copy_object_bytes};
use crate::slab::{Slab, SlabEpoch};
use crate::space::Space;

/// The two young semispaces plus the slab epoch.
pub struct YoungSpace {
    spaces: [Space; 2],
    active: AtomicUsize,
    epoch: SlabEpoch,
}

impl YoungSpace {
    pub fn new(semispace_size: usize) -> YoungSpace {
        YoungSpace {
            spaces: [Space::new(semispace_size), Space::new(semispace_size)],
            active: AtomicUsize::new(0),
            epoch: SlabEpoch::new(),
        }
    }

    fn from_space(&self) -> &Space {
        &self.spaces[self.active.load(Ordering::Acquire)]
    }

    fn to_space(&self) -> &Space {
        &self.spaces[1 - self.active.load(Ordering::Acquire)]
    }

    /// Carve a fresh slab from the active semispace; `None` when it is full.
    pub fn alloc_slab(&self, slab_size: usize) -> Option<Slab> {
        let start = self.from_space().allocate(slab_size)?;
        Some(Slab::new(start, slab_size, self.epoch.current()))
    }

    /// Current slab epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.current()
    }

    /// Bytes allocated in the active semispace.
    pub fn used_bytes(&self) -> usize {
        self.from_space().used()
    }

    /// True if `addr` lies in either semispace.
    pub fn contains(&self, addr: usize) -> bool {
        self.spaces[0].contains(addr) || self.spaces[1].contains(addr)
    }
}

/// What a young collection did, for the coordinator's bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
pub struct YoungOutcome {
    /// Objects copied within the young generation.
    pub survived: usize,
    /// Objects promoted to the mature generation.
    pub promoted: usize,
    /// Bytes reclaimed (from-space usage minus survivor bytes).
    pub reclaimed_bytes: usize,
    /// A promotion failed because the mature generation is full; the caller
    /// should schedule a mature collection.
    pub mature_pressure: bool,
}

/// One young collection. Borrowed pieces of the coordinator; the caller
/// holds the allocation lock and has stopped other mutators.
pub struct YoungCollector<'a> {
    pub young: &'a YoungSpace,
    pub mature: &'a MatureSpace,
    pub barrier: &'a WriteBarrier,
    /// Current live mark sentinel; promoted objects are stamped with it so
    /// an in-flight mature cycle treats them as reached.
    pub mark: u32,
    pub promote_age: u8,
}

impl<'a> YoungCollector<'a> {
    /// Copy live young objects out of from-space. `roots` slots are fixed in
    /// place. Returns the outcome plus the resolver side tables need: young
    /// addresses map through forwarding, everything else maps to itself.
    pub fn collect(&self, roots: &mut [ObjectRef]) -> YoungOutcome {
        let from_used = self.young.from_space().used();
        debug!(target: "quill::gc", from_used, "young collection start");

        // Stale headers from the previous cycle die here.
        self.young.to_space().reset();

        let mut outcome = YoungOutcome::default();
        let mut worklist = VecDeque::new();

        for slot in roots.iter_mut() {
            if slot.header().zone() == Zone::Young {
                *slot = self.relocate(*slot, &mut worklist, &mut outcome);
            }
        }

        // Remembered mature/large objects are roots for their young fields.
        // Each is rescanned and re-entered only if it still points young.
        for source in self.barrier.take_remembered() {
            source.header().clear_flag(FLAG_REMEMBERED);
            self.fixup_fields(source, &mut worklist, &mut outcome);
        }

        while let Some(obj) = worklist.pop_front() {
            self.fixup_fields(obj, &mut worklist, &mut outcome);
        }

        let survived_bytes = self.young.to_space().used();
        outcome.reclaimed_bytes = from_used.saturating_sub(survived_bytes);

        // Flip: to-space becomes the active semispace, every outstanding
        // slab goes stale.
        self.young.active.fetch_xor(1, Ordering::AcqRel);
        self.young.epoch.advance();

        info!(
            target: "quill::gc",
            survived = outcome.survived,
            promoted = outcome.promoted,
            reclaimed = outcome.reclaimed_bytes,
            "young collection done"
        );
        outcome
    }

    /// Forward a young object, copying or promoting it on first visit.
    fn relocate(
        &self,
        obj: ObjectRef,
        worklist: &mut VecDeque<ObjectRef>,
        outcome: &mut YoungOutcome,
    ) -> ObjectRef {
        if let Forwarding::Forwarded(new) = obj.header().forwarding() {
            return new;
        }
        let header = obj.header();
        let size = header.size() as usize;
        let age = header.age();

        let pinned = header.flag(FLAG_PINNED);
        let promote = pinned || age.saturating_add(1) >= self.promote_age;
        if promote {
            let addr = match self.mature.allocate_raw(size) {
                Some(addr) => Some(addr),
                None => {
                    outcome.mature_pressure = true;
                    // A pinned object must not be copied into to-space, so
                    // its promotion may open a region past the cap.
                    pinned.then(|| self.mature.allocate_raw_over_cap(size))
                }
            };
            if let Some(addr) = addr {
                // SAFETY: addr is a fresh mature allocation of `size` bytes.
                unsafe { copy_object_bytes(obj, addr) };
                let new = ObjectRef::from_addr(addr);
                new.header().set_zone(Zone::Mature);
                new.header().set_mark(self.mark);
                header.forward_to(new);
                outcome.promoted += 1;
                worklist.push_back(new);
                return new;
            }
        }

        let addr = self
            .young
            .to_space()
            .allocate(size)
            .expect("to-space holds all survivors");
        // SAFETY: addr is a fresh to-space allocation of `size` bytes.
        unsafe { copy_object_bytes(obj, addr) };
        let new = ObjectRef::from_addr(addr);
        new.header().set_age(age.saturating_add(1));
        header.forward_to(new);
        outcome.survived += 1;
        worklist.push_back(new);
        new
    }

    /// Rewrite `obj`'s young fields through forwarding. Non-young objects
    /// that still reference the young generation afterwards re-enter the
    /// remembered set.
    fn fixup_fields(
        &self,
        obj: ObjectRef,
        worklist: &mut VecDeque<ObjectRef>,
        outcome: &mut YoungOutcome,
    ) {
        let mut points_young = false;
        for index in 0..obj.header().field_count() {
            let Some(target) = obj.field(index) else { continue };
            if target.header().zone() != Zone::Young {
                continue;
            }
            let new_target = self.relocate(target, worklist, outcome);
            obj.set_field(index, Some(new_target));
            if new_target.header().zone() == Zone::Young {
                points_young = true;
            }
        }
        if points_young && obj.header().zone() != Zone::Young {
            self.barrier.remember(obj);
        }
    }
}

/// Resolver for side tables after a young collection: survivors map through
/// forwarding, dead young objects map to `None`, everything else is itself.
pub fn young_resolver(obj: ObjectRef) -> Option<ObjectRef> {
    if obj.header().zone() != Zone::Young {
        return Some(obj);
    }
    match obj.header().forwarding() {
        Forwarding::Forwarded(new) => Some(new),
        Forwarding::Normal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::object::{HEADER_SIZE, MARK_A, MARK_FRESH, init_object};

    fn setup() -> (YoungSpace, MatureSpace, WriteBarrier) {
        let config = MemoryConfig::default();
        (
            YoungSpace::new(64 * 1024),
            MatureSpace::new(config.region_size, config.max_regions),
            WriteBarrier::new(),
        )
    }

    fn alloc_young(young: &YoungSpace, fields: usize) -> ObjectRef {
        let size = (HEADER_SIZE + fields * 8) as u32;
        let addr = young.from_space().allocate(size as usize).unwrap();
        unsafe { init_object(addr, 0, 0, size, Zone::Young, MARK_FRESH) }
    }

    fn collector<'a>(
        young: &'a YoungSpace,
        mature: &'a MatureSpace,
        barrier: &'a WriteBarrier,
    ) -> YoungCollector<'a> {
        YoungCollector {
            young,
            mature,
            barrier,
            mark: MARK_A,
            promote_age: 2,
        }
    }

    #[test]
    fn roots_survive_and_garbage_dies() {
        let (young, mature, barrier) = setup();
        let live = alloc_young(&young, 1);
        let dead = alloc_young(&young, 1);
        let reachable = alloc_young(&young, 0);
        live.set_field(0, Some(reachable));

        let mut roots = [live];
        let outcome = collector(&young, &mature, &barrier).collect(&mut roots);

        assert_eq!(outcome.survived, 2);
        assert_ne!(roots[0], live);
        let new_live = roots[0];
        assert_eq!(new_live.header().age(), 1);
        let new_reachable = new_live.field(0).unwrap();
        assert_ne!(new_reachable, reachable);

        assert_eq!(young_resolver(live), Some(new_live));
        assert_eq!(young_resolver(dead), None);
    }

    #[test]
    fn old_objects_promote() {
        let (young, mature, barrier) = setup();
        let obj = alloc_young(&young, 0);
        obj.header().set_age(1);

        let mut roots = [obj];
        let outcome = collector(&young, &mature, &barrier).collect(&mut roots);

        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.survived, 0);
        assert_eq!(roots[0].header().zone(), Zone::Mature);
        assert!(!young.contains(roots[0].addr()));
    }

    #[test]
    fn pinned_objects_promote_regardless_of_age() {
        let (young, mature, barrier) = setup();
        let obj = alloc_young(&young, 0);
        obj.header().set_flag(FLAG_PINNED);

        let mut roots = [obj];
        collector(&young, &mature, &barrier).collect(&mut roots);
        assert_eq!(roots[0].header().zone(), Zone::Mature);
    }

    #[test]
    fn pinned_promotion_opens_a_region_past_the_cap() {
        let young = YoungSpace::new(64 * 1024);
        let barrier = WriteBarrier::new();
        // The single permitted region is already full.
        let mature = MatureSpace::new(4096, 1);
        assert!(mature.allocate_raw(4096).is_some());
        assert!(mature.allocate_raw(8).is_none());

        let obj = alloc_young(&young, 0);
        obj.header().set_flag(FLAG_PINNED);

        let mut roots = [obj];
        let outcome = YoungCollector {
            young: &young,
            mature: &mature,
            barrier: &barrier,
            mark: MARK_A,
            promote_age: 2,
        }
        .collect(&mut roots);

        assert!(outcome.mature_pressure);
        assert_eq!(outcome.promoted, 1);
        assert_eq!(roots[0].header().zone(), Zone::Mature);
        assert_eq!(mature.region_count(), 2);
    }

    #[test]
    fn remembered_set_keeps_young_targets_alive() {
        let (young, mature, barrier) = setup();
        // A mature object pointing at a young one, recorded by the barrier.
        let mature_obj = ObjectRef::from_addr(mature.allocate_raw(HEADER_SIZE + 8).unwrap());
        unsafe {
            init_object(
                mature_obj.addr(),
                0,
                0,
                (HEADER_SIZE + 8) as u32,
                Zone::Mature,
                MARK_FRESH,
            )
        };
        let target = alloc_young(&young, 0);
        mature_obj.set_field(0, Some(target));
        barrier.record_store(mature_obj, Some(target));

        let mut roots: [ObjectRef; 0] = [];
        let outcome = collector(&young, &mature, &barrier).collect(&mut roots);
        assert_eq!(outcome.survived, 1);

        let new_target = mature_obj.field(0).unwrap();
        assert_ne!(new_target, target);
        assert_eq!(new_target.header().zone(), Zone::Young);
        // Still pointing young, so the source was re-remembered.
        assert_eq!(barrier.remembered_len(), 1);
    }

    #[test]
    fn promoted_object_with_young_field_is_remembered() {
        let (young, mature, barrier) = setup();
        let old = alloc_young(&young, 1);
        old.header().set_age(1);
        let fresh = alloc_young(&young, 0);
        old.set_field(0, Some(fresh));

        let mut roots = [old];
        let outcome = collector(&young, &mature, &barrier).collect(&mut roots);

        assert_eq!(outcome.promoted, 1);
        assert_eq!(outcome.survived, 1);
        assert_eq!(roots[0].header().zone(), Zone::Mature);
        assert_eq!(roots[0].field(0).unwrap().header().zone(), Zone::Young);
        assert_eq!(barrier.remembered_len(), 1);
    }

    #[test]
    fn slab_epoch_goes_stale_on_flip() {
        let (young, mature, barrier) = setup();
        let mut slab = young.alloc_slab(4096).unwrap();
        assert!(slab.allocate(64, young.epoch()).is_some());

        let mut roots: [ObjectRef; 0] = [];
        collector(&young, &mature, &barrier).collect(&mut roots);
        assert!(slab.allocate(64, young.epoch()).is_none());
    }
}
