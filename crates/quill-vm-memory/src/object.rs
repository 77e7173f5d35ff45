//! Object headers and references.
//!
//! Every heap object is prefixed by a fixed-size [`ObjectHeader`] followed by
//! `field_count` reference slots. The header packs the rotating mark word,
//! the generation tag, the forwarding word installed while an object is being
//! moved, and the inline lock word that inflates to an out-of-line record on
//! contention. All mutable header state is atomic so the concurrent marker
//! can read headers while mutators run.

use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Object sizes and addresses are 8-byte aligned.
pub const OBJECT_ALIGNMENT: usize = 8;

/// Mark word of a freshly allocated object (no cycle has seen it yet).
pub const MARK_FRESH: u32 = 0;
/// The two live sentinels the mark rotates between. A skipped cycle leaves a
/// stale sentinel behind, which the next sweep detects as dead.
pub const MARK_A: u32 = 2;
/// See [`MARK_A`].
pub const MARK_B: u32 = 4;

/// The next live sentinel in the rotation.
#[inline]
pub fn rotate_mark(mark: u32) -> u32 {
    if mark == MARK_A { MARK_B } else { MARK_A }
}

/// Round a byte size up to object alignment.
#[inline]
pub fn align_size(bytes: usize) -> usize {
    (bytes + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// Generation an object currently lives in.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    /// Nursery; collected by copying.
    Young = 0,
    /// Region-based mature space.
    Mature = 1,
    /// Non-moving large object space.
    Large = 2,
}

impl Zone {
    fn from_u8(v: u8) -> Zone {
        match v {
            0 => Zone::Young,
            1 => Zone::Mature,
            _ => Zone::Large,
        }
    }
}

/// Header flag: the object must not be moved by a copying collector.
pub const FLAG_PINNED: u8 = 1 << 0;
/// Header flag: the object is already in the remembered set this cycle.
pub const FLAG_REMEMBERED: u8 = 1 << 1;
/// Header flag: finalization interest has been registered for the object.
pub const FLAG_FINALIZER: u8 = 1 << 2;

/// Forwarding state of a header.
///
/// The forwarding word and the live header share memory only through this
/// discriminated view; collectors check it before any field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarding {
    /// The object has not moved this cycle.
    Normal,
    /// The object was moved to the given location.
    Forwarded(ObjectRef),
}

/// Unlocked, uninflated lock word.
pub const LOCK_FREE: u64 = 0;
const LOCK_INFLATED_BIT: u64 = 1 << 63;
const LOCK_COUNT_MASK: u64 = 0xffff;
const LOCK_TID_SHIFT: u32 = 16;

/// Encode an inline lock word: owner context id plus recursion count.
#[inline]
pub fn lock_word_inline(tid: u32, count: u16) -> u64 {
    (u64::from(tid) << LOCK_TID_SHIFT) | u64::from(count)
}

/// Encode an inflated lock word referencing an out-of-line record.
#[inline]
pub fn lock_word_inflated(index: u32) -> u64 {
    LOCK_INFLATED_BIT | u64::from(index)
}

/// Decoded view of a header lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockWord {
    /// Unlocked, not inflated.
    Free,
    /// Inline-locked by a context, with a recursion count.
    Inline {
        /// Owning context id.
        owner: u32,
        /// Recursion count (>= 1).
        count: u16,
    },
    /// Inflated to the out-of-line record at the given table index.
    Inflated(u32),
}

/// Decode a raw lock word.
#[inline]
pub fn decode_lock_word(word: u64) -> LockWord {
    if word == LOCK_FREE {
        LockWord::Free
    } else if word & LOCK_INFLATED_BIT != 0 {
        LockWord::Inflated((word & u64::from(u32::MAX)) as u32)
    } else {
        LockWord::Inline {
            owner: (word >> LOCK_TID_SHIFT) as u32,
            count: (word & LOCK_COUNT_MASK) as u16,
        }
    }
}

/// Fixed-size metadata prefixing every heap object.
#[repr(C)]
pub struct ObjectHeader {
    /// Tagged lock word: free, inline owner+count, or inflated record index.
    lock_word: AtomicU64,
    /// Forwarding word: 0 = normal, otherwise the new address.
    forward: AtomicUsize,
    /// Rotating mark word (0, [`MARK_A`] or [`MARK_B`]).
    mark: AtomicU32,
    /// Total object size in bytes, header included. Written once at init.
    size: u32,
    /// Class id assigned by the hosted runtime. Written once at init.
    class_id: u32,
    /// Type tag. Written once at init.
    tag: u16,
    zone: AtomicU8,
    flags: AtomicU8,
    /// Young collections survived.
    age: AtomicU8,
}

/// Size of the object header in bytes; fields start at this offset.
pub const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

impl ObjectHeader {
    /// Type tag.
    #[inline]
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Class id.
    #[inline]
    pub fn class_id(&self) -> u32 {
        self.class_id
    }

    /// Total size in bytes, header included.
    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Number of reference slots following the header.
    #[inline]
    pub fn field_count(&self) -> usize {
        (self.size as usize - HEADER_SIZE) / std::mem::size_of::<usize>()
    }

    /// Generation the object currently lives in.
    #[inline]
    pub fn zone(&self) -> Zone {
        Zone::from_u8(self.zone.load(Ordering::Acquire))
    }

    pub(crate) fn set_zone(&self, zone: Zone) {
        self.zone.store(zone as u8, Ordering::Release);
    }

    /// Current mark word.
    #[inline]
    pub fn mark(&self) -> u32 {
        self.mark.load(Ordering::Acquire)
    }

    pub(crate) fn set_mark(&self, mark: u32) {
        self.mark.store(mark, Ordering::Release);
    }

    /// True when the mark word matches the given live sentinel.
    #[inline]
    pub fn is_marked(&self, sentinel: u32) -> bool {
        self.mark() == sentinel
    }

    /// Test a header flag.
    #[inline]
    pub fn flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    pub(crate) fn set_flag(&self, flag: u8) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    pub(crate) fn clear_flag(&self, flag: u8) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }

    /// Set a flag, returning whether it was already set.
    pub(crate) fn test_and_set_flag(&self, flag: u8) -> bool {
        self.flags.fetch_or(flag, Ordering::AcqRel) & flag != 0
    }

    /// Young collections survived so far.
    #[inline]
    pub fn age(&self) -> u8 {
        self.age.load(Ordering::Acquire)
    }

    pub(crate) fn set_age(&self, age: u8) {
        self.age.store(age, Ordering::Release);
    }

    /// Forwarding state, checked before any field access during collection.
    #[inline]
    pub fn forwarding(&self) -> Forwarding {
        match self.forward.load(Ordering::Acquire) {
            0 => Forwarding::Normal,
            addr => Forwarding::Forwarded(ObjectRef::from_addr(addr)),
        }
    }

    pub(crate) fn forward_to(&self, target: ObjectRef) {
        self.forward.store(target.addr(), Ordering::Release);
    }

    pub(crate) fn clear_forwarding(&self) {
        self.forward.store(0, Ordering::Release);
    }

    /// Raw lock word.
    #[inline]
    pub fn lock_word(&self) -> u64 {
        self.lock_word.load(Ordering::Acquire)
    }

    /// CAS the lock word; returns true on success.
    pub(crate) fn lock_cas(&self, current: u64, new: u64) -> bool {
        self.lock_word
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Address of an object header inside one of the managed spaces.
///
/// The crate maintains the invariant that every `ObjectRef` handed out points
/// at an initialized header: from-space headers stay readable (for their
/// forwarding word) until the space is reused by the next collection, and
/// region memory is only recycled after all references into it are rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectRef(usize);

impl ObjectRef {
    /// Wrap a raw header address.
    #[inline]
    pub fn from_addr(addr: usize) -> ObjectRef {
        debug_assert!(addr != 0 && addr % OBJECT_ALIGNMENT == 0);
        ObjectRef(addr)
    }

    /// Raw header address.
    #[inline]
    pub fn addr(self) -> usize {
        self.0
    }

    /// Dereference the header.
    #[inline]
    pub fn header(self) -> &'static ObjectHeader {
        // SAFETY: the crate-wide invariant above; headers are only mutated
        // through atomics, so shared references never alias a plain write.
        unsafe { &*(self.0 as *const ObjectHeader) }
    }

    #[inline]
    fn field_slot(self, index: usize) -> &'static AtomicUsize {
        debug_assert!(index < self.header().field_count());
        let addr = self.0 + HEADER_SIZE + index * std::mem::size_of::<usize>();
        // SAFETY: index is within the object's field area, which was zeroed
        // at init and is only accessed as atomic words.
        unsafe { &*(addr as *const AtomicUsize) }
    }

    /// Load a reference field (0 = null).
    #[inline]
    pub fn field(self, index: usize) -> Option<ObjectRef> {
        match self.field_slot(index).load(Ordering::Acquire) {
            0 => None,
            addr => Some(ObjectRef::from_addr(addr)),
        }
    }

    /// Store a reference field. Mutator code must go through
    /// `ObjectMemory::write_ref` instead, which also runs the write barrier.
    pub(crate) fn set_field(self, index: usize, value: Option<ObjectRef>) {
        let raw = value.map_or(0, ObjectRef::addr);
        self.field_slot(index).store(raw, Ordering::Release);
    }

    /// Follow forwarding pointers until a non-forwarded header is reached.
    pub(crate) fn chase_forwarding(self) -> ObjectRef {
        let mut current = self;
        while let Forwarding::Forwarded(next) = current.header().forwarding() {
            current = next;
        }
        current
    }
}

/// Write a fresh header at `addr` and zero every field slot.
///
/// # Safety
/// `addr` must point at `size` bytes of writable, 8-byte-aligned memory
/// inside one of the managed spaces, not currently holding a live object.
pub(crate) unsafe fn init_object(
    addr: usize,
    class_id: u32,
    tag: u16,
    size: u32,
    zone: Zone,
    mark: u32,
) -> ObjectRef {
    debug_assert!(size as usize >= HEADER_SIZE);
    let header = ObjectHeader {
        lock_word: AtomicU64::new(LOCK_FREE),
        forward: AtomicUsize::new(0),
        mark: AtomicU32::new(mark),
        size,
        class_id,
        tag,
        zone: AtomicU8::new(zone as u8),
        flags: AtomicU8::new(0),
        age: AtomicU8::new(0),
    };
    // SAFETY: caller guarantees addr is valid for `size` bytes.
    unsafe {
        std::ptr::write(addr as *mut ObjectHeader, header);
        let fields = (addr + HEADER_SIZE) as *mut usize;
        let count = (size as usize - HEADER_SIZE) / std::mem::size_of::<usize>();
        for i in 0..count {
            std::ptr::write(fields.add(i), 0);
        }
    }
    ObjectRef::from_addr(addr)
}

/// Copy an object's raw bytes (header and fields) to a new location.
///
/// # Safety
/// `dst` must point at at least `src.header().size()` bytes of writable
/// memory that does not overlap the source object.
pub(crate) unsafe fn copy_object_bytes(src: ObjectRef, dst: usize) {
    let size = src.header().size() as usize;
    // SAFETY: caller guarantees the destination is valid and disjoint.
    unsafe {
        std::ptr::copy_nonoverlapping(src.addr() as *const u8, dst as *mut u8, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A scratch buffer big enough for one small object.
    fn scratch() -> Vec<u64> {
        vec![0u64; 32]
    }

    #[test]
    fn header_init_and_fields() {
        let buf = scratch();
        let addr = buf.as_ptr() as usize;
        let size = (HEADER_SIZE + 3 * 8) as u32;
        let obj = unsafe { init_object(addr, 7, 1, size, Zone::Young, MARK_FRESH) };

        assert_eq!(obj.header().class_id(), 7);
        assert_eq!(obj.header().tag(), 1);
        assert_eq!(obj.header().field_count(), 3);
        assert_eq!(obj.header().zone(), Zone::Young);
        assert_eq!(obj.header().mark(), MARK_FRESH);
        assert_eq!(obj.field(0), None);

        obj.set_field(1, Some(obj));
        assert_eq!(obj.field(1), Some(obj));
        obj.set_field(1, None);
        assert_eq!(obj.field(1), None);
    }

    #[test]
    fn mark_rotation_alternates() {
        assert_eq!(rotate_mark(MARK_A), MARK_B);
        assert_eq!(rotate_mark(MARK_B), MARK_A);
        assert_eq!(rotate_mark(MARK_FRESH), MARK_A);
    }

    #[test]
    fn forwarding_is_tagged() {
        let buf = scratch();
        let addr = buf.as_ptr() as usize;
        let obj = unsafe { init_object(addr, 0, 0, HEADER_SIZE as u32, Zone::Young, MARK_FRESH) };

        assert_eq!(obj.header().forwarding(), Forwarding::Normal);
        let target = ObjectRef::from_addr(addr + 64);
        obj.header().forward_to(target);
        assert_eq!(obj.header().forwarding(), Forwarding::Forwarded(target));
        obj.header().clear_forwarding();
        assert_eq!(obj.header().forwarding(), Forwarding::Normal);
    }

    #[test]
    fn lock_word_roundtrip() {
        assert_eq!(decode_lock_word(LOCK_FREE), LockWord::Free);
        assert_eq!(
            decode_lock_word(lock_word_inline(9, 3)),
            LockWord::Inline { owner: 9, count: 3 }
        );
        assert_eq!(decode_lock_word(lock_word_inflated(42)), LockWord::Inflated(42));
    }

    #[test]
    fn flags_set_and_clear() {
        let buf = scratch();
        let addr = buf.as_ptr() as usize;
        let obj = unsafe { init_object(addr, 0, 0, HEADER_SIZE as u32, Zone::Mature, MARK_A) };

        assert!(!obj.header().flag(FLAG_PINNED));
        assert!(!obj.header().test_and_set_flag(FLAG_PINNED));
        assert!(obj.header().test_and_set_flag(FLAG_PINNED));
        obj.header().clear_flag(FLAG_PINNED);
        assert!(!obj.header().flag(FLAG_PINNED));
    }
}
