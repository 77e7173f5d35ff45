//! Out-of-line (inflated) header records.
//!
//! The inline lock word in each object header covers the uncontended case.
//! Contention, identity-id assignment, and native-handle attachment all
//! force inflation: the lock word is repointed at a record in this table and
//! never deflates for the lifetime of the object. Records are swept at the
//! end of each mature cycle, following their owner if it moved and freeing
//! the slot if it died.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::LockStatus;
use crate::object::{
    FLAG_PINNED, LockWord, ObjectRef, decode_lock_word, lock_word_inflated,
};

/// Upper bound on how long a parked lock waiter goes without checking its
/// context's interrupt flag.
const INTERRUPT_POLL: Duration = Duration::from_millis(10);

/// Out-of-line header state for one object.
pub struct InflatedHeader {
    /// Identity id; 0 until assigned.
    id: AtomicU64,
    /// Owning context id, 0 when unlocked.
    owner: AtomicU32,
    /// Recursion count of the current owner.
    count: AtomicU32,
    /// Address of the owning object; rewritten when the object moves.
    owner_obj: AtomicUsize,
    /// Native handles attached to the owner.
    handle_count: AtomicU32,
    contention: Mutex<()>,
    available: Condvar,
}

impl InflatedHeader {
    fn new(owner_obj: usize, owner: u32, count: u32) -> InflatedHeader {
        InflatedHeader {
            id: AtomicU64::new(0),
            owner: AtomicU32::new(owner),
            count: AtomicU32::new(count),
            owner_obj: AtomicUsize::new(owner_obj),
            handle_count: AtomicU32::new(0),
            contention: Mutex::new(()),
            available: Condvar::new(),
        }
    }

    /// The object this record belongs to.
    pub fn owner_object(&self) -> ObjectRef {
        ObjectRef::from_addr(self.owner_obj.load(Ordering::Acquire))
    }

    /// Identity id, if one has been assigned.
    pub fn id(&self) -> Option<u64> {
        match self.id.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Acquire the lock for context `tid`, blocking on contention.
    ///
    /// `interrupt` is the context's pending-interrupt flag. The wait wakes
    /// periodically to observe it; when it is set the wait ends with
    /// [`LockStatus::Interrupted`] and the flag is consumed.
    pub fn lock(
        &self,
        tid: u32,
        timeout: Option<Duration>,
        interrupt: &AtomicBool,
    ) -> LockStatus {
        debug_assert!(tid != 0);
        if self.owner.load(Ordering::Acquire) == tid {
            self.count.fetch_add(1, Ordering::AcqRel);
            return LockStatus::Acquired;
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut guard = self.contention.lock();
        loop {
            if self
                .owner
                .compare_exchange(0, tid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.count.store(1, Ordering::Release);
                return LockStatus::Acquired;
            }
            if interrupt.swap(false, Ordering::AcqRel) {
                return LockStatus::Interrupted;
            }
            match deadline {
                Some(deadline) => {
                    let until = deadline.min(Instant::now() + INTERRUPT_POLL);
                    if self.available.wait_until(&mut guard, until).timed_out()
                        && Instant::now() >= deadline
                    {
                        return LockStatus::TimedOut;
                    }
                }
                None => {
                    let _ = self
                        .available
                        .wait_until(&mut guard, Instant::now() + INTERRUPT_POLL);
                }
            }
            if interrupt.swap(false, Ordering::AcqRel) {
                return LockStatus::Interrupted;
            }
        }
    }

    /// Release one recursion level; returns false if `tid` is not the owner.
    pub fn unlock(&self, tid: u32) -> bool {
        if self.owner.load(Ordering::Acquire) != tid {
            return false;
        }
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.owner.store(0, Ordering::Release);
            let _guard = self.contention.lock();
            self.available.notify_all();
        }
        true
    }

    /// Current owner and recursion count (0 owner = unlocked).
    pub fn lock_state(&self) -> (u32, u32) {
        (
            self.owner.load(Ordering::Acquire),
            self.count.load(Ordering::Acquire),
        )
    }

    /// Number of native handles attached.
    pub fn handle_count(&self) -> u32 {
        self.handle_count.load(Ordering::Acquire)
    }
}

/// Table of inflated header records plus the inflation lock.
///
/// The inflation lock serializes lock-word inflation only; it is distinct
/// from the allocation lock and the two are never held together.
pub struct HeaderTable {
    records: Mutex<HeaderRecords>,
    inflation: Mutex<()>,
    next_id: AtomicU64,
}

struct HeaderRecords {
    slots: Vec<Option<Arc<InflatedHeader>>>,
    free: Vec<u32>,
}

impl HeaderTable {
    pub fn new() -> HeaderTable {
        HeaderTable {
            records: Mutex::new(HeaderRecords {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            inflation: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Inflate `obj`'s lock word, returning its record. Idempotent: if the
    /// word is already inflated the existing record is returned. An inline
    /// lock held at inflation time is carried into the record.
    pub fn inflate(&self, obj: ObjectRef) -> Arc<InflatedHeader> {
        let _inflating = self.inflation.lock();
        loop {
            let word = obj.header().lock_word();
            match decode_lock_word(word) {
                LockWord::Inflated(index) => return self.record(index),
                LockWord::Free => {
                    if let Some(record) = self.try_install(obj, word, 0, 0) {
                        return record;
                    }
                }
                LockWord::Inline { owner, count } => {
                    if let Some(record) =
                        self.try_install(obj, word, owner, u32::from(count))
                    {
                        return record;
                    }
                }
            }
        }
    }

    /// Inflate and assign (or fetch) the object's identity id.
    pub fn inflate_for_id(&self, obj: ObjectRef) -> u64 {
        let record = self.inflate(obj);
        loop {
            match record.id.load(Ordering::Acquire) {
                0 => {
                    let id = self.next_id.fetch_add(1, Ordering::AcqRel);
                    if record
                        .id
                        .compare_exchange(0, id, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return id;
                    }
                }
                id => return id,
            }
        }
    }

    /// Inflate for a native handle. The owner is pinned while any handle is
    /// attached, so raw interior pointers held across native calls stay
    /// valid.
    pub fn attach_handle(&self, obj: ObjectRef) -> Arc<InflatedHeader> {
        let record = self.inflate(obj);
        record.handle_count.fetch_add(1, Ordering::AcqRel);
        obj.header().set_flag(FLAG_PINNED);
        record
    }

    /// Detach one native handle; the owner is unpinned when the last handle
    /// goes away.
    pub fn release_handle(&self, record: &InflatedHeader) {
        if record.handle_count.fetch_sub(1, Ordering::AcqRel) == 1 {
            record.owner_object().header().clear_flag(FLAG_PINNED);
        }
    }

    /// Record at `index`.
    pub fn record(&self, index: u32) -> Arc<InflatedHeader> {
        self.records.lock().slots[index as usize]
            .clone()
            .expect("lock word points at a live inflated record")
    }

    fn try_install(
        &self,
        obj: ObjectRef,
        current_word: u64,
        owner: u32,
        count: u32,
    ) -> Option<Arc<InflatedHeader>> {
        let mut records = self.records.lock();
        let record = Arc::new(InflatedHeader::new(obj.addr(), owner, count));
        let index = match records.free.pop() {
            Some(index) => {
                records.slots[index as usize] = Some(Arc::clone(&record));
                index
            }
            None => {
                records.slots.push(Some(Arc::clone(&record)));
                (records.slots.len() - 1) as u32
            }
        };
        if obj.header().lock_cas(current_word, lock_word_inflated(index)) {
            Some(record)
        } else {
            // Lost a race with an inline lock or unlock; give the slot back.
            records.slots[index as usize] = None;
            records.free.push(index);
            None
        }
    }

    /// Walk every record after a collection. `resolve` maps the recorded
    /// owner address to its new location, or `None` if the owner died; dead
    /// records free their slot.
    pub fn sweep<F>(&self, resolve: F)
    where
        F: Fn(ObjectRef) -> Option<ObjectRef>,
    {
        let mut records = self.records.lock();
        let HeaderRecords { slots, free } = &mut *records;
        for (index, slot) in slots.iter_mut().enumerate() {
            let Some(record) = slot else { continue };
            let owner = ObjectRef::from_addr(record.owner_obj.load(Ordering::Acquire));
            match resolve(owner) {
                Some(new_owner) => {
                    record.owner_obj.store(new_owner.addr(), Ordering::Release);
                }
                None => {
                    *slot = None;
                    free.push(index as u32);
                }
            }
        }
    }

    /// Number of live records (diagnostics).
    pub fn live_records(&self) -> usize {
        self.records.lock().slots.iter().flatten().count()
    }
}

impl Default for HeaderTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{HEADER_SIZE, MARK_FRESH, Zone, init_object, lock_word_inline};

    fn make(buf: &[u64]) -> ObjectRef {
        let size = (HEADER_SIZE + 8) as u32;
        unsafe { init_object(buf.as_ptr() as usize, 0, 0, size, Zone::Mature, MARK_FRESH) }
    }

    #[test]
    fn inflate_is_idempotent() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let table = HeaderTable::new();

        let first = table.inflate(obj);
        let second = table.inflate(obj);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.live_records(), 1);
        assert!(matches!(
            decode_lock_word(obj.header().lock_word()),
            LockWord::Inflated(_)
        ));
    }

    #[test]
    fn inflation_carries_inline_lock() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        assert!(obj.header().lock_cas(0, lock_word_inline(7, 2)));

        let table = HeaderTable::new();
        let record = table.inflate(obj);
        assert_eq!(record.lock_state(), (7, 2));
    }

    #[test]
    fn identity_id_is_stable() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let table = HeaderTable::new();
        let obj_a = make(&a);
        let obj_b = make(&b);

        let id_a = table.inflate_for_id(obj_a);
        let id_b = table.inflate_for_id(obj_b);
        assert_ne!(id_a, id_b);
        assert_eq!(table.inflate_for_id(obj_a), id_a);
    }

    #[test]
    fn lock_recursion_and_release() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let table = HeaderTable::new();
        let record = table.inflate(obj);
        let interrupt = AtomicBool::new(false);

        assert_eq!(record.lock(3, None, &interrupt), LockStatus::Acquired);
        assert_eq!(record.lock(3, None, &interrupt), LockStatus::Acquired);
        assert_eq!(record.lock_state(), (3, 2));
        assert!(record.unlock(3));
        assert!(record.unlock(3));
        assert_eq!(record.lock_state().0, 0);
        assert!(!record.unlock(3));
    }

    #[test]
    fn contended_lock_times_out() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let table = HeaderTable::new();
        let record = table.inflate(obj);
        let interrupt = AtomicBool::new(false);

        assert_eq!(record.lock(1, None, &interrupt), LockStatus::Acquired);
        assert_eq!(
            record.lock(2, Some(Duration::from_millis(20)), &interrupt),
            LockStatus::TimedOut
        );
        assert!(record.unlock(1));
        assert_eq!(record.lock(2, None, &interrupt), LockStatus::Acquired);
    }

    #[test]
    fn interrupt_wakes_a_parked_waiter() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let table = HeaderTable::new();
        let record = table.inflate(obj);
        let holder_flag = AtomicBool::new(false);

        assert_eq!(record.lock(1, None, &holder_flag), LockStatus::Acquired);
        let waiter_record = Arc::clone(&record);
        let waiter_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&waiter_flag);
        let thread = std::thread::spawn(move || waiter_record.lock(2, None, &flag));

        std::thread::sleep(Duration::from_millis(30));
        waiter_flag.store(true, Ordering::SeqCst);
        // The holder never releases; the waiter must notice on its own.
        assert_eq!(thread.join().unwrap(), LockStatus::Interrupted);
        assert!(record.unlock(1));
    }

    #[test]
    fn handle_attach_pins_owner() {
        let buf = vec![0u64; 16];
        let obj = make(&buf);
        let table = HeaderTable::new();

        let record = table.attach_handle(obj);
        assert!(obj.header().flag(FLAG_PINNED));
        assert_eq!(record.handle_count(), 1);
        table.release_handle(&record);
        assert!(!obj.header().flag(FLAG_PINNED));
    }

    #[test]
    fn sweep_follows_moves_and_frees_dead() {
        let a = vec![0u64; 16];
        let b = vec![0u64; 16];
        let c = vec![0u64; 16];
        let table = HeaderTable::new();
        let moved = make(&a);
        let dead = make(&b);
        let new_home = make(&c);
        table.inflate(moved);
        table.inflate(dead);
        assert_eq!(table.live_records(), 2);

        table.sweep(|owner| if owner == moved { Some(new_home) } else { None });
        assert_eq!(table.live_records(), 1);

        // Freed slot is reused.
        let d = vec![0u64; 16];
        let fresh = make(&d);
        table.inflate(fresh);
        assert_eq!(table.live_records(), 2);
    }
}
