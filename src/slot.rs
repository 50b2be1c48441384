//! Fixed-capacity connection slot table (spec §4.5), adapted from the teacher's `Connections<C>`.
//! Two differences from the teacher's version, both required by spec: slots are found by a
//! deterministic linear scan starting at slot 0 rather than a random probe (spec §9 accepts
//! this over the teacher's randomized placement, since the table isn't oversized 10% the way
//! `Connections` is and a random start buys nothing extra here), and each slot carries an
//! explicit generation counter so a [`ConnectionId`] captured before a slot was reused can be
//! rejected rather than silently handed the new occupant's connection.

use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU8, Ordering::{Acquire, AcqRel, Relaxed, Release}};
use std::sync::Mutex;

use tracing::warn;

use crate::common::{Ark, AtomicRefCounted};
use crate::id::ConnectionId;

pub trait Connection: AtomicRefCounted {
    /// Called once, right after the slot is claimed, with the id the connection now owns.
    fn bind(&self, id: ConnectionId);
    fn id(&self) -> ConnectionId;
    fn last_active(&self) -> u32;
}

struct Slot<C> {
    ptr: AtomicPtr<C>,
    generation: AtomicU8,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self { ptr: AtomicPtr::default(), generation: AtomicU8::new(0) }
    }
}

pub struct SlotTable<C: Connection> {
    slots: Box<[Slot<C>]>,
    max_connections: u32,
    added: AtomicI64,
    removed: AtomicI64,
    remove_lock: Mutex<()>,
}

impl<C: Connection> SlotTable<C> {
    pub fn new(max_connections: u32) -> Self {
        assert!(max_connections >= 1);
        let slots = (0..max_connections).map(|_| Slot::default()).collect::<Vec<_>>().into_boxed_slice();
        Self {
            slots,
            max_connections,
            added: AtomicI64::new(0),
            removed: AtomicI64::new(0),
            remove_lock: Mutex::new(()),
        }
    }

    pub fn len(&self) -> usize {
        let removed = self.removed.load(Acquire);
        let count = self.added.load(Acquire) - removed;
        debug_assert!(count >= 0);
        count as usize
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_connections as usize
    }

    /// Claim a free slot and construct a connection in it via `make`, which receives the
    /// [`ConnectionId`] (slot index + current generation) the connection will own.
    pub fn add(&self, make: impl FnOnce(ConnectionId) -> C) -> Option<Ark<C>> {
        let added = self.added.fetch_add(1, AcqRel) + 1;
        if added - self.removed.load(Acquire) > self.max_connections as i64 {
            self.added.fetch_sub(1, Relaxed);
            warn!(limit = self.max_connections, "reached connection limit");
            return None;
        }

        let end = self.slots.len();
        for i in 0..end {
            let slot = &self.slots[i];
            if slot.ptr.load(Relaxed).is_null() {
                let generation = slot.generation.load(Acquire);
                let id = ConnectionId::new(i as u32, generation);
                let conn = Ark::new(make(id));
                let conn_ptr = conn.load().expect("just constructed") as *const C as *mut C;
                if slot.ptr.compare_exchange(std::ptr::null_mut(), conn_ptr, Release, Relaxed).is_ok() {
                    return Some(conn);
                }
                // Lost a race for this slot; drop `conn` and keep scanning. Extremely rare:
                // callers normally serialize acceptor/connect paths per slot region already.
            }
        }
        self.added.fetch_sub(1, Relaxed);
        warn!("no free connection slot found despite len() < max_connections");
        None
    }

    /// Release `id`'s slot, bumping its generation so any handle still referencing the old
    /// occupant is recognized as stale by [`SlotTable::get`].
    pub fn remove(&self, id: ConnectionId) {
        let index = id.slot_index() as usize;
        let slot = self.slots.get(index).expect("invalid slot index");

        let _guard = self.remove_lock.lock().expect("slot table mutex poisoned");
        slot.ptr.store(std::ptr::null_mut(), Relaxed);
        slot.generation.fetch_add(1, Relaxed);
        self.removed.fetch_add(1, Relaxed);
    }

    /// Look up the live connection for `id`, rejecting it if the slot has since been reused
    /// (the `ConnectionId`'s generation no longer matches the slot's).
    pub fn get(&self, id: ConnectionId) -> Option<Ark<C>> {
        if !id.is_valid() {
            return None;
        }
        let index = id.slot_index() as usize;
        let slot = self.slots.get(index)?;

        let _guard = self.remove_lock.lock().expect("slot table mutex poisoned");
        let ptr = slot.ptr.load(Acquire);
        if ptr.is_null() || slot.generation.load(Acquire) != id.generation() {
            return None;
        }
        // Safety: holding `remove_lock` prevents a concurrent `remove` from freeing this
        // pointer out from under us between the null/generation check and the incref below.
        let conn = unsafe { &*ptr };
        conn.incref();
        Some(unsafe { Ark::from_raw(ptr) })
    }

    /// Read-only iteration over every occupied slot, e.g. for timeout scans.
    pub fn for_each<F: FnMut(&C)>(&self, mut f: F) {
        if self.len() == 0 {
            return;
        }
        let _guard = self.remove_lock.lock().expect("slot table mutex poisoned");
        for slot in self.slots.iter() {
            let ptr = slot.ptr.load(Acquire);
            if !ptr.is_null() {
                f(unsafe { &*ptr });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32 as StdAtomicU32, Ordering};

    struct Dummy {
        refcount: StdAtomicU32,
        id: Mutex<ConnectionId>,
    }

    impl AtomicRefCounted for Dummy {
        fn refcount(&self) -> u32 { self.refcount.load(Ordering::Relaxed) }
        fn incref(&self) { self.refcount.fetch_add(1, Ordering::Relaxed); }
        fn decref(&self) -> bool { self.refcount.fetch_sub(1, Ordering::AcqRel) == 1 }
    }

    impl Connection for Dummy {
        fn bind(&self, id: ConnectionId) { *self.id.lock().unwrap() = id; }
        fn id(&self) -> ConnectionId { *self.id.lock().unwrap() }
        fn last_active(&self) -> u32 { 0 }
    }

    fn dummy(id: ConnectionId) -> Dummy {
        Dummy { refcount: StdAtomicU32::new(1), id: Mutex::new(id) }
    }

    #[test]
    fn add_get_remove_roundtrip() {
        let table: SlotTable<Dummy> = SlotTable::new(4);
        let conn = table.add(dummy).unwrap();
        let id = conn.id();
        assert!(table.get(id).is_some());
        table.remove(id);
        assert!(table.get(id).is_none(), "stale id must be rejected after remove");
    }

    #[test]
    fn exhausts_capacity() {
        let table: SlotTable<Dummy> = SlotTable::new(2);
        assert!(table.add(dummy).is_some());
        assert!(table.add(dummy).is_some());
        assert!(table.add(dummy).is_none());
    }

    #[test]
    fn reused_slot_gets_new_generation() {
        let table: SlotTable<Dummy> = SlotTable::new(1);
        let first = table.add(dummy).unwrap();
        let first_id = first.id();
        table.remove(first_id);
        let second = table.add(dummy).unwrap();
        let second_id = second.id();
        assert_eq!(first_id.slot_index(), second_id.slot_index());
        assert_ne!(first_id.generation(), second_id.generation());
        assert!(table.get(first_id).is_none());
        assert!(table.get(second_id).is_some());
    }
}
