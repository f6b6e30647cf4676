//! The hash-indexed entry table
//!
//! An open-addressed table with hop-scotch displacement: an entry lives
//! within a bounded window of its home bucket, inserts displace their
//! way toward the home when the window is full, and lookups never probe
//! further than the window. The table itself is one heap allocation; a
//! rehash builds a doubled table and publishes it with a single pointer
//! swing guarded by the `extend` intent.

use crate::heap::intent::IntentSet;
use crate::heap::{alloc_ptr, PHeap};
use crate::persist::Persister;
use crate::ptr::PAddr;
use crate::result::Result;
use crate::utils::{clean_align, round_up};
use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Bounded probe distance from the home bucket
pub const HOP_RANGE: usize = 64;

/// Rehash when live entries exceed 7/8 of capacity
pub const LOAD_NUM: u64 = 7;
pub const LOAD_DEN: u64 = 8;

pub const ENTRY_EMPTY: u64 = 0;
pub const ENTRY_USED: u64 = 1;

/// One table slot. Exactly a cache line; the `state` store is the
/// publication point of everything else in it.
#[repr(C)]
pub struct Entry {
    pub state: u64,
    pub hash: u64,
    pub epoch: u64,
    pub timestamp: u64,
    pub key: PAddr,
    pub key_len: u64,
    pub value: PAddr,
    pub flags: u64,
}

pub const ENTRY_SIZE: usize = std::mem::size_of::<Entry>();

/// Table allocation: a one-line header followed by the slots.
#[repr(C)]
pub struct TableHeader {
    pub capacity: u64,
    _pad: [u64; 7],
}

pub const TABLE_HEADER_SIZE: usize = std::mem::size_of::<TableHeader>();

pub fn table_alloc_size(capacity: u64) -> usize {
    TABLE_HEADER_SIZE + capacity as usize * ENTRY_SIZE
}

/// A value allocation starts with this record; the payload lies at
/// `data_off()` past it. Swinging an entry's value pointer therefore
/// changes pointer, length, and alignment in one persistent store.
#[repr(C)]
pub struct ValueRecord {
    pub len: u64,
    pub align: u64,
}

impl ValueRecord {
    #[inline]
    pub fn layout(len: usize, align: usize) -> (usize, usize, usize) {
        let align = clean_align(align, 8);
        let data_off = round_up(std::mem::size_of::<ValueRecord>(), align);
        (data_off + len, data_off, align)
    }

    #[inline]
    pub fn data_off(&self) -> usize {
        round_up(std::mem::size_of::<ValueRecord>(), self.align as usize)
    }

    #[inline]
    pub fn total_size(&self) -> usize {
        self.data_off() + self.len as usize
    }
}

/// Reads the payload of a value allocation.
///
/// # Safety
///
/// `value` must point at a live `ValueRecord` in mapped space.
pub unsafe fn value_bytes<'a>(value: PAddr) -> &'a [u8] {
    let rec = value.as_ref::<ValueRecord>();
    value.add(rec.data_off() as u64).as_slice(rec.len as usize)
}

pub fn hash_key(key: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(key);
    h.finish()
}

/// Journal of one in-flight displacement; lives in the pool header.
/// Replayed on open so a crash never leaves a key twice in the table.
#[repr(C)]
pub struct DispJournal {
    pub from: PAddr,
    pub to: PAddr,
    pub valid: u64,
}

impl DispJournal {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.from = PAddr::NULL;
        self.to = PAddr::NULL;
        self.valid = 0;
        pers.persist_obj(self);
    }

    pub fn recover<P: Persister>(&mut self, pers: &P) {
        if self.valid == 0 {
            return;
        }
        if self.from.is_null() || self.to.is_null() {
            crate::error::corruption("displacement journal with null entries");
        }
        unsafe {
            let from = self.from.as_mut::<Entry>();
            let to = self.to.as_mut::<Entry>();
            if to.state == ENTRY_USED && from.state == ENTRY_USED && to.hash == from.hash {
                // both halves visible: finish by vacating the source
                from.state = ENTRY_EMPTY;
                pers.persist_obj(&from.state);
            }
        }
        self.valid = 0;
        pers.persist_obj(&self.valid);
    }
}

/// Volatile view over the persistent table; the pool constructs one per
/// open and routes every table operation through it.
pub struct Map<P: Persister> {
    /// Cell in the pool header holding the table pointer
    table_slot: PAddr,
    /// Cell holding the next insertion epoch
    epoch_cell: PAddr,
    /// Displacement journal in the pool header
    disp: PAddr,
    pub live: u64,
    pers: P,
}

impl<P: Persister> Map<P> {
    pub fn new(table_slot: PAddr, epoch_cell: PAddr, disp: PAddr, pers: P) -> Self {
        Self {
            table_slot,
            epoch_cell,
            disp,
            live: 0,
            pers,
        }
    }

    #[inline]
    pub fn table(&self) -> PAddr {
        unsafe { *self.table_slot.as_ref::<PAddr>() }
    }

    #[inline]
    pub fn capacity(&self) -> u64 {
        unsafe { self.table().as_ref::<TableHeader>().capacity }
    }

    #[inline]
    pub fn entry_addr(&self, table: PAddr, ix: u64) -> PAddr {
        table.add(TABLE_HEADER_SIZE as u64 + ix * ENTRY_SIZE as u64)
    }

    #[inline]
    pub fn entry<'a>(&self, ix: u64) -> &'a mut Entry {
        unsafe { self.entry_addr(self.table(), ix).as_mut() }
    }

    /// Allocates and zeroes a table of `capacity` slots. The new table is
    /// unreachable until the caller swings the table slot, so plain
    /// writes suffice here.
    pub fn alloc_table(&mut self, heap: &mut dyn PHeap, capacity: u64) -> Result<PAddr> {
        let size = table_alloc_size(capacity);
        let t = alloc_ptr(heap, size, 64)?;
        unsafe {
            std::ptr::write_bytes(t.as_ptr(), 0, size);
            t.as_mut::<TableHeader>().capacity = capacity;
        }
        self.pers.persist(t.as_ptr(), size);
        Ok(t)
    }

    /// Publishes a freshly initialized table (pool creation).
    pub fn publish_initial(&mut self, table: PAddr) {
        unsafe {
            *self.table_slot.as_mut::<PAddr>() = table;
        }
        self.pers.persist(self.table_slot.as_ptr(), 8);
    }

    pub fn next_epoch(&mut self) -> u64 {
        unsafe {
            let cell = self.epoch_cell.as_mut::<u64>();
            let e = *cell;
            *cell = e + 1;
            self.pers.persist_obj(cell);
            e + 1
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Option<u64> {
        let cap = self.capacity();
        let hash = hash_key(key);
        let mask = cap - 1;
        let home = hash & mask;
        for i in 0..HOP_RANGE as u64 {
            let ix = (home + i) & mask;
            let e = self.entry(ix);
            if e.state == ENTRY_USED && e.hash == hash && e.key_len as usize == key.len() {
                let stored = unsafe { e.key.as_slice(key.len()) };
                if stored == key {
                    return Some(ix);
                }
            }
        }
        None
    }

    /// Finds an empty slot within the hop window of `hash`'s home,
    /// displacing entries toward the home if needed. `None` means the
    /// table needs a rehash.
    pub fn find_slot(&mut self, hash: u64) -> Option<u64> {
        let cap = self.capacity();
        let mask = cap - 1;
        let home = hash & mask;

        // nearest empty slot, scanning at most the whole table
        let mut empty = None;
        for i in 0..cap {
            let ix = (home + i) & mask;
            if self.entry(ix).state == ENTRY_EMPTY {
                empty = Some((ix, i));
                break;
            }
        }
        let (mut empty_ix, mut dist) = empty?;

        // hop-scotch: walk the hole back into the home window
        while dist >= HOP_RANGE as u64 {
            let mut moved = false;
            for back in (1..HOP_RANGE as u64).rev() {
                let cand_ix = (empty_ix + cap - back) & mask;
                let cand = self.entry(cand_ix);
                if cand.state != ENTRY_USED {
                    continue;
                }
                let cand_home = cand.hash & mask;
                // distance from the candidate's home to the hole
                let d = (empty_ix + cap - cand_home) & mask;
                if d < HOP_RANGE as u64 {
                    self.displace(cand_ix, empty_ix);
                    empty_ix = cand_ix;
                    dist = (empty_ix + cap - home) & mask;
                    moved = true;
                    break;
                }
            }
            if !moved {
                return None;
            }
        }
        Some(empty_ix)
    }

    /// Moves a live entry into an empty slot, journaled so a crash
    /// between the two state stores cannot leave the key visible twice.
    fn displace(&mut self, from_ix: u64, to_ix: u64) {
        let table = self.table();
        let from_addr = self.entry_addr(table, from_ix);
        let to_addr = self.entry_addr(table, to_ix);
        let disp = unsafe { self.disp.as_mut::<DispJournal>() };
        disp.from = from_addr;
        disp.to = to_addr;
        self.pers.persist_obj(disp);
        disp.valid = 1;
        self.pers.persist_obj(&disp.valid);

        unsafe {
            let from = from_addr.as_mut::<Entry>();
            let to = to_addr.as_mut::<Entry>();
            debug_assert_eq!(to.state, ENTRY_EMPTY);
            to.hash = from.hash;
            to.epoch = from.epoch;
            to.timestamp = from.timestamp;
            to.key = from.key;
            to.key_len = from.key_len;
            to.value = from.value;
            to.flags = from.flags;
            self.pers.persist_obj(to);
            to.state = ENTRY_USED;
            self.pers.persist_obj(&to.state);
            from.state = ENTRY_EMPTY;
            self.pers.persist_obj(&from.state);
        }

        disp.valid = 0;
        self.pers.persist_obj(&disp.valid);
    }

    /// Builds a doubled table and swings the root pointer to it. The
    /// caller must have the `extend` intent armed; both the old and the
    /// new table ride in its chain so a crash on either side of the
    /// swing reclaims exactly the unreachable one.
    pub fn rehash(&mut self, heap: &mut dyn PHeap, intents: &IntentSet) -> Result<()> {
        let old = self.table();
        let old_cap = self.capacity();
        let old_size = table_alloc_size(old_cap);
        let new_cap = old_cap * 2;

        unsafe {
            debug_assert!(intents.extend_rec().is_armed());
            intents
                .extend_rec()
                .record(old, old_size, 64, &self.pers);
        }
        // the allocation itself lands in the armed extend record
        let new = self.alloc_table(heap, new_cap)?;

        let mask = new_cap - 1;
        for ix in 0..old_cap {
            let e = self.entry_addr(old, ix);
            let e = unsafe { e.as_mut::<Entry>() };
            if e.state != ENTRY_USED {
                continue;
            }
            let home = e.hash & mask;
            let mut placed = false;
            for i in 0..HOP_RANGE as u64 {
                let nix = (home + i) & mask;
                let ne = unsafe { self.entry_addr(new, nix).as_mut::<Entry>() };
                if ne.state == ENTRY_EMPTY {
                    ne.state = ENTRY_USED;
                    ne.hash = e.hash;
                    ne.epoch = e.epoch;
                    ne.timestamp = e.timestamp;
                    ne.key = e.key;
                    ne.key_len = e.key_len;
                    ne.value = e.value;
                    ne.flags = e.flags;
                    placed = true;
                    break;
                }
            }
            if !placed {
                // doubling always leaves room in a hop window at half
                // load; not finding one means the table is damaged
                crate::error::corruption("rehash could not place an entry");
            }
        }
        self.pers.persist(new.as_ptr(), table_alloc_size(new_cap));

        unsafe {
            *self.table_slot.as_mut::<PAddr>() = new;
        }
        self.pers.persist(self.table_slot.as_ptr(), 8);

        heap.free(old, old_size, 64);
        Ok(())
    }

    /// Indices of live entries in insertion-epoch order; the snapshot
    /// iteration and `find` both start from this.
    pub fn snapshot(&self) -> Vec<(u64, u64)> {
        let cap = self.capacity();
        let mut v = Vec::new();
        for ix in 0..cap {
            let e = self.entry(ix);
            if e.state == ENTRY_USED {
                v.push((e.epoch, ix));
            }
        }
        v.sort_unstable();
        v
    }

    /// Recounts live entries (open time).
    pub fn recount(&mut self) {
        let cap = self.capacity();
        self.live = (0..cap)
            .filter(|&ix| self.entry(ix).state == ENTRY_USED)
            .count() as u64;
    }
}
