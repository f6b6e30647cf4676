//! Pool lifecycle and per-pool operations
//!
//! A pool is one region with a [`PoolRoot`] at its base: the
//! tracked-allocation anchor at offset 0, then the intent records, the
//! atomic-update record, the grow uuid vector, and (for the
//! crash-consistent flavor) the heap image. Everything else is reached
//! from the root by traversal.

use crate::atomic::{AtomicRecord, UpdateOp};
use crate::error::Error;
use crate::heap::cc::{CcHeap, CcImage};
use crate::heap::intent::{EmplaceRecord, ExtendGuard, ExtendRecord, IntentSet, PinRecord};
use crate::heap::rc::RcHeap;
use crate::heap::{PHeap, TrackedHeader, UuidVector};
use crate::persist::Persister;
use crate::ptr::PAddr;
use crate::region::{Region, RegionManager, Segment, REGION_GRAIN};
use crate::result::Result;
use crate::store::map::{
    value_bytes, DispJournal, Map, ValueRecord, ENTRY_EMPTY, ENTRY_USED,
};
use crate::store::FindExpr;
use crate::utils::{clp2, round_up};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const POOL_MAGIC: u64 = 0x706d_5354_4f52_4531; // "pmSTORE1"

pub const FLAVOR_RECONSTITUTING: u64 = 1;
pub const FLAVOR_CRASH_CONSISTENT: u64 = 2;

/// The persistent pool header at the base of the primary segment.
#[repr(C)]
pub struct PoolRoot {
    /// Tracked-allocation anchor; must stay at offset 0
    pub anchor: TrackedHeader,
    pub magic: u64,
    pub flavor: u64,
    pub initialized: u64,
    /// Root pointer to the entry table
    pub table: PAddr,
    /// Insertion-epoch counter
    pub epoch: u64,
    pub disp: DispJournal,
    pub ase: EmplaceRecord,
    pub asx: ExtendRecord,
    pub aspd: PinRecord,
    pub aspk: PinRecord,
    pub atomic: AtomicRecord,
    pub uuids: UuidVector,
    pub cc_image: CcImage,
}

/// Bytes at the front of the primary segment reserved for the root
fn root_reserve() -> usize {
    round_up(std::mem::size_of::<PoolRoot>(), 4096)
}

enum HeapFlavor<P: Persister> {
    Rc(RcHeap<P>),
    Cc(CcHeap<P>),
}

impl<P: Persister> HeapFlavor<P> {
    fn heap(&mut self) -> &mut dyn PHeap {
        match self {
            HeapFlavor::Rc(h) => h,
            HeapFlavor::Cc(h) => h,
        }
    }

    fn heap_ref(&self) -> &dyn PHeap {
        match self {
            HeapFlavor::Rc(h) => h,
            HeapFlavor::Cc(h) => h,
        }
    }
}

/// Advisory per-entry read/write locks; entries are identified by their
/// insertion epoch so displacement and rehash do not disturb held locks.
/// Purely volatile: locks never survive a restart.
pub struct LockTable {
    shards: Vec<(Mutex<HashMap<u64, LockState>>, Condvar)>,
}

#[derive(Default)]
struct LockState {
    readers: u32,
    writer: bool,
}

impl LockTable {
    pub fn new() -> Self {
        let n = num_cpus::get().max(1);
        Self {
            shards: (0..n)
                .map(|_| (Mutex::new(HashMap::new()), Condvar::new()))
                .collect(),
        }
    }

    fn shard(&self, id: u64) -> &(Mutex<HashMap<u64, LockState>>, Condvar) {
        &self.shards[(id as usize) % self.shards.len()]
    }

    /// `timeout` of `None` means do not block.
    pub fn acquire(&self, id: u64, write: bool, timeout: Option<Duration>) -> Result<()> {
        let (mtx, cv) = self.shard(id);
        let mut m = mtx.lock().unwrap();
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let st = m.entry(id).or_default();
            let free = if write {
                st.readers == 0 && !st.writer
            } else {
                !st.writer
            };
            if free {
                if write {
                    st.writer = true;
                } else {
                    st.readers += 1;
                }
                return Ok(());
            }
            match deadline {
                None => return Err(Error::WouldBlock),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Err(Error::Timeout);
                    }
                    let (g, t) = cv.wait_timeout(m, dl - now).unwrap();
                    m = g;
                    if t.timed_out() {
                        // re-check once, then expire without side effects
                        let st = m.entry(id).or_default();
                        let free = if write {
                            st.readers == 0 && !st.writer
                        } else {
                            !st.writer
                        };
                        if !free {
                            return Err(Error::Timeout);
                        }
                    }
                }
            }
        }
    }

    pub fn release(&self, id: u64, write: bool) -> Result<()> {
        let (mtx, cv) = self.shard(id);
        let mut m = mtx.lock().unwrap();
        let st = m.get_mut(&id).ok_or(Error::InvalidHandle)?;
        if write {
            if !st.writer {
                return Err(Error::InvalidHandle);
            }
            st.writer = false;
        } else {
            if st.readers == 0 {
                return Err(Error::InvalidHandle);
            }
            st.readers -= 1;
        }
        if st.readers == 0 && !st.writer {
            m.remove(&id);
        }
        cv.notify_all();
        Ok(())
    }
}

pub struct Pool<P: Persister> {
    name: String,
    rm: RegionManager,
    region: Region,
    extra: Vec<Region>,
    flavor: HeapFlavor<P>,
    map: Map<P>,
    intents: IntentSet,
    pers: P,
}

impl<P: Persister> Pool<P> {
    fn root(&self) -> &'static mut PoolRoot {
        unsafe { PAddr::new(self.region.base()).as_mut() }
    }

    fn wire(region: &Region, pers: P) -> (IntentSet, Map<P>) {
        let base = region.base();
        let root = unsafe { PAddr::new(base).as_ref::<PoolRoot>() };
        let intents = IntentSet {
            emplace: PAddr::from_ref(&root.ase),
            extend: PAddr::from_ref(&root.asx),
            pin_data: PAddr::from_ref(&root.aspd),
            pin_key: PAddr::from_ref(&root.aspk),
        };
        let map = Map::new(
            PAddr::from_ref(&root.table),
            PAddr::from_ref(&root.epoch),
            PAddr::from_ref(&root.disp),
            pers,
        );
        (intents, map)
    }

    fn heap_area(region: &Region) -> Vec<Segment> {
        let mut v = Vec::new();
        let segs = region.segments();
        let reserve = root_reserve();
        v.push(Segment {
            addr: segs[0].addr + reserve as u64,
            len: segs[0].len - reserve,
        });
        v.extend_from_slice(&segs[1..]);
        v
    }

    /// Creates and formats a pool; fails if the region exists.
    pub fn create(
        rm: &RegionManager,
        name: &str,
        size: usize,
        crash_consistent: bool,
        expected_obj_count: u64,
        pers: P,
    ) -> Result<Self> {
        if size < 2 * root_reserve() {
            return Err(Error::Invalid("pool size too small".into()));
        }
        let region = rm.create(name, size, 0)?;
        let root = unsafe { PAddr::new(region.base()).as_mut::<PoolRoot>() };

        TrackedHeader::init_anchor(&mut root.anchor, &pers);
        root.magic = POOL_MAGIC;
        root.flavor = if crash_consistent {
            FLAVOR_CRASH_CONSISTENT
        } else {
            FLAVOR_RECONSTITUTING
        };
        root.initialized = 0;
        root.table = PAddr::NULL;
        root.epoch = 0;
        pers.persist_obj(&root.magic);
        pers.persist_obj(&root.flavor);
        pers.persist_obj(&root.initialized);
        pers.persist_obj(&root.table);
        pers.persist_obj(&root.epoch);
        root.disp.init(&pers);
        root.ase.init(&pers);
        root.asx.init(&pers);
        root.aspd.init(&pers);
        root.aspk.init(&pers);
        root.atomic.init(&pers);
        root.uuids.init(&pers);
        root.cc_image.init(&pers);

        let (intents, mut map) = Self::wire(&region, pers.clone());
        let anchor = PAddr::new(region.base());
        let image = PAddr::from_ref(&root.cc_image);

        let mut flavor = if crash_consistent {
            HeapFlavor::Cc(CcHeap::new(image, intents, pers.clone()))
        } else {
            HeapFlavor::Rc(RcHeap::new(anchor, intents, pers.clone()))
        };
        for seg in Self::heap_area(&region) {
            flavor.heap().add_managed(seg);
        }

        let capacity = clp2(128.max(expected_obj_count as usize * 2)) as u64;
        let table = map.alloc_table(flavor.heap(), capacity)?;
        map.publish_initial(table);

        root.initialized = 1;
        pers.persist_obj(&root.initialized);
        crate::log!(Green, "FORMAT", "pool {} ({} slots)", name, capacity);

        Ok(Self {
            name: name.to_string(),
            rm: rm.clone(),
            region,
            extra: Vec::new(),
            flavor,
            map,
            intents,
            pers,
        })
    }

    /// Opens an existing pool and runs restart recovery.
    pub fn open(rm: &RegionManager, name: &str, pers: P) -> Result<Self> {
        let mut region = rm.open(name)?;
        let root = unsafe { PAddr::new(region.base()).as_mut::<PoolRoot>() };
        if root.magic != POOL_MAGIC || root.initialized != 1 {
            rm.close(&mut region);
            return Err(Error::NotFound);
        }
        let crash_consistent = match root.flavor {
            FLAVOR_CRASH_CONSISTENT => true,
            FLAVOR_RECONSTITUTING => false,
            _ => crate::error::corruption("pool header with unknown heap flavor"),
        };

        // additional regions registered by grow; a failure unwinds every
        // mapping made so far
        let mut extra: Vec<Region> = Vec::new();
        for uuid in root.uuids.iter().collect::<Vec<_>>() {
            let rname = format!("{:016x}", uuid);
            match rm.open(&rname) {
                Ok(r) => extra.push(r),
                Err(e) => {
                    for r in extra.iter_mut() {
                        rm.close(r);
                    }
                    rm.close(&mut region);
                    return Err(e);
                }
            }
        }

        let (intents, mut map) = Self::wire(&region, pers.clone());
        let anchor = PAddr::new(region.base());
        let image = PAddr::from_ref(&root.cc_image);

        let mut flavor = if crash_consistent {
            let heap = CcHeap::new(image, intents, pers.clone());
            // a half-drained metadata ring replays to the post-state
            root.cc_image.replay(&pers);
            HeapFlavor::Cc(heap)
        } else {
            let mut heap = RcHeap::new(anchor, intents, pers.clone());
            for seg in Self::heap_area(&region) {
                heap.add_managed(seg);
            }
            for r in &extra {
                for seg in r.segments() {
                    heap.add_managed(*seg);
                }
            }
            HeapFlavor::Rc(heap)
        };

        if root.table.is_null() {
            crate::error::corruption("pool has no entry table");
        }

        // 1. a displacement caught mid-move
        root.disp.recover(&pers);
        // 2. pins: put the client pointers back
        root.aspd.recover(&pers);
        root.aspk.recover(&pers);
        // 3. reconstitution: the tracked list re-declares every survivor
        if !crash_consistent {
            Self::reconstitute(root, &mut flavor);
        }
        // 4. an interrupted replace/swap replays forward
        root.atomic.redo(flavor.heap(), &pers);
        // 5. armed allocation intents: reclaim whatever nothing owns
        Self::recover_intents(root, &mut flavor, &map, &pers);
        map.recount();
        crate::log!(Green, "RECOVER", "pool {} with {} live entries", name, map.live);

        Ok(Self {
            name: name.to_string(),
            rm: rm.clone(),
            region,
            extra,
            flavor,
            map,
            intents,
            pers,
        })
    }

    /// True if the table or a live entry owns the block at `addr`.
    fn owns(map: &Map<P>, addr: PAddr) -> bool {
        if addr == map.table() {
            return true;
        }
        let cap = map.capacity();
        for ix in 0..cap {
            let e = map.entry(ix);
            if e.state == ENTRY_USED && (e.key == addr || e.value == addr) {
                return true;
            }
        }
        false
    }

    /// Reclaims whatever an armed intent recorded that nothing reachable
    /// owns. A block already back in the free space (or, in the
    /// reconstituting flavor, one that never joined the tracked list and
    /// so was never injected) reads as free and is skipped.
    fn recover_intents(root: &mut PoolRoot, flavor: &mut HeapFlavor<P>, map: &Map<P>, pers: &P) {
        let heap = flavor.heap();
        if let Some((value, size, align)) = root.ase.recorded() {
            if !Self::owns(map, value) {
                if !heap.is_free(value) {
                    heap.free(value, size, align);
                }
                let slot = root.ase.slot();
                if !slot.is_null() {
                    unsafe {
                        *slot.as_mut::<PAddr>() = PAddr::NULL;
                    }
                    pers.persist(slot.as_ptr(), 8);
                }
            }
        }
        if root.ase.is_armed() {
            root.ase.disarm(pers);
        }

        let items: Vec<_> = root.asx.items().to_vec();
        for it in items {
            if it.addr.is_null() {
                crate::error::corruption("extend intent recorded a null block");
            }
            if !Self::owns(map, it.addr) && !heap.is_free(it.addr) {
                heap.free(it.addr, it.size as usize, it.align as usize);
            }
        }
        if root.asx.is_armed() {
            root.asx.disarm(pers);
        }
    }

    /// RC flavor: walk the tracked-allocation list, injecting every
    /// surviving allocation into the rebuilt-from-scratch free space.
    /// The table and all key/value payloads are tracked allocations, so
    /// the list is the whole story.
    fn reconstitute(root: &mut PoolRoot, flavor: &mut HeapFlavor<P>) {
        let heap = flavor.heap();
        TrackedHeader::recover(&mut root.anchor, |base, size| {
            heap.inject(base, size, 8);
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn count(&self) -> u64 {
        self.map.live
    }

    pub fn size(&self) -> usize {
        self.region.len() + self.extra.iter().map(|r| r.len()).sum::<usize>()
    }

    pub fn percent_used(&self) -> u32 {
        self.flavor.heap_ref().percent_used()
    }

    /// Grows the pool by registering one more region. The uuid slot is
    /// persisted before the count, so a crash leaves the new region
    /// either unregistered (lost, reclaimed out-of-band) or fully
    /// registered.
    pub fn grow(&mut self, increment: usize) -> Result<usize> {
        if increment == 0 {
            return Ok(self.size());
        }
        // buddy carving wants self-aligned blocks; give the region a
        // power-of-two size so one spans the whole request
        let size = clp2(increment.max(REGION_GRAIN));
        let uuid = self.region.id().wrapping_add(self.root().uuids.len + 1);
        let rname = format!("{:016x}", uuid);
        let r = self.rm.create(&rname, size, self.region.numa_node())?;
        self.root().uuids.push(uuid, &self.pers)?;
        crate::log!(Yellow, "GROW", "pool {} by {} bytes (region {})", self.name, size, rname);
        for seg in r.segments() {
            self.flavor.heap().add_managed(*seg);
        }
        self.extra.push(r);
        Ok(self.size())
    }

    /// Growth for a failed allocation of `needed` bytes; padded so the
    /// rounding and tracked-header overhead above `needed` still fit in
    /// the new region.
    fn grow_for(&mut self, needed: usize) -> Result<usize> {
        self.grow(clp2(needed + 4096))
    }

    fn ensure_headroom(&mut self) -> Result<()> {
        let cap = self.map.capacity();
        if (self.map.live + 1) * crate::store::map::LOAD_DEN
            >= cap * crate::store::map::LOAD_NUM
        {
            self.rehash()?;
        }
        Ok(())
    }

    fn rehash(&mut self) -> Result<()> {
        let guard = ExtendGuard::arm(
            unsafe { self.intents.extend_rec() },
            self.pers.clone(),
        );
        let r = self.map.rehash(self.flavor.heap(), &self.intents);
        if r.is_ok() {
            guard.commit();
        }
        r
    }

    pub fn put(&mut self, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Invalid("empty key".into()));
        }
        if let Some(ix) = self.map.lookup(key) {
            if flags & crate::store::flags::DONT_STOMP != 0 {
                return Err(Error::AlreadyExists);
            }
            return self.replace_at(ix, value, 0, 0);
        }
        self.insert_new(key, value, flags)
    }

    fn replace_at(
        &mut self,
        ix: u64,
        bytes: &[u8],
        zero_extend: usize,
        align: usize,
    ) -> Result<()> {
        let needed = ValueRecord::layout(bytes.len() + zero_extend, align).0;
        let mut grown = false;
        loop {
            let r = self.root().atomic.replace(
                self.flavor.heap(),
                &self.intents,
                self.map.entry(ix),
                bytes,
                zero_extend,
                align,
                &self.pers,
            );
            match r {
                Err(Error::NoSpace) if !grown => {
                    grown = true;
                    self.grow_for(needed)?;
                }
                r => return r,
            }
        }
    }

    fn insert_new(&mut self, key: &[u8], value: &[u8], flags: u32) -> Result<()> {
        self.ensure_headroom()?;
        let hash = crate::store::map::hash_key(key);
        let ix = match self.map.find_slot(hash) {
            Some(ix) => ix,
            None => {
                self.rehash()?;
                self.map.find_slot(hash).ok_or(Error::NoSpace)?
            }
        };

        let epoch = self.map.next_epoch();
        let e = self.map.entry(ix);
        debug_assert_eq!(e.state, ENTRY_EMPTY);
        e.hash = hash;
        e.epoch = epoch;
        e.timestamp = crate::ll::rdtsc();
        e.key = PAddr::NULL;
        e.key_len = key.len() as u64;
        e.value = PAddr::NULL;
        e.flags = flags as u64;
        self.pers.persist_obj(e);

        let guard = ExtendGuard::arm(
            unsafe { self.intents.extend_rec() },
            self.pers.clone(),
        );
        match self.emplace_payloads(ix, key, value) {
            Ok(()) => {
                let e = self.map.entry(ix);
                e.state = ENTRY_USED;
                self.pers.persist_obj(&e.state);
                guard.commit();
                self.map.live += 1;
                Ok(())
            }
            Err(err) => {
                // roll the partial emplace back at runtime; the guard
                // disarms on the way out
                let e = self.map.entry(ix);
                if !e.key.is_null() {
                    self.flavor.heap().free(e.key, key.len(), 1);
                    e.key = PAddr::NULL;
                }
                if !e.value.is_null() {
                    let (total, _, av) = ValueRecord::layout(value.len(), 0);
                    self.flavor.heap().free(e.value, total, av);
                    e.value = PAddr::NULL;
                }
                self.pers.persist_obj(e);
                Err(err)
            }
        }
    }

    fn emplace_payloads(&mut self, ix: u64, key: &[u8], value: &[u8]) -> Result<()> {
        self.alloc_with_grow(ix, key.len(), 1, true)?;
        let e = self.map.entry(ix);
        unsafe {
            e.key.as_slice_mut(key.len()).copy_from_slice(key);
        }
        self.pers.persist(e.key.as_ptr(), key.len());

        let (total, data_off, align_v) = ValueRecord::layout(value.len(), 0);
        self.alloc_with_grow(ix, total, align_v, false)?;
        let e = self.map.entry(ix);
        unsafe {
            let rec = e.value.as_mut::<ValueRecord>();
            rec.len = value.len() as u64;
            rec.align = align_v as u64;
            e.value
                .add(data_off as u64)
                .as_slice_mut(value.len())
                .copy_from_slice(value);
        }
        self.pers.persist(e.value.as_ptr(), total);
        Ok(())
    }

    /// Allocates into an entry's key or value slot, growing the pool
    /// once if the heap is exhausted.
    fn alloc_with_grow(&mut self, ix: u64, size: usize, align: usize, key_slot: bool) -> Result<()> {
        for attempt in 0..2 {
            let e = self.map.entry(ix);
            let slot = if key_slot { &mut e.key } else { &mut e.value };
            match self.flavor.heap().alloc(slot, size, align) {
                Ok(()) => return Ok(()),
                Err(Error::NoSpace) if attempt == 0 => {
                    self.grow_for(size)?;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::NoSpace)
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let e = self.map.entry(ix);
        Ok(unsafe { value_bytes(e.value) }.to_vec())
    }

    pub fn get_direct(&self, key: &[u8], out: &mut [u8]) -> Result<usize> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let e = self.map.entry(ix);
        let v = unsafe { value_bytes(e.value) };
        if out.len() < v.len() {
            return Err(Error::Invalid("output buffer too small".into()));
        }
        out[..v.len()].copy_from_slice(v);
        Ok(v.len())
    }

    pub fn value_len(&self, key: &[u8]) -> Result<usize> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let e = self.map.entry(ix);
        Ok(unsafe { e.value.as_ref::<ValueRecord>() }.len as usize)
    }

    pub fn timestamp(&self, key: &[u8]) -> Result<u64> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        Ok(self.map.entry(ix).timestamp)
    }

    pub fn checksum(&self, key: &[u8]) -> Result<u32> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let e = self.map.entry(ix);
        Ok(crate::utils::crc32(unsafe { value_bytes(e.value) }))
    }

    pub fn erase(&mut self, key: &[u8]) -> Result<()> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let e = self.map.entry(ix);
        let key_addr = e.key;
        let key_len = e.key_len as usize;
        let val_addr = e.value;
        let vrec = unsafe { val_addr.as_ref::<ValueRecord>() };
        let val_size = vrec.total_size();
        let val_align = vrec.align as usize;

        let mut guard = ExtendGuard::arm(
            unsafe { self.intents.extend_rec() },
            self.pers.clone(),
        );
        guard.record(key_addr, key_len, 1);
        guard.record(val_addr, val_size, val_align);

        e.state = ENTRY_EMPTY;
        self.pers.persist_obj(&e.state);

        let heap = self.flavor.heap();
        heap.free(key_addr, key_len, 1);
        heap.free(val_addr, val_size, val_align);

        guard.commit();
        self.map.live -= 1;
        Ok(())
    }

    pub fn swap(&mut self, key_a: &[u8], key_b: &[u8]) -> Result<()> {
        let ia = self.map.lookup(key_a).ok_or(Error::NotFound)?;
        let ib = self.map.lookup(key_b).ok_or(Error::NotFound)?;
        if ia == ib {
            return Ok(());
        }
        let a = self.map.entry(ia);
        let b = self.map.entry(ib);
        self.root().atomic.swap(a, b, &self.pers);
        Ok(())
    }

    pub fn atomic_update(&mut self, key: &[u8], ops: &[UpdateOp<'_>]) -> Result<()> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let old_len = {
            let e = self.map.entry(ix);
            unsafe { e.value.as_ref::<ValueRecord>() }.len as usize
        };
        let needed = ops
            .iter()
            .map(|op| op.end())
            .chain(std::iter::once(old_len))
            .max()
            .unwrap_or(0);
        let needed = ValueRecord::layout(needed, 0).0;
        let mut grown = false;
        loop {
            let r = self.root().atomic.update_vector(
                self.flavor.heap(),
                &self.intents,
                self.map.entry(ix),
                ops,
                &self.pers,
            );
            match r {
                Err(Error::NoSpace) if !grown => {
                    grown = true;
                    self.grow_for(needed)?;
                }
                r => return r,
            }
        }
    }

    pub fn replace(
        &mut self,
        key: &[u8],
        bytes: &[u8],
        zero_extend: usize,
        align: usize,
    ) -> Result<()> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        self.replace_at(ix, bytes, zero_extend, align)
    }

    /// Epoch identifying an entry for the advisory lock table.
    pub fn entry_id(&self, key: &[u8]) -> Result<u64> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        Ok(self.map.entry(ix).epoch)
    }

    /// Pins an entry's key and value pointers for the duration of a
    /// write lock: a crash while the holder scribbles on them restores
    /// the saved pointers. One pin of each kind exists per pool, so a
    /// second concurrent holder simply goes unpinned.
    pub fn pin_entry(&mut self, key: &[u8]) -> Result<bool> {
        let ix = self.map.lookup(key).ok_or(Error::NotFound)?;
        let e = self.map.entry(ix);
        unsafe {
            let aspd = self.intents.pin_data_rec();
            let aspk = self.intents.pin_key_rec();
            if aspd.is_armed() || aspk.is_armed() {
                return Ok(false);
            }
            aspd.arm(PAddr::from_ref(&e.value), &self.pers);
            aspk.arm(PAddr::from_ref(&e.key), &self.pers);
        }
        Ok(true)
    }

    pub fn unpin_entry(&mut self) {
        unsafe {
            self.intents.pin_data_rec().disarm(&self.pers);
            self.intents.pin_key_rec().disarm(&self.pers);
        }
    }

    /// Iteration in insertion-epoch order, snapshotted against erase.
    pub fn map_entries<F: FnMut(&[u8], &[u8], u64)>(&self, mut f: F) {
        for (epoch, ix) in self.map.snapshot() {
            let e = self.map.entry(ix);
            if e.state != ENTRY_USED || e.epoch != epoch {
                continue;
            }
            let k = unsafe { e.key.as_slice(e.key_len as usize) };
            let v = unsafe { value_bytes(e.value) };
            f(k, v, e.timestamp);
        }
    }

    pub fn map_keys<F: FnMut(&[u8])>(&self, mut f: F) {
        self.map_entries(|k, _, _| f(k));
    }

    /// Scans keys whose insertion epoch is at least `offset`, in epoch
    /// order, returning the first match and the cursor to resume after
    /// it.
    pub fn find(&self, expr: &FindExpr, offset: u64) -> Result<(Vec<u8>, u64)> {
        for (epoch, ix) in self.map.snapshot() {
            if epoch < offset {
                continue;
            }
            let e = self.map.entry(ix);
            if e.state != ENTRY_USED || e.epoch != epoch {
                continue;
            }
            let k = unsafe { e.key.as_slice(e.key_len as usize) };
            if expr.matches(k) {
                return Ok((k.to_vec(), epoch + 1));
            }
        }
        Err(Error::NotFound)
    }

    pub fn close(mut self) {
        for mut r in self.extra.drain(..) {
            self.rm.close(&mut r);
        }
        self.rm.close(&mut self.region);
    }

    /// Region names to erase when the pool is deleted.
    pub fn region_names(&self) -> Vec<String> {
        let mut v = vec![self.name.clone()];
        for uuid in self.root().uuids.iter() {
            v.push(format!("{:016x}", uuid));
        }
        v
    }
}

#[cfg(test)]
impl<P: Persister> Pool<P> {
    pub(crate) fn allocated_bytes(&self) -> usize {
        self.flavor.heap_ref().allocated()
    }

    /// Sum of the block sizes threaded through the tracked list.
    pub(crate) fn tracked_bytes(&self) -> usize {
        let root = self.root();
        let anchor_addr = PAddr::from_ref(&root.anchor);
        let mut sum = 0usize;
        let mut cur = root.anchor.next;
        while cur != anchor_addr {
            let h = unsafe { cur.as_ref::<TrackedHeader>() };
            sum += h.size as usize;
            cur = h.next;
        }
        sum
    }

    /// Leaves the pool exactly as a power failure would: no disarm, no
    /// flush beyond what already happened, region unmapped.
    pub(crate) fn crash(self) {
        self.close()
    }

    /// Simulates an insert interrupted after both payload allocations
    /// but before the entry becomes visible.
    pub(crate) fn interrupted_insert(&mut self, key: &[u8], value: &[u8]) {
        let hash = crate::store::map::hash_key(key);
        let ix = self.map.find_slot(hash).unwrap();
        let epoch = self.map.next_epoch();
        let e = self.map.entry(ix);
        e.hash = hash;
        e.epoch = epoch;
        e.timestamp = crate::ll::rdtsc();
        e.key = PAddr::NULL;
        e.key_len = key.len() as u64;
        e.value = PAddr::NULL;
        e.flags = 0;
        self.pers.persist_obj(e);
        unsafe {
            self.intents.extend_rec().arm(&self.pers);
        }
        self.emplace_payloads(ix, key, value).unwrap();
        // crash here: state never becomes USED, intent never disarms
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::persist::{NoOp, Recording};
    use std::path::PathBuf;

    fn tmpdir(tag: &str) -> PathBuf {
        let d = std::env::temp_dir().join(format!("pmstore-pool-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&d);
        d
    }

    const MB: usize = 1 << 20;

    fn fresh<P: Persister>(tag: &str, cc: bool, pers: P) -> (RegionManager, Pool<P>) {
        let rm = RegionManager::new(tmpdir(tag)).unwrap();
        let pool = Pool::create(&rm, "p", 4 * MB, cc, 100, pers).unwrap();
        (rm, pool)
    }

    #[test]
    fn reopen_preserves_entries_rc() {
        reopen_preserves_entries(false, "reopen-rc");
    }

    #[test]
    fn reopen_preserves_entries_cc() {
        reopen_preserves_entries(true, "reopen-cc");
    }

    fn reopen_preserves_entries(cc: bool, tag: &str) {
        let (rm, mut pool) = fresh(tag, cc, NoOp);
        for i in 0..100 {
            let k = format!("key{}", i);
            let v = format!("value-{}", i * 7);
            pool.put(k.as_bytes(), v.as_bytes(), 0).unwrap();
        }
        pool.erase(b"key50").unwrap();
        pool.close();

        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.count(), 99);
        assert_eq!(pool.get(b"key7").unwrap(), b"value-49");
        assert_eq!(pool.get(b"key50").unwrap_err(), Error::NotFound);
        pool.close();

        // twice, for the create -> open -> close -> open -> close trip
        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.count(), 99);
        pool.close();
    }

    #[test]
    fn unpublished_insert_is_reclaimed_rc() {
        unpublished_insert_is_reclaimed(false, "leak-rc");
    }

    #[test]
    fn unpublished_insert_is_reclaimed_cc() {
        unpublished_insert_is_reclaimed(true, "leak-cc");
    }

    fn unpublished_insert_is_reclaimed(cc: bool, tag: &str) {
        let (rm, mut pool) = fresh(tag, cc, NoOp);
        pool.put(b"hello", b"world", 0).unwrap();
        pool.close();

        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        let baseline = pool.allocated_bytes();
        let mut pool = pool;
        pool.interrupted_insert(b"doomed", &[7u8; 1000]);
        pool.crash();

        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.get(b"doomed").unwrap_err(), Error::NotFound);
        assert_eq!(pool.get(b"hello").unwrap(), b"world");
        assert_eq!(pool.count(), 1);
        assert_eq!(pool.allocated_bytes(), baseline);
        pool.close();
    }

    #[test]
    fn atomic_update_is_all_or_nothing_across_crashes() {
        // drive the same update into a simulated power failure at every
        // drain boundary; the value must always read old or new
        for k in 1..40 {
            let tag = format!("atomic-{}", k);
            let rm = RegionManager::new(tmpdir(&tag)).unwrap();
            let pers = Recording::new();
            let mut pool = Pool::create(&rm, "p", 4 * MB, false, 16, pers.clone()).unwrap();
            pool.put(b"k", b"AAAAAAAA", 0).unwrap();

            pers.crash_after_drains(k);
            let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                pool.atomic_update(
                    b"k",
                    &[
                        UpdateOp::Write { offset: 0, bytes: b"B" },
                        UpdateOp::Write { offset: 4, bytes: b"C" },
                    ],
                )
            }));
            pers.crash_after_drains(0);
            pool.crash();

            let pool = Pool::open(&rm, "p", Recording::new()).unwrap();
            let v = pool.get(b"k").unwrap();
            if r.is_ok() {
                assert_eq!(v, b"BAAACAAA");
            } else {
                assert!(
                    v == b"AAAAAAAA" || v == b"BAAACAAA",
                    "torn value after crash #{}: {:?}",
                    k,
                    v
                );
            }
            pool.close();
        }
    }

    #[test]
    fn swap_is_never_mixed_across_crashes() {
        for k in 1..16 {
            let tag = format!("swap-{}", k);
            let rm = RegionManager::new(tmpdir(&tag)).unwrap();
            let pers = Recording::new();
            let mut pool = Pool::create(&rm, "p", 4 * MB, false, 16, pers.clone()).unwrap();
            pool.put(b"k1", b"v1", 0).unwrap();
            pool.put(b"k2", b"v2", 0).unwrap();

            pers.crash_after_drains(k);
            let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                pool.swap(b"k1", b"k2")
            }));
            pers.crash_after_drains(0);
            pool.crash();

            let pool = Pool::open(&rm, "p", Recording::new()).unwrap();
            let a = pool.get(b"k1").unwrap();
            let b = pool.get(b"k2").unwrap();
            if r.is_ok() {
                assert_eq!((a.as_slice(), b.as_slice()), (&b"v2"[..], &b"v1"[..]));
            } else {
                let pre = a == b"v1" && b == b"v2";
                let post = a == b"v2" && b == b"v1";
                assert!(pre || post, "mixed swap after crash #{}", k);
            }
            pool.close();
        }
    }

    #[test]
    fn tracked_list_accounts_for_allocated_bytes() {
        let (rm, mut pool) = fresh("tracked-sum", false, NoOp);
        for i in 0..40usize {
            let v = vec![i as u8; 100 + i];
            pool.put(format!("k{}", i).as_bytes(), &v, 0).unwrap();
        }
        pool.erase(b"k7").unwrap();
        pool.erase(b"k31").unwrap();
        assert_eq!(pool.tracked_bytes(), pool.allocated_bytes());
        pool.close();

        // the equality survives a reconstituting reopen
        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.tracked_bytes(), pool.allocated_bytes());
        assert_eq!(pool.get(b"k8").unwrap(), vec![8u8; 108]);
        pool.close();
    }

    #[test]
    fn erase_reclaims_value_bytes() {
        let (rm, mut pool) = fresh("erase", true, NoOp);
        let baseline = pool.allocated_bytes();
        pool.put(b"k", &[9u8; 4096], 0).unwrap();
        assert!(pool.allocated_bytes() > baseline);
        pool.erase(b"k").unwrap();
        assert_eq!(pool.allocated_bytes(), baseline);
        assert_eq!(pool.get(b"k").unwrap_err(), Error::NotFound);
        pool.close();
        let _ = rm;
    }

    #[test]
    fn rehash_keeps_everything_reachable() {
        let (rm, mut pool) = fresh("rehash", false, NoOp);
        // the initial table holds 256 slots for expected 100; push past
        // the load threshold several times
        for i in 0..2000 {
            pool.put(format!("key-{}", i).as_bytes(), b"x", 0).unwrap();
        }
        for i in (0..2000).step_by(97) {
            assert_eq!(pool.get(format!("key-{}", i).as_bytes()).unwrap(), b"x");
        }
        assert_eq!(pool.count(), 2000);
        pool.close();
        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.count(), 2000);
        assert_eq!(pool.get(b"key-1999").unwrap(), b"x");
        pool.close();
    }

    #[test]
    fn value_bigger_than_pool_triggers_grow() {
        for cc in [false, true] {
            let tag = format!("grow-{}", cc);
            let rm = RegionManager::new(tmpdir(&tag)).unwrap();
            let mut pool = Pool::create(&rm, "p", 16 * MB, cc, 16, NoOp).unwrap();
            let big = vec![0xabu8; 20 * MB];
            pool.put(b"big", &big, 0).unwrap();
            assert!(pool.size() > 16 * MB);
            assert_eq!(pool.get(b"big").unwrap(), big);
            pool.close();

            let pool = Pool::open(&rm, "p", NoOp).unwrap();
            assert_eq!(pool.get(b"big").unwrap(), big);
            pool.close();
        }
    }

    #[test]
    fn zero_length_value_roundtrips() {
        let (rm, mut pool) = fresh("zerolen", false, NoOp);
        pool.put(b"empty", b"", 0).unwrap();
        assert_eq!(pool.get(b"empty").unwrap(), b"");
        pool.close();
        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.get(b"empty").unwrap(), b"");
        pool.close();
    }

    #[test]
    fn iteration_is_insertion_ordered_and_erase_stable() {
        let (_rm, mut pool) = fresh("iter", false, NoOp);
        for i in 0..10 {
            pool.put(format!("k{}", i).as_bytes(), b"v", 0).unwrap();
        }
        pool.erase(b"k3").unwrap();
        let mut seen = Vec::new();
        pool.map_keys(|k| seen.push(String::from_utf8_lossy(k).into_owned()));
        assert_eq!(seen.len(), 9);
        let expected: Vec<String> = (0..10)
            .filter(|&i| i != 3)
            .map(|i| format!("k{}", i))
            .collect();
        assert_eq!(seen, expected);
        pool.close();
    }

    #[test]
    fn pinned_pointers_are_restored_after_crash() {
        let (rm, mut pool) = fresh("pin", false, NoOp);
        pool.put(b"k", b"stable", 0).unwrap();
        pool.put(b"k2", b"other", 0).unwrap();
        assert!(pool.pin_entry(b"k").unwrap());
        // one pin of each kind per pool
        assert!(!pool.pin_entry(b"k2").unwrap());

        // the holder scribbles on the pinned value pointer, then power
        // fails before it can publish anything coherent
        {
            let ix = pool.map.lookup(b"k").unwrap();
            let e = pool.map.entry(ix);
            e.value = PAddr::new(0xdead_beef_00);
        }
        pool.crash();

        let pool = Pool::open(&rm, "p", NoOp).unwrap();
        assert_eq!(pool.get(b"k").unwrap(), b"stable");
        assert_eq!(pool.get(b"k2").unwrap(), b"other");
        pool.close();
    }

    #[test]
    fn find_resumes_by_epoch() {
        let (_rm, mut pool) = fresh("find", false, NoOp);
        for i in 0..5 {
            pool.put(format!("k{}", i).as_bytes(), b"v", 0).unwrap();
        }
        let expr = FindExpr::Prefix(b"k".to_vec());
        let mut offset = 0;
        let mut found = Vec::new();
        while let Ok((key, next)) = pool.find(&expr, offset) {
            found.push(key);
            offset = next;
        }
        assert_eq!(found.len(), 5);
        assert_eq!(found[0], b"k0");
        assert_eq!(found[4], b"k4");
        pool.close();
    }
}
