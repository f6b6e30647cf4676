//! The crash-consistent heap
//!
//! Free space is kept as buddy lists *inside* the managed region: one
//! list per power-of-two class, every block aligned to its own size, the
//! first word of a free block linking to the next. Metadata never goes
//! through a transaction log; instead each operation queues its pointer
//! writes in a small persistent ring and materializes them under a
//! validity flag, so a restart replays a half-drained ring to exactly the
//! post-state and discards an unsealed one.
//!
//! The allocation protocol is the armed-intent one: the caller arms an
//! intent record, the heap records the carved block there before it
//! drains the metadata writes, then publishes the block address into the
//! caller's slot; the caller disarms once the block is reachable. A
//! crash anywhere in between leaves the block to the intent record.

use super::intent::IntentSet;
use super::{alloc_rounding, PHeap};
use crate::error::Error;
use crate::hist::HistogramLog2;
use crate::persist::Persister;
use crate::ptr::PAddr;
use crate::region::Segment;
use crate::result::Result;
use crate::utils::clp2;

/// Pending pointer writes of one metadata operation
pub const AUX_SLOTS: usize = 256;

const CLASSES: usize = 64;

/// Size class of an allocation: blocks are powers of two, large enough
/// for the cleaned size and alignment, never smaller than a free-block
/// link.
#[inline]
pub fn cc_class(size: usize, align: usize) -> usize {
    let (sz, al) = alloc_rounding(size, align);
    let len = clp2(sz.max(al));
    len.trailing_zeros() as usize
}

#[repr(C)]
struct AuxRing {
    len: u64,
    data: [[u64; 2]; AUX_SLOTS],
}

/// The persistent image of the heap, embedded in the pool header.
#[repr(C)]
pub struct CcImage {
    buddies: [PAddr; CLASSES],
    size: u64,
    available: u64,
    available_log: u64,
    aux_valid: u64,
    aux: AuxRing,
}

impl CcImage {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.buddies = [PAddr::NULL; CLASSES];
        self.size = 0;
        self.available = 0;
        self.available_log = 0;
        self.aux_valid = 0;
        self.aux.len = 0;
        pers.persist_obj(self);
    }

    /// Replays a half-drained ring after a crash. Entries are plain
    /// pointer writes, so replay is idempotent.
    pub fn replay<P: Persister>(&mut self, pers: &P) {
        if self.aux_valid == 0 {
            return;
        }
        if self.aux.len as usize > AUX_SLOTS {
            crate::error::corruption("heap aux ring length out of range");
        }
        for i in 0..self.aux.len as usize {
            let [addr, val] = self.aux.data[i];
            unsafe {
                *(addr as *mut u64) = val;
            }
            pers.persist(addr as *const u8, 8);
        }
        self.available = self.available_log;
        pers.persist_obj(&self.available);
        self.aux_valid = 0;
        pers.persist_obj(&self.aux_valid);
        self.aux.len = 0;
        pers.persist_obj(&self.aux.len);
    }
}

pub struct CcHeap<P: Persister> {
    image: PAddr,
    intents: IntentSet,
    pers: P,
    hist_alloc: HistogramLog2,
    hist_free: HistogramLog2,
    hist_inject: HistogramLog2,
}

impl<P: Persister> CcHeap<P> {
    pub fn new(image: PAddr, intents: IntentSet, pers: P) -> Self {
        Self {
            image,
            intents,
            pers,
            hist_alloc: HistogramLog2::new(),
            hist_free: HistogramLog2::new(),
            hist_inject: HistogramLog2::new(),
        }
    }

    #[inline]
    fn img(&self) -> &'static mut CcImage {
        unsafe { self.image.as_mut() }
    }

    /// Reads a pointer cell through the pending writes, so one operation
    /// can touch the same list more than once.
    fn get(&self, cell: u64) -> PAddr {
        let img = self.img();
        for i in (0..img.aux.len as usize).rev() {
            if img.aux.data[i][0] == cell {
                return PAddr::new(img.aux.data[i][1]);
            }
        }
        unsafe { *(cell as *const PAddr) }
    }

    /// Queues a pointer write for the next drain.
    fn put(&mut self, cell: u64, val: PAddr) {
        let img = self.img();
        let ix = img.aux.len as usize;
        assert!(ix < AUX_SLOTS, "heap aux ring overflow");
        img.aux.data[ix] = [cell, val.addr()];
        img.aux.len = (ix + 1) as u64;
    }

    fn head_cell(&self, class: usize) -> u64 {
        &self.img().buddies[class] as *const PAddr as u64
    }

    fn next_cell(block: PAddr) -> u64 {
        block.addr()
    }

    /// Seals the queued writes and materializes them.
    fn perform(&mut self, new_available: u64) {
        let img = self.img();
        img.available_log = new_available;
        self.pers.persist_obj(&img.aux);
        self.pers.persist_obj(&img.available_log);
        img.aux_valid = 1;
        self.pers.persist_obj(&img.aux_valid);

        for i in 0..img.aux.len as usize {
            let [addr, val] = img.aux.data[i];
            unsafe {
                *(addr as *mut u64) = val;
            }
            self.pers.persist(addr as *const u8, 8);
        }
        img.available = img.available_log;
        self.pers.persist_obj(&img.available);
        img.aux_valid = 0;
        self.pers.persist_obj(&img.aux_valid);
        img.aux.len = 0;
        self.pers.persist_obj(&img.aux.len);
    }

    fn discard(&mut self) {
        self.img().aux.len = 0;
    }

    /// Pops a block of `class`, splitting larger blocks downward.
    fn find_free(&mut self, class: usize) -> Option<PAddr> {
        let mut j = class;
        while j < CLASSES && self.get(self.head_cell(j)).is_null() {
            j += 1;
        }
        if j == CLASSES {
            return None;
        }
        let block = self.get(self.head_cell(j));
        self.put(self.head_cell(j), self.get(Self::next_cell(block)));
        while j > class {
            j -= 1;
            let half = block.add(1 << j);
            self.put(Self::next_cell(half), self.get(self.head_cell(j)));
            self.put(self.head_cell(j), half);
        }
        Some(block)
    }

    /// Returns a block to its list, merging buddies upward.
    fn insert_free(&mut self, mut block: PAddr, mut class: usize) {
        loop {
            let buddy = PAddr::new(block.addr() ^ (1u64 << class));
            // hunt the buddy in this class's list
            let mut prev_cell = self.head_cell(class);
            let mut cur = self.get(prev_cell);
            let mut merged = false;
            while !cur.is_null() {
                if cur == buddy {
                    self.put(prev_cell, self.get(Self::next_cell(cur)));
                    block = PAddr::new(block.addr().min(buddy.addr()));
                    class += 1;
                    merged = true;
                    break;
                }
                prev_cell = Self::next_cell(cur);
                cur = self.get(prev_cell);
            }
            if !merged || class + 1 == CLASSES {
                break;
            }
        }
        self.put(Self::next_cell(block), self.get(self.head_cell(class)));
        self.put(self.head_cell(class), block);
    }

    /// Greedy self-aligned decomposition of an arbitrary range.
    fn seed_range(&mut self, mut addr: u64, mut len: usize) {
        while len >= 8 {
            let align_class = if addr == 0 { 63 } else { addr.trailing_zeros() as usize };
            let fit_class = 63 - (len as u64).leading_zeros() as usize;
            let class = align_class.min(fit_class);
            let block = PAddr::new(addr);
            self.put(Self::next_cell(block), self.get(self.head_cell(class)));
            self.put(self.head_cell(class), block);
            addr += 1u64 << class;
            len -= 1usize << class;
        }
    }

    fn oom(&self) -> Error {
        self.write_hist();
        Error::NoSpace
    }

    fn alloc_block(&mut self, class: usize) -> Result<PAddr> {
        let len = 1u64 << class;
        if len > self.img().available {
            self.discard();
            return Err(self.oom());
        }
        match self.find_free(class) {
            Some(b) => Ok(b),
            None => {
                eprintln!(
                    "Cannot find memory slot of size {} (available: {})",
                    len,
                    self.img().available
                );
                self.discard();
                Err(self.oom())
            }
        }
    }
}

impl<P: Persister> PHeap for CcHeap<P> {
    fn alloc(&mut self, slot: &mut PAddr, size: usize, align: usize) -> Result<()> {
        let class = cc_class(size, align);
        let len = 1usize << class;
        let block = self.alloc_block(class)?;
        self.hist_alloc.enter(len);
        // record first: a crash mid-drain must know about the block
        self.intents.record_allocation(block, len, align, &self.pers);
        let avail = self.img().available - len as u64;
        self.perform(avail);
        // the slot may be volatile, so it never enters the ring; a crash
        // before this write leaves the block to the armed intent
        *slot = block;
        self.pers.persist_obj(slot);
        Ok(())
    }

    /// The persistent free lists already survive restart, so this flavor
    /// keeps no tracked list and every allocation goes the same way.
    fn alloc_tracked(&mut self, slot: &mut PAddr, size: usize, align: usize) -> Result<()> {
        self.alloc(slot, size, align)
    }

    fn free(&mut self, p: PAddr, size: usize, align: usize) {
        let class = cc_class(size, align);
        let len = 1usize << class;
        self.hist_free.enter(len);
        self.insert_free(p, class);
        let avail = self.img().available + len as u64;
        self.perform(avail);
    }

    fn free_tracked(&mut self, p: PAddr, size: usize, align: usize) {
        self.free(p, size, align)
    }

    /// Carves a specific surviving range back out of the free lists;
    /// used when reconciling intent records after a restart.
    fn inject(&mut self, p: PAddr, size: usize, align: usize) {
        let class = cc_class(size, align);
        let len = 1u64 << class;
        self.hist_inject.enter(len as usize);
        // find and unlink the free block containing [p, p+len)
        let mut containing: Option<(PAddr, usize)> = None;
        'outer: for c in class..CLASSES {
            let mut prev_cell = self.head_cell(c);
            let mut cur = self.get(prev_cell);
            while !cur.is_null() {
                if p.addr() >= cur.addr() && p.addr() + len <= cur.addr() + (1u64 << c) {
                    self.put(prev_cell, self.get(Self::next_cell(cur)));
                    containing = Some((cur, c));
                    break 'outer;
                }
                prev_cell = Self::next_cell(cur);
                cur = self.get(prev_cell);
            }
        }
        let (blk, c) = match containing {
            Some(x) => x,
            None => crate::error::corruption("inject target is not free"),
        };
        // return the pieces around the injected range
        self.seed_range(blk.addr(), (p.addr() - blk.addr()) as usize);
        self.seed_range(p.addr() + len, (blk.addr() + (1u64 << c) - (p.addr() + len)) as usize);
        let avail = self.img().available - len;
        self.perform(avail);
    }

    fn add_managed(&mut self, seg: Segment) {
        self.seed_range(seg.addr, seg.len);
        let img = self.img();
        img.size += seg.len as u64;
        self.pers.persist_obj(&img.size);
        let avail = img.available + seg.len as u64;
        self.perform(avail);
    }

    fn is_free(&self, p: PAddr) -> bool {
        for c in 0..CLASSES {
            let mut cur = self.get(self.head_cell(c));
            while !cur.is_null() {
                if p.addr() >= cur.addr() && p.addr() < cur.addr() + (1u64 << c) {
                    return true;
                }
                cur = self.get(Self::next_cell(cur));
            }
        }
        false
    }

    fn capacity(&self) -> usize {
        self.img().size as usize
    }

    fn allocated(&self) -> usize {
        (self.img().size - self.img().available) as usize
    }

    fn write_hist(&self) {
        self.hist_alloc.write_to_log("alloc");
        self.hist_free.write_to_log("free");
        self.hist_inject.write_to_log("inject");
    }
}
