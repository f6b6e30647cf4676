//! The reconstituting heap
//!
//! Free-space metadata lives entirely in volatile memory. Every
//! allocation of this flavor carries a tracked header and is threaded
//! onto the doubly-linked list anchored in the pool root; that is the
//! only persistent bookkeeping. After a restart the heap starts from
//! "everything is free", walks the list, and re-declares each survivor
//! through [`inject`](super::PHeap::inject). Deallocation threads the
//! block out of the list with a single persistent pointer write.

use super::intent::IntentSet;
use super::{alloc_rounding, PHeap, TrackedHeader, TRACKED_HEADER_SIZE};
use crate::error::Error;
use crate::hist::HistogramLog2;
use crate::persist::Persister;
use crate::ptr::PAddr;
use crate::region::Segment;
use crate::result::Result;
use std::collections::BTreeMap;

pub struct RcHeap<P: Persister> {
    /// Free extents by start address; adjacent extents are coalesced
    free: BTreeMap<u64, usize>,
    capacity: usize,
    allocated: usize,
    anchor: PAddr,
    intents: IntentSet,
    pers: P,
    hist_alloc: HistogramLog2,
    hist_free: HistogramLog2,
    hist_inject: HistogramLog2,
}

impl<P: Persister> RcHeap<P> {
    pub fn new(anchor: PAddr, intents: IntentSet, pers: P) -> Self {
        Self {
            free: BTreeMap::new(),
            capacity: 0,
            allocated: 0,
            anchor,
            intents,
            pers,
            hist_alloc: HistogramLog2::new(),
            hist_free: HistogramLog2::new(),
            hist_inject: HistogramLog2::new(),
        }
    }

    /// First-fit carve of `size` bytes at `align`; both already rounded.
    fn carve(&mut self, size: usize, align: usize) -> Result<PAddr> {
        let mut found: Option<(u64, usize, u64)> = None;
        for (&base, &len) in self.free.iter() {
            let aligned = crate::utils::round_up(base as usize, align) as u64;
            let pad = (aligned - base) as usize;
            if len >= pad + size {
                found = Some((base, len, aligned));
                break;
            }
        }
        let (base, len, aligned) = found.ok_or(Error::NoSpace)?;
        self.free.remove(&base);
        if aligned > base {
            self.free.insert(base, (aligned - base) as usize);
        }
        let tail = base as usize + len - (aligned as usize + size);
        if tail > 0 {
            self.free.insert(aligned + size as u64, tail);
        }
        self.allocated += size;
        Ok(PAddr::new(aligned))
    }

    fn release(&mut self, addr: u64, size: usize) {
        debug_assert!(size > 0);
        let mut base = addr;
        let mut len = size;
        // coalesce with the preceding extent
        if let Some((&pb, &pl)) = self.free.range(..base).next_back() {
            if pb + pl as u64 == base {
                self.free.remove(&pb);
                base = pb;
                len += pl;
            } else if pb + pl as u64 > base {
                crate::error::corruption("double free in reconstituting heap");
            }
        }
        // and with the following one
        if let Some(&nl) = self.free.get(&(addr + size as u64)) {
            self.free.remove(&(addr + size as u64));
            len += nl;
        }
        self.free.insert(base, len);
    }

    /// Marks `[addr, addr+size)` allocated; it must currently be free.
    fn reserve(&mut self, addr: u64, size: usize) {
        let (&base, &len) = match self.free.range(..=addr).next_back() {
            Some(kv) => kv,
            None => crate::error::corruption("inject outside managed space"),
        };
        if base + (len as u64) < addr + size as u64 {
            crate::error::corruption("inject overlaps a live allocation");
        }
        self.free.remove(&base);
        if base < addr {
            self.free.insert(base, (addr - base) as usize);
        }
        let tail = (base + len as u64) - (addr + size as u64);
        if tail > 0 {
            self.free.insert(addr + size as u64, tail as usize);
        }
        self.allocated += size;
    }

    fn oom(&self) -> Error {
        self.write_hist();
        Error::NoSpace
    }
}

impl<P: Persister> PHeap for RcHeap<P> {
    /// Every allocation of this flavor is tracked, so the restart walk
    /// of the list alone rebuilds the free space.
    fn alloc(&mut self, slot: &mut PAddr, size: usize, align: usize) -> Result<()> {
        self.alloc_tracked(slot, size, align)
    }

    fn alloc_tracked(&mut self, slot: &mut PAddr, size: usize, align: usize) -> Result<()> {
        let (sz, al) = TrackedHeader::tracked_rounding(size, align);
        let base = self.carve(sz, al).map_err(|_| self.oom())?;
        self.hist_alloc.enter(sz);

        let user = base.add(al as u64);
        let hdr_addr = PAddr::new(user.addr() - TRACKED_HEADER_SIZE as u64);
        let anchor = unsafe { self.anchor.as_mut::<TrackedHeader>() };
        unsafe {
            let hdr = hdr_addr.as_mut::<TrackedHeader>();
            hdr.prev = self.anchor;
            hdr.next = anchor.next;
            hdr.size = sz as u64;
            hdr.align = al as u64;
            self.pers.persist_obj(hdr);
        }

        // the intent learns of the block before it joins the list, so a
        // crash on either side of the link leaves recovery a consistent
        // view: unlinked blocks read as free and are skipped
        self.intents.record_allocation(user, size, align, &self.pers);

        unsafe {
            // prev need not flush; next must
            anchor.next.as_mut::<TrackedHeader>().prev = hdr_addr;
            anchor.next = hdr_addr;
            self.pers.persist_obj(&anchor.next);
        }

        *slot = user;
        self.pers.persist_obj(slot);
        Ok(())
    }

    fn free(&mut self, p: PAddr, size: usize, align: usize) {
        self.free_tracked(p, size, align)
    }

    fn free_tracked(&mut self, p: PAddr, size: usize, _align: usize) {
        let hdr_addr = PAddr::new(p.addr() - TRACKED_HEADER_SIZE as u64);
        let (al, sz) = unsafe {
            let hdr = hdr_addr.as_mut::<TrackedHeader>();
            let al = hdr.align as usize;
            let (sz, _) = TrackedHeader::tracked_rounding(size, al);
            debug_assert_eq!(sz as u64, hdr.size);

            hdr.next.as_mut::<TrackedHeader>().prev = hdr.prev;
            let prev = hdr.prev.as_mut::<TrackedHeader>();
            prev.next = hdr.next;
            self.pers.persist_obj(&prev.next);
            (al, sz)
        };
        self.hist_free.enter(sz);
        self.allocated = self.allocated.saturating_sub(sz);
        self.release(p.addr() - al as u64, sz);
    }

    fn inject(&mut self, p: PAddr, size: usize, align: usize) {
        let (sz, _) = alloc_rounding(size, align);
        self.hist_inject.enter(sz);
        self.reserve(p.addr(), sz);
    }

    fn add_managed(&mut self, seg: Segment) {
        self.capacity += seg.len;
        self.release(seg.addr, seg.len);
    }

    fn is_free(&self, p: PAddr) -> bool {
        match self.free.range(..=p.addr()).next_back() {
            Some((&base, &len)) => p.addr() < base + len as u64,
            None => false,
        }
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn allocated(&self) -> usize {
        self.allocated
    }

    fn write_hist(&self) {
        self.hist_alloc.write_to_log("alloc");
        self.hist_free.write_to_log("free");
        self.hist_inject.write_to_log("inject");
    }
}
