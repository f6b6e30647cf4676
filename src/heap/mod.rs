//! Persistent heaps
//!
//! Two interchangeable flavors manage the byte space of a pool's region:
//!
//! * [`cc::CcHeap`] keeps its free lists *inside* the region and makes
//!   every metadata mutation crash-consistent;
//! * [`rc::RcHeap`] keeps its free lists in volatile memory and rebuilds
//!   them after restart from the tracked-allocation list and the injected
//!   survivors.
//!
//! Both hand blocks out by writing the block address into a caller-owned
//! pointer slot, so the in-flight intent records (see [`intent`]) can tie
//! an allocation to the place that will own it.

pub mod cc;
pub mod intent;
pub mod rc;

use crate::error::Error;
use crate::persist::Persister;
use crate::ptr::PAddr;
use crate::region::Segment;
use crate::result::Result;
use crate::utils::{clean_align, clp2, round_up};

/// Minimum alignment of any allocation
pub const MIN_ALIGN: usize = std::mem::size_of::<usize>();

/// The rounding every flavor applies before carving a block.
///
/// Sizes below the alignment are rounded to a power of two so the free
/// path can find the block class again; in any case the size becomes a
/// multiple of the (cleaned) alignment. Free and inject must pass through
/// the same function or the extent arithmetic drifts.
#[inline]
pub fn alloc_rounding(size: usize, align: usize) -> (usize, usize) {
    let mut align = clean_align(align, MIN_ALIGN);
    let mut size = size.max(1);
    if size < align {
        size = clp2(size);
        align = size.max(MIN_ALIGN);
    }
    (round_up(size, align), align)
}

/// Common heap contract; a [`Heap`] enum dispatches to the flavor a pool
/// was created with.
pub trait PHeap {
    /// Carves a block and publishes it by writing its address into
    /// `slot`, persisted, after recording it in the armed intent (if any).
    fn alloc(&mut self, slot: &mut PAddr, size: usize, align: usize) -> Result<()>;

    /// Like `alloc` but links the block into the tracked-allocation list
    /// so reconstitution finds it without an owner. The reconstituting
    /// flavor routes every allocation through here; the crash-consistent
    /// flavor keeps no list and forwards to `alloc`.
    fn alloc_tracked(&mut self, slot: &mut PAddr, size: usize, align: usize) -> Result<()>;

    /// Returns a block to the free space. `size`/`align` must match the
    /// allocation.
    fn free(&mut self, p: PAddr, size: usize, align: usize);

    /// Unlinks a tracked block and returns it to the free space.
    fn free_tracked(&mut self, p: PAddr, size: usize, align: usize);

    /// Re-declares a surviving allocation as live during reconstitution.
    fn inject(&mut self, p: PAddr, size: usize, align: usize);

    /// Inserts a fresh segment's bytes into the free space.
    fn add_managed(&mut self, seg: Segment);

    /// True if the block at `p` currently lies inside free space.
    fn is_free(&self, p: PAddr) -> bool;

    fn capacity(&self) -> usize;
    fn allocated(&self) -> usize;

    /// Writes the allocation histograms to the log (on `NoSpace`).
    fn write_hist(&self);

    fn percent_used(&self) -> u32 {
        let cap = self.capacity();
        if cap == 0 {
            0xFFFF
        } else {
            (self.allocated() * 100 / cap) as u32
        }
    }
}

/// Convenience for allocations whose owner slot is volatile.
pub fn alloc_ptr<H: PHeap + ?Sized>(h: &mut H, size: usize, align: usize) -> Result<PAddr> {
    let mut slot = PAddr::NULL;
    h.alloc(&mut slot, size, align)?;
    Ok(slot)
}

/// Header threaded through every tracked allocation.
///
/// Lives immediately below the pointer handed to the client; the anchor
/// copy sits at offset 0 of the pool header with `size == align == 0`.
/// `next` is the durable direction: `prev` is fixed up during recovery.
#[repr(C)]
pub struct TrackedHeader {
    pub prev: PAddr,
    pub next: PAddr,
    pub size: u64,
    pub align: u64,
}

pub const TRACKED_HEADER_SIZE: usize = std::mem::size_of::<TrackedHeader>();

impl TrackedHeader {
    /// Initializes an anchor whose prev/next point at itself.
    pub fn init_anchor<P: Persister>(anchor: &mut TrackedHeader, pers: &P) {
        let self_addr = PAddr::from_ref(anchor);
        anchor.prev = self_addr;
        anchor.next = self_addr;
        anchor.size = 0;
        anchor.align = 0;
        pers.persist_obj(anchor);
    }

    /// The rounded size and alignment a tracked allocation of `size`
    /// bytes at alignment `align` actually occupies.
    pub fn tracked_rounding(size: usize, align: usize) -> (usize, usize) {
        let align = clp2(clean_align(align, MIN_ALIGN).max(TRACKED_HEADER_SIZE));
        (round_up(size + align, align), align)
    }

    /// Walks the list from `anchor`, handing each live allocation to
    /// `visit` as `(block_base, rounded_size)` and repairing unflushed
    /// `prev` links. Aborts on a cyclic or out-of-bounds link.
    pub fn recover<F: FnMut(PAddr, usize)>(anchor: &mut TrackedHeader, mut visit: F) {
        let anchor_addr = PAddr::from_ref(anchor);
        let mut prev = anchor_addr;
        let mut cur = anchor.next;
        let mut seen = 0u64;
        while cur != anchor_addr {
            if cur.is_null() {
                crate::error::corruption("tracked-allocation list: null link");
            }
            if seen > (1 << 40) {
                crate::error::corruption("tracked-allocation list: cycle");
            }
            let h = unsafe { cur.as_mut::<TrackedHeader>() };
            if h.prev != prev {
                // prev is never flushed on link/unlink; restore it
                h.prev = prev;
            }
            let align = h.align as usize;
            if align == 0 || !align.is_power_of_two() || align < TRACKED_HEADER_SIZE {
                crate::error::corruption("tracked-allocation header: bad alignment");
            }
            // user pointer is just above the header; block base below it
            let user = cur.add(TRACKED_HEADER_SIZE as u64);
            let base = PAddr::new(user.addr() - align as u64);
            visit(base, h.size as usize);
            prev = cur;
            cur = h.next;
            seen += 1;
        }
        anchor.prev = prev;
    }
}

/// Persistent vector of extra-region uuids, grown one slot at a time.
///
/// The slot is persisted before the length, so a crash mid-grow leaves
/// the new region either unregistered or fully registered.
#[repr(C)]
pub struct UuidVector {
    pub len: u64,
    pub slots: [u64; UUID_SLOTS],
}

pub const UUID_SLOTS: usize = 64;

impl UuidVector {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.len = 0;
        self.slots = [0; UUID_SLOTS];
        pers.persist_obj(self);
    }

    pub fn push<P: Persister>(&mut self, uuid: u64, pers: &P) -> Result<()> {
        let ix = self.len as usize;
        if ix == UUID_SLOTS {
            return Err(Error::NoSpace);
        }
        self.slots[ix] = uuid;
        pers.persist_obj(&self.slots[ix]);
        self.len = (ix + 1) as u64;
        pers.persist_obj(&self.len);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots[..self.len as usize].iter().copied()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::persist::NoOp;

    #[test]
    fn rounding_floors_alignment_and_rounds_small_sizes() {
        assert_eq!(alloc_rounding(1, 0), (8, 8));
        assert_eq!(alloc_rounding(3, 0), (8, 8));
        assert_eq!(alloc_rounding(24, 8), (24, 8));
        assert_eq!(alloc_rounding(5, 64), (8, 8));
        assert_eq!(alloc_rounding(100, 64), (128, 64));
        assert_eq!(alloc_rounding(64, 64), (64, 64));
    }

    #[test]
    fn tracked_rounding_reserves_header_room() {
        let (sz, align) = TrackedHeader::tracked_rounding(10, 0);
        assert_eq!(align, 32);
        assert_eq!(sz, 64);
        let (sz, align) = TrackedHeader::tracked_rounding(100, 64);
        assert_eq!(align, 64);
        assert_eq!(sz, 192);
    }

    #[test]
    fn anchor_selflinks_and_recovers_empty() {
        let mut anchor = TrackedHeader {
            prev: PAddr::NULL,
            next: PAddr::NULL,
            size: 0,
            align: 0,
        };
        TrackedHeader::init_anchor(&mut anchor, &NoOp);
        let mut n = 0;
        TrackedHeader::recover(&mut anchor, |_, _| n += 1);
        assert_eq!(n, 0);
    }

    #[test]
    fn uuid_vector_orders_slot_before_len() {
        let mut v = UuidVector {
            len: 0,
            slots: [0; UUID_SLOTS],
        };
        v.init(&NoOp);
        v.push(42, &NoOp).unwrap();
        v.push(43, &NoOp).unwrap();
        assert_eq!(v.iter().collect::<Vec<_>>(), vec![42, 43]);
    }
}
