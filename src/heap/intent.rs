//! Allocation-intent records
//!
//! Four small persistent records capture in-flight allocator intent so a
//! restart can finish or undo whatever was happening. Each has the same
//! lifecycle, every transition a single persisted store:
//!
//! ```text
//!   disarmed ── arm ──▶ armed ── record(ptr) ──▶ armed-with-value ── disarm ──▶ disarmed
//! ```
//!
//! At most one record of each kind is armed per pool; `extend` may be
//! armed while `emplace` is armed, never the other way around.

use crate::persist::Persister;
use crate::ptr::PAddr;

const ST_DISARMED: u64 = 0;
const ST_ARMED: u64 = 1;

/// Capacity of an `extend` chain: a rehash records the old and the new
/// table, an erase records a key and a value, a fresh emplace records
/// both payload blocks.
pub const EXTEND_SLOTS: usize = 8;

/// Intent covering a single pointer slot.
///
/// Armed before the heap carves a block for the slot; the recorded value
/// is the block the client may never have learned about.
#[repr(C)]
pub struct EmplaceRecord {
    state: u64,
    slot: PAddr,
    value: PAddr,
    size: u64,
    align: u64,
}

impl EmplaceRecord {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.state = ST_DISARMED;
        self.slot = PAddr::NULL;
        self.value = PAddr::NULL;
        self.size = 0;
        self.align = 0;
        pers.persist_obj(self);
    }

    pub fn is_armed(&self) -> bool {
        self.state == ST_ARMED
    }

    pub fn arm<P: Persister>(&mut self, slot: PAddr, pers: &P) {
        debug_assert_eq!(self.state, ST_DISARMED, "emplace intent already armed");
        self.slot = slot;
        self.value = PAddr::NULL;
        self.size = 0;
        self.align = 0;
        pers.persist_obj(self);
        self.state = ST_ARMED;
        pers.persist_obj(&self.state);
    }

    /// The value store is the transition to armed-with-value.
    pub fn record<P: Persister>(&mut self, value: PAddr, size: usize, align: usize, pers: &P) {
        debug_assert_eq!(self.state, ST_ARMED);
        self.size = size as u64;
        self.align = align as u64;
        pers.persist_obj(&self.size);
        pers.persist_obj(&self.align);
        self.value = value;
        pers.persist_obj(&self.value);
    }

    pub fn disarm<P: Persister>(&mut self, pers: &P) {
        self.state = ST_DISARMED;
        pers.persist_obj(&self.state);
    }

    pub fn slot(&self) -> PAddr {
        self.slot
    }

    pub fn recorded(&self) -> Option<(PAddr, usize, usize)> {
        if self.state == ST_ARMED && !self.value.is_null() {
            Some((self.value, self.size as usize, self.align as usize))
        } else {
            None
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ExtendItem {
    pub addr: PAddr,
    pub size: u64,
    pub align: u64,
}

/// Intent covering a chain of blocks touched by one growth operation.
#[repr(C)]
pub struct ExtendRecord {
    state: u64,
    count: u64,
    items: [ExtendItem; EXTEND_SLOTS],
}

impl ExtendRecord {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.state = ST_DISARMED;
        self.count = 0;
        self.items = [ExtendItem {
            addr: PAddr::NULL,
            size: 0,
            align: 0,
        }; EXTEND_SLOTS];
        pers.persist_obj(self);
    }

    pub fn is_armed(&self) -> bool {
        self.state == ST_ARMED
    }

    pub fn arm<P: Persister>(&mut self, pers: &P) {
        debug_assert_eq!(self.state, ST_DISARMED, "extend intent already armed");
        self.count = 0;
        pers.persist_obj(&self.count);
        self.state = ST_ARMED;
        pers.persist_obj(&self.state);
    }

    /// The count store is the per-item commit.
    pub fn record<P: Persister>(&mut self, addr: PAddr, size: usize, align: usize, pers: &P) {
        debug_assert_eq!(self.state, ST_ARMED);
        let ix = self.count as usize;
        assert!(ix < EXTEND_SLOTS, "extend chain overflow");
        self.items[ix] = ExtendItem {
            addr,
            size: size as u64,
            align: align as u64,
        };
        pers.persist_obj(&self.items[ix]);
        self.count = (ix + 1) as u64;
        pers.persist_obj(&self.count);
    }

    pub fn disarm<P: Persister>(&mut self, pers: &P) {
        self.state = ST_DISARMED;
        pers.persist_obj(&self.state);
    }

    pub fn items(&self) -> &[ExtendItem] {
        if self.state == ST_ARMED {
            &self.items[..self.count as usize]
        } else {
            &[]
        }
    }
}

/// Intent saving a client-owned raw pointer across a long-running user
/// operation; restart puts the old pointer back.
#[repr(C)]
pub struct PinRecord {
    state: u64,
    client: PAddr,
    saved: PAddr,
}

impl PinRecord {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.state = ST_DISARMED;
        self.client = PAddr::NULL;
        self.saved = PAddr::NULL;
        pers.persist_obj(self);
    }

    pub fn is_armed(&self) -> bool {
        self.state == ST_ARMED
    }

    /// `client` addresses a pointer the client owns; its current value is
    /// saved so recovery can restore it.
    pub fn arm<P: Persister>(&mut self, client: PAddr, pers: &P) {
        debug_assert_eq!(self.state, ST_DISARMED, "pin intent already armed");
        self.client = client;
        self.saved = unsafe { *client.as_ref::<PAddr>() };
        pers.persist_obj(self);
        self.state = ST_ARMED;
        pers.persist_obj(&self.state);
    }

    pub fn saved(&self) -> PAddr {
        self.saved
    }

    pub fn disarm<P: Persister>(&mut self, pers: &P) {
        self.state = ST_DISARMED;
        pers.persist_obj(&self.state);
    }

    /// Restores the saved pointer if the pin was armed at the crash.
    pub fn recover<P: Persister>(&mut self, pers: &P) {
        if self.state == ST_ARMED {
            if self.client.is_null() {
                crate::error::corruption("pin intent armed with null client pointer");
            }
            unsafe {
                *self.client.as_mut::<PAddr>() = self.saved;
            }
            pers.persist(self.client.as_ptr(), std::mem::size_of::<PAddr>());
            self.disarm(pers);
        }
    }
}

/// Scoped arming of the `emplace` record: construction arms, drop
/// disarms, [`commit`](EmplaceGuard::commit) disarms once the recorded
/// block is reachable. Restart rollback only ever sees the record, so
/// the two disarms are the same store; the guard exists so no exit path
/// can leave the record armed.
pub struct EmplaceGuard<P: Persister> {
    rec: &'static mut EmplaceRecord,
    pers: P,
    done: bool,
}

impl<P: Persister> EmplaceGuard<P> {
    pub fn arm(rec: &'static mut EmplaceRecord, slot: PAddr, pers: P) -> Self {
        rec.arm(slot, &pers);
        Self {
            rec,
            pers,
            done: false,
        }
    }

    pub fn commit(mut self) {
        self.rec.disarm(&self.pers);
        self.done = true;
    }
}

impl<P: Persister> Drop for EmplaceGuard<P> {
    fn drop(&mut self) {
        if !self.done {
            self.rec.disarm(&self.pers);
        }
    }
}

/// Scoped arming of the `extend` record; same shape as [`EmplaceGuard`].
pub struct ExtendGuard<P: Persister> {
    rec: &'static mut ExtendRecord,
    pers: P,
    done: bool,
}

impl<P: Persister> ExtendGuard<P> {
    pub fn arm(rec: &'static mut ExtendRecord, pers: P) -> Self {
        rec.arm(&pers);
        Self {
            rec,
            pers,
            done: false,
        }
    }

    pub fn record(&mut self, addr: PAddr, size: usize, align: usize) {
        self.rec.record(addr, size, align, &self.pers);
    }

    pub fn commit(mut self) {
        self.rec.disarm(&self.pers);
        self.done = true;
    }
}

impl<P: Persister> Drop for ExtendGuard<P> {
    fn drop(&mut self) {
        if !self.done {
            self.rec.disarm(&self.pers);
        }
    }
}

/// The four records of one pool, addressed into the pool header.
///
/// The heap consults this on every allocation: a pin in progress records
/// nothing, an armed `extend` takes the allocation, otherwise an armed
/// `emplace` does. An allocation with nothing armed is reported when
/// `LEAK_CHECK` is set; nothing would reclaim it after a crash.
#[derive(Clone, Copy)]
pub struct IntentSet {
    pub emplace: PAddr,
    pub extend: PAddr,
    pub pin_data: PAddr,
    pub pin_key: PAddr,
}

impl IntentSet {
    pub unsafe fn emplace_rec<'a>(&self) -> &'a mut EmplaceRecord {
        self.emplace.as_mut()
    }

    pub unsafe fn extend_rec<'a>(&self) -> &'a mut ExtendRecord {
        self.extend.as_mut()
    }

    pub unsafe fn pin_data_rec<'a>(&self) -> &'a mut PinRecord {
        self.pin_data.as_mut()
    }

    pub unsafe fn pin_key_rec<'a>(&self) -> &'a mut PinRecord {
        self.pin_key.as_mut()
    }

    pub fn record_allocation<P: Persister>(&self, addr: PAddr, size: usize, align: usize, pers: &P) {
        unsafe {
            if self.pin_data_rec().is_armed() || self.pin_key_rec().is_armed() {
                return;
            }
            // Order matters: an extend arm+allocate can occur while
            // emplace is armed, not vice-versa.
            let asx = self.extend_rec();
            if asx.is_armed() {
                asx.record(addr, size, align, pers);
                return;
            }
            let ase = self.emplace_rec();
            if ase.is_armed() {
                ase.record(addr, size, align, pers);
                return;
            }
        }
        if crate::utils::env().leak_check {
            eprintln!(
                "pmstore: leaky allocation, addr {:?} size {} align {}",
                addr, size, align
            );
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::persist::NoOp;

    fn zeroed<T>() -> Box<T> {
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn emplace_lifecycle() {
        let mut r: Box<EmplaceRecord> = zeroed();
        r.init(&NoOp);
        assert!(!r.is_armed());
        let mut slot = PAddr::NULL;
        r.arm(PAddr::from_ref(&mut slot), &NoOp);
        assert!(r.is_armed());
        assert!(r.recorded().is_none());
        r.record(PAddr::new(0x1000), 64, 8, &NoOp);
        assert_eq!(r.recorded(), Some((PAddr::new(0x1000), 64, 8)));
        r.disarm(&NoOp);
        assert!(r.recorded().is_none());
    }

    #[test]
    fn extend_records_a_chain() {
        let mut r: Box<ExtendRecord> = zeroed();
        r.init(&NoOp);
        r.arm(&NoOp);
        r.record(PAddr::new(0x1000), 64, 8, &NoOp);
        r.record(PAddr::new(0x2000), 128, 8, &NoOp);
        assert_eq!(r.items().len(), 2);
        assert_eq!(r.items()[1].addr, PAddr::new(0x2000));
        r.disarm(&NoOp);
        assert!(r.items().is_empty());
    }

    #[test]
    fn pin_restores_old_pointer() {
        let mut r: Box<PinRecord> = zeroed();
        r.init(&NoOp);
        let mut client = PAddr::new(0xAAAA);
        r.arm(PAddr::from_ref(&mut client), &NoOp);
        assert_eq!(r.saved(), PAddr::new(0xAAAA));
        // user operation scribbles on the client pointer, then crashes
        client = PAddr::new(0xBBBB);
        r.recover(&NoOp);
        assert_eq!(client, PAddr::new(0xAAAA));
        assert!(!r.is_armed());
    }

    #[test]
    fn guards_disarm_on_drop_and_on_commit() {
        let mut r: Box<ExtendRecord> = zeroed();
        r.init(&NoOp);
        {
            let rec = unsafe { &mut *(r.as_mut() as *mut ExtendRecord) };
            let mut g = ExtendGuard::arm(rec, NoOp);
            g.record(PAddr::new(0x10), 8, 8);
            assert!(r.is_armed());
            // dropped without commit: the record must not stay armed
        }
        assert!(!r.is_armed());

        let rec = unsafe { &mut *(r.as_mut() as *mut ExtendRecord) };
        let g = ExtendGuard::arm(rec, NoOp);
        assert!(r.is_armed());
        g.commit();
        assert!(!r.is_armed());
    }

    #[test]
    fn recover_disarmed_pin_is_a_noop() {
        let mut r: Box<PinRecord> = zeroed();
        r.init(&NoOp);
        r.recover(&NoOp);
        assert!(!r.is_armed());
    }
}
