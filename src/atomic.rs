//! Atomic-update controller
//!
//! Sequences the multi-step value mutations — replace, update-vector,
//! swap — so that a restart lands on either the pre-state or the
//! post-state. The controller's persistent record lives in the pool
//! header; its `op` field is the commit point, and [`redo`] replays an
//! interrupted operation from whatever the record says.
//!
//! [`redo`]: AtomicRecord::redo

use crate::heap::intent::{EmplaceGuard, IntentSet};
use crate::heap::PHeap;
use crate::persist::Persister;
use crate::ptr::PAddr;
use crate::result::Result;
use crate::store::map::{value_bytes, Entry, ValueRecord};

const OP_IDLE: u64 = 0;
const OP_REPLACE: u64 = 1;
const OP_SWAP: u64 = 2;

/// One byte-range edit of an update-vector operation
pub enum UpdateOp<'a> {
    Write { offset: usize, bytes: &'a [u8] },
    Zero { offset: usize, len: usize },
}

impl UpdateOp<'_> {
    pub(crate) fn end(&self) -> usize {
        match self {
            UpdateOp::Write { offset, bytes } => offset + bytes.len(),
            UpdateOp::Zero { offset, len } => offset + len,
        }
    }
}

/// Persistent redo record of the controller.
#[repr(C)]
pub struct AtomicRecord {
    op: u64,
    /// Address of entry A's value cell
    entry_a: PAddr,
    /// Address of entry B's value cell (swap only)
    entry_b: PAddr,
    saved_a: PAddr,
    saved_b: PAddr,
    /// Slot the incoming buffer is allocated into; also the emplace
    /// intent's slot during replace/update
    new_value: PAddr,
    old_value: PAddr,
    old_size: u64,
    old_align: u64,
}

impl AtomicRecord {
    pub fn init<P: Persister>(&mut self, pers: &P) {
        self.op = OP_IDLE;
        self.entry_a = PAddr::NULL;
        self.entry_b = PAddr::NULL;
        self.saved_a = PAddr::NULL;
        self.saved_b = PAddr::NULL;
        self.new_value = PAddr::NULL;
        self.old_value = PAddr::NULL;
        self.old_size = 0;
        self.old_align = 0;
        pers.persist_obj(self);
    }

    /// Replace an entry's value with `bytes` (plus `zero_extend` zero
    /// bytes), at `align`.
    pub fn replace<P: Persister>(
        &mut self,
        heap: &mut dyn PHeap,
        intents: &IntentSet,
        entry: &mut Entry,
        bytes: &[u8],
        zero_extend: usize,
        align: usize,
        pers: &P,
    ) -> Result<()> {
        let len = bytes.len() + zero_extend;
        self.install(heap, intents, entry, len, align, pers, |dst| {
            dst[..bytes.len()].copy_from_slice(bytes);
            for b in &mut dst[bytes.len()..] {
                *b = 0;
            }
        })
    }

    /// Copy-on-write application of an edit vector.
    pub fn update_vector<P: Persister>(
        &mut self,
        heap: &mut dyn PHeap,
        intents: &IntentSet,
        entry: &mut Entry,
        ops: &[UpdateOp<'_>],
        pers: &P,
    ) -> Result<()> {
        let old = unsafe { value_bytes(entry.value) };
        let len = ops
            .iter()
            .map(|op| op.end())
            .chain(std::iter::once(old.len()))
            .max()
            .unwrap();
        let old_align = unsafe { entry.value.as_ref::<ValueRecord>() }.align as usize;
        self.install(heap, intents, entry, len, old_align, pers, |dst| {
            dst[..old.len()].copy_from_slice(old);
            for b in &mut dst[old.len()..] {
                *b = 0;
            }
            for op in ops {
                match op {
                    UpdateOp::Write { offset, bytes } => {
                        dst[*offset..*offset + bytes.len()].copy_from_slice(bytes);
                    }
                    UpdateOp::Zero { offset, len } => {
                        for b in &mut dst[*offset..*offset + *len] {
                            *b = 0;
                        }
                    }
                }
            }
        })
    }

    /// The shared tail of replace/update: allocate, fill, publish, free.
    fn install<P: Persister, F: FnOnce(&mut [u8])>(
        &mut self,
        heap: &mut dyn PHeap,
        intents: &IntentSet,
        entry: &mut Entry,
        len: usize,
        align: usize,
        pers: &P,
        fill: F,
    ) -> Result<()> {
        let (total, data_off, align_v) = ValueRecord::layout(len, align);

        self.new_value = PAddr::NULL;
        pers.persist_obj(&self.new_value);
        let guard = EmplaceGuard::arm(
            unsafe { intents.emplace_rec() },
            PAddr::from_ref(&self.new_value),
            pers.clone(),
        );

        // the guard disarms on the error path
        heap.alloc(&mut self.new_value, total, align_v)?;
        let slot = self.new_value;

        unsafe {
            let rec = slot.as_mut::<ValueRecord>();
            rec.len = len as u64;
            rec.align = align_v as u64;
            fill(slot.add(data_off as u64).as_slice_mut(len));
        }
        pers.persist(slot.as_ptr(), total);

        // stage the swing
        let old = entry.value;
        self.entry_a = PAddr::from_ref(&entry.value);
        self.entry_b = PAddr::NULL;
        self.old_value = old;
        if !old.is_null() {
            let orec = unsafe { old.as_ref::<ValueRecord>() };
            self.old_size = orec.total_size() as u64;
            self.old_align = orec.align;
        } else {
            self.old_size = 0;
            self.old_align = 0;
        }
        pers.persist_obj(self);
        self.op = OP_REPLACE;
        pers.persist_obj(&self.op);

        // the swing itself
        entry.value = slot;
        pers.persist_obj(&entry.value);
        entry.timestamp = crate::ll::rdtsc();
        pers.persist_obj(&entry.timestamp);

        if !old.is_null() {
            heap.free(old, self.old_size as usize, self.old_align as usize);
        }
        self.op = OP_IDLE;
        pers.persist_obj(&self.op);
        guard.commit();
        Ok(())
    }

    /// Exchanges the value pointers of two entries of the same pool.
    pub fn swap<P: Persister>(&mut self, a: &mut Entry, b: &mut Entry, pers: &P) {
        self.entry_a = PAddr::from_ref(&a.value);
        self.entry_b = PAddr::from_ref(&b.value);
        self.saved_a = a.value;
        self.saved_b = b.value;
        pers.persist_obj(self);
        self.op = OP_SWAP;
        pers.persist_obj(&self.op);

        a.value = self.saved_b;
        pers.persist_obj(&a.value);
        b.value = self.saved_a;
        pers.persist_obj(&b.value);

        self.op = OP_IDLE;
        pers.persist_obj(&self.op);
    }

    /// Replays whatever the record says was in flight. Runs once per
    /// pool open, after the heap is usable and before intent recovery.
    pub fn redo<P: Persister>(&mut self, heap: &mut dyn PHeap, pers: &P) {
        match self.op {
            OP_IDLE => {}
            OP_REPLACE => {
                if self.entry_a.is_null() || self.new_value.is_null() {
                    crate::error::corruption("replace record with null fields");
                }
                unsafe {
                    *self.entry_a.as_mut::<PAddr>() = self.new_value;
                }
                pers.persist(self.entry_a.as_ptr(), 8);
                if !self.old_value.is_null() && !heap.is_free(self.old_value) {
                    heap.free(
                        self.old_value,
                        self.old_size as usize,
                        self.old_align as usize,
                    );
                }
                self.op = OP_IDLE;
                pers.persist_obj(&self.op);
            }
            OP_SWAP => {
                if self.entry_a.is_null() || self.entry_b.is_null() {
                    crate::error::corruption("swap record with null fields");
                }
                unsafe {
                    *self.entry_a.as_mut::<PAddr>() = self.saved_b;
                    *self.entry_b.as_mut::<PAddr>() = self.saved_a;
                }
                pers.persist(self.entry_a.as_ptr(), 8);
                pers.persist(self.entry_b.as_ptr(), 8);
                self.op = OP_IDLE;
                pers.persist_obj(&self.op);
            }
            _ => crate::error::corruption("atomic record with unknown op"),
        }
    }
}
