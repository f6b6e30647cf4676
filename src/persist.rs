//! The `Persister` capability
//!
//! Every persistent data structure is generic over a [`Persister`] so the
//! flush discipline is chosen once, at construction, rather than per call.
//! Production pools use [`Persist`]; emulated-DRAM pools and most unit
//! tests use [`NoOp`]; crash-injection tests use [`Recording`].

use crate::ll;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

/// Capability providing `flush` and `drain` for byte ranges.
///
/// `persist` is `flush` followed by `drain`; a reader that observes a
/// store made durable by `persist` also observes every store flushed
/// before it in the same operation.
pub trait Persister: Clone + Default + 'static {
    /// Cache-line-granular write-back of `[ptr, ptr+len)`
    fn flush(&self, ptr: *const u8, len: usize);

    /// Store fence: all previous flushes are durable once this returns
    fn drain(&self);

    #[inline]
    fn persist(&self, ptr: *const u8, len: usize) {
        self.flush(ptr, len);
        self.drain();
    }

    #[inline]
    fn persist_obj<T: ?Sized>(&self, obj: &T) {
        self.persist(obj as *const T as *const u8, std::mem::size_of_val(obj));
    }

    #[inline]
    fn flush_obj<T: ?Sized>(&self, obj: &T) {
        self.flush(obj as *const T as *const u8, std::mem::size_of_val(obj));
    }
}

/// Cache-line write-back plus store fence (`clwb`/`clflushopt`/`clflush`
/// per cargo feature)
#[derive(Clone, Copy, Default, Debug)]
pub struct Persist;

impl Persister for Persist {
    #[inline]
    fn flush(&self, ptr: *const u8, len: usize) {
        ll::clflush(ptr, len);
    }

    #[inline]
    fn drain(&self) {
        ll::sfence();
    }
}

/// Write-back without the trailing fence
///
/// For bulk payload copies where the caller fences once at the end.
#[derive(Clone, Copy, Default, Debug)]
pub struct NoDrain;

impl Persister for NoDrain {
    #[inline]
    fn flush(&self, ptr: *const u8, len: usize) {
        ll::clflush(ptr, len);
    }

    #[inline]
    fn drain(&self) {}
}

/// Page-granular `msync`, for filesystems without DAX
#[derive(Clone, Copy, Default, Debug)]
pub struct Msync;

impl Persister for Msync {
    #[inline]
    fn flush(&self, ptr: *const u8, len: usize) {
        if len > 0 {
            ll::msync(ptr, len);
        }
    }

    #[inline]
    fn drain(&self) {}
}

/// Does nothing; emulated-DRAM regions and unit tests
#[derive(Clone, Copy, Default, Debug)]
pub struct NoOp;

impl Persister for NoOp {
    #[inline]
    fn flush(&self, _ptr: *const u8, _len: usize) {}

    #[inline]
    fn drain(&self) {}
}

/// Records every flushed range and counts drains; crash-injection tests
/// cut the pool off after the n-th drain to simulate power failure.
#[derive(Clone, Default)]
pub struct Recording {
    inner: Arc<RecordingInner>,
}

#[derive(Default)]
struct RecordingInner {
    flushes: Mutex<Vec<(usize, usize)>>,
    drains: AtomicU64,
    /// Panic once `drains` reaches this value; 0 disables
    crash_after: AtomicU64,
}

impl Recording {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arranges a simulated power failure on the n-th `drain` from now;
    /// 0 cancels a pending schedule.
    pub fn crash_after_drains(&self, n: u64) {
        let limit = if n == 0 {
            0
        } else {
            self.inner.drains.load(Ordering::SeqCst) + n
        };
        self.inner.crash_after.store(limit, Ordering::SeqCst);
    }

    pub fn drains(&self) -> u64 {
        self.inner.drains.load(Ordering::SeqCst)
    }

    pub fn flushed_ranges(&self) -> Vec<(usize, usize)> {
        self.inner.flushes.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.inner.flushes.lock().unwrap().clear();
    }
}

impl Persister for Recording {
    fn flush(&self, ptr: *const u8, len: usize) {
        self.inner.flushes.lock().unwrap().push((ptr as usize, len));
    }

    fn drain(&self) {
        let n = self.inner.drains.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.inner.crash_after.load(Ordering::SeqCst);
        if limit != 0 && n >= limit {
            panic!("simulated power failure at drain #{}", n);
        }
    }
}
