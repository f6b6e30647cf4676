//! Low-level persistence primitives

#![allow(unused)]

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_mfence, _mm_sfence};

const CACHE_LINE_SHIFT: usize = 6;

/// Writes back every cache line touching `[ptr, ptr+len)`
///
/// The instruction is selected at build time the same way the flush
/// discipline is: `clflush` by default, `clflushopt` or `clwb` under the
/// corresponding cargo feature. `clflush` is ordered by itself; the
/// optimized variants require a following [`sfence`] to be durable.
#[inline(always)]
pub fn clflush<T: ?Sized>(ptr: *const T, len: usize) {
    #[cfg(all(not(feature = "no_persist"), target_arch = "x86_64"))]
    {
        let mut start = ptr as *const u8 as usize;
        start = (start >> CACHE_LINE_SHIFT) << CACHE_LINE_SHIFT;
        let end = ptr as *const u8 as usize + len;

        #[cfg(feature = "stat_print_flushes")]
        println!("flush {:x} ({})", start, len);

        while start < end {
            unsafe {
                #[cfg(not(any(feature = "use_clflushopt", feature = "use_clwb")))]
                {
                    _mm_clflush(start as *const u8);
                }
                #[cfg(all(feature = "use_clflushopt", not(feature = "use_clwb")))]
                {
                    std::arch::asm!("clflushopt [{0}]", in(reg) start);
                }
                #[cfg(all(feature = "use_clwb", not(feature = "use_clflushopt")))]
                {
                    std::arch::asm!("clwb [{0}]", in(reg) start);
                }
                #[cfg(all(feature = "use_clwb", feature = "use_clflushopt"))]
                {
                    compile_error!("Please select only one of clflushopt and clwb");
                }
            }
            start += 1 << CACHE_LINE_SHIFT;
        }
    }
}

/// Synchronizes a byte range with the persistence domain
#[inline(always)]
pub fn persist<T: ?Sized>(ptr: *const T, len: usize, fence: bool) {
    #[cfg(not(feature = "no_persist"))]
    {
        #[cfg(not(feature = "use_msync"))]
        {
            clflush(ptr, len);
            if fence {
                sfence();
            }
        }

        #[cfg(feature = "use_msync")]
        msync(ptr, len);
    }
}

/// Synchronizes a whole object with the persistence domain
#[inline(always)]
pub fn persist_obj<T: ?Sized>(obj: &T, fence: bool) {
    persist(obj as *const T, std::mem::size_of_val(obj), fence);
}

/// Page-granular `msync` fallback for media without user-space flush
#[inline]
pub fn msync<T: ?Sized>(ptr: *const T, len: usize) {
    unsafe {
        let off = ptr as *const T as *const u8 as usize;
        let end = off + len;
        let off = (off >> 12) << 12;
        let len = end - off;
        if libc::msync(
            off as *mut libc::c_void,
            len,
            libc::MS_SYNC | libc::MS_INVALIDATE,
        ) != 0
        {
            panic!("msync failed");
        }
    }
}

/// Store fence
#[inline(always)]
pub fn sfence() {
    #[cfg(all(not(feature = "no_persist"), target_arch = "x86_64"))]
    unsafe {
        _mm_sfence();
    }
}

/// Memory fence
#[inline]
pub fn mfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_mfence();
    }
}

/// Timestamp counter, the source for entry write timestamps
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        std::arch::x86_64::_rdtsc()
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0)
    }
}
