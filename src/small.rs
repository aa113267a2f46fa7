//! Sub-cache-line copies with ordinary stores followed by a flush.
#![allow(unsafe_code)]

use core::arch::x86_64::*;

use crate::flush::Flush;

/// Copy `n <= 64` bytes with cached stores, then flush exactly the written
/// range.
///
/// Every size class loads its head and tail before storing either, so any
/// overlap between `src` and `dest` inside the window is handled.
///
/// # Safety
///
/// - `dest` and `src` must be valid for reads/writes of `n` bytes
/// - Regions may overlap
/// - `n <= 64`
#[inline(always)]
pub(crate) unsafe fn memmove_small<F: Flush>(dest: *mut u8, src: *const u8, n: usize, flush: &mut F) {
    debug_assert!(n <= 64);
    if n == 0 {
        return;
    }
    unsafe {
        memmove_small_noflush(dest, src, n);
        flush.flush(dest, n);
    }
}

#[inline(always)]
unsafe fn memmove_small_noflush(dest: *mut u8, src: *const u8, n: usize) {
    unsafe {
        if n >= 32 {
            // 32-64 bytes: 4 × 16-byte loads/stores (overlapping)
            let v0 = _mm_loadu_si128(src as *const __m128i);
            let v1 = _mm_loadu_si128(src.add(16) as *const __m128i);
            let v2 = _mm_loadu_si128(src.add(n - 32) as *const __m128i);
            let v3 = _mm_loadu_si128(src.add(n - 16) as *const __m128i);
            _mm_storeu_si128(dest as *mut __m128i, v0);
            _mm_storeu_si128(dest.add(16) as *mut __m128i, v1);
            _mm_storeu_si128(dest.add(n - 32) as *mut __m128i, v2);
            _mm_storeu_si128(dest.add(n - 16) as *mut __m128i, v3);
            return;
        }

        if n >= 16 {
            let v0 = _mm_loadu_si128(src as *const __m128i);
            let v1 = _mm_loadu_si128(src.add(n - 16) as *const __m128i);
            _mm_storeu_si128(dest as *mut __m128i, v0);
            _mm_storeu_si128(dest.add(n - 16) as *mut __m128i, v1);
            return;
        }

        if n >= 8 {
            let a = core::ptr::read_unaligned(src as *const u64);
            let b = core::ptr::read_unaligned(src.add(n - 8) as *const u64);
            core::ptr::write_unaligned(dest as *mut u64, a);
            core::ptr::write_unaligned(dest.add(n - 8) as *mut u64, b);
            return;
        }

        if n >= 4 {
            let a = core::ptr::read_unaligned(src as *const u32);
            let b = core::ptr::read_unaligned(src.add(n - 4) as *const u32);
            core::ptr::write_unaligned(dest as *mut u32, a);
            core::ptr::write_unaligned(dest.add(n - 4) as *mut u32, b);
            return;
        }

        if n >= 2 {
            let a = core::ptr::read_unaligned(src as *const u16);
            let b = core::ptr::read_unaligned(src.add(n - 2) as *const u16);
            core::ptr::write_unaligned(dest as *mut u16, a);
            core::ptr::write_unaligned(dest.add(n - 2) as *mut u16, b);
            return;
        }

        *dest = *src;
    }
}
