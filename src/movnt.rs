//! Chunked non-temporal copy engine.
//!
//! Bytes up to the first 64-byte boundary of the destination go through the
//! small path (cached stores + flush). The aligned middle is streamed in
//! chunks of 32 lines, then at most one chunk each of 16, 8, 4, 2 and 1
//! lines. The sub-line residue is a single streaming store when it is 32,
//! 16, 8 or 4 bytes, and the small path otherwise.
//!
//! Streamed bytes never enter the cache, so they are never flushed. The
//! engine issues no fence: the caller applies its barrier once after the
//! whole copy.
#![allow(unsafe_code)]

use crate::flush::Flush;
use crate::memmove::Direction;
use crate::simd::{Avx2, Avx512, CACHE_LINE, Isa, Sse2, StreamStore};
use crate::small::memmove_small;

// =============================================================================
// ISA DISPATCH
// =============================================================================

/// Run the engine with the streaming backend of `isa`.
///
/// # Safety
///
/// - `dest` and `src` must be valid for reads/writes of `len` bytes
/// - `direction` must come from [`Direction::select`] for the same arguments
/// - The CPU must support `isa` and whatever `flush` issues
#[inline(always)]
pub(crate) unsafe fn memmove_movnt<F: Flush>(
    isa: Isa,
    direction: Direction,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    flush: &mut F,
) {
    unsafe {
        match isa {
            Isa::Avx512f => memmove_movnt_avx512f(direction, dest, src, len, flush),
            Isa::Avx2 => memmove_movnt_avx2(direction, dest, src, len, flush),
            Isa::Sse2 => memmove_movnt_sse2(direction, dest, src, len, flush),
        }
    }
}

#[target_feature(enable = "avx512f")]
unsafe fn memmove_movnt_avx512f<F: Flush>(
    direction: Direction,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    flush: &mut F,
) {
    unsafe { memmove_movnt_isa::<Avx512, F>(direction, dest, src, len, flush) }
}

#[target_feature(enable = "avx2")]
unsafe fn memmove_movnt_avx2<F: Flush>(
    direction: Direction,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    flush: &mut F,
) {
    unsafe { memmove_movnt_isa::<Avx2, F>(direction, dest, src, len, flush) }
}

unsafe fn memmove_movnt_sse2<F: Flush>(
    direction: Direction,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    flush: &mut F,
) {
    unsafe { memmove_movnt_isa::<Sse2, F>(direction, dest, src, len, flush) }
}

#[inline(always)]
unsafe fn memmove_movnt_isa<S: StreamStore, F: Flush>(
    direction: Direction,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    flush: &mut F,
) {
    unsafe {
        match direction {
            Direction::Forward => memmove_movnt_fw::<S, F>(dest, src, len, flush),
            Direction::Backward => memmove_movnt_bw::<S, F>(dest, src, len, flush),
        }
    }
}

// =============================================================================
// FORWARD
// =============================================================================

#[inline(always)]
unsafe fn memmove_movnt_fw<S: StreamStore, F: Flush>(
    mut dest: *mut u8,
    mut src: *const u8,
    mut len: usize,
    flush: &mut F,
) {
    unsafe {
        let misalign = (dest as usize) & (CACHE_LINE - 1);
        if misalign != 0 {
            let cnt = (CACHE_LINE - misalign).min(len);
            memmove_small(dest, src, cnt, flush);
            dest = dest.add(cnt);
            src = src.add(cnt);
            len -= cnt;
        }

        while len >= 32 * CACHE_LINE {
            S::movnt_lines::<32>(dest, src);
            dest = dest.add(32 * CACHE_LINE);
            src = src.add(32 * CACHE_LINE);
            len -= 32 * CACHE_LINE;
        }

        macro_rules! fw_chunk {
            ($lines:literal) => {
                if len >= $lines * CACHE_LINE {
                    S::movnt_lines::<$lines>(dest, src);
                    dest = dest.add($lines * CACHE_LINE);
                    src = src.add($lines * CACHE_LINE);
                    len -= $lines * CACHE_LINE;
                }
            };
        }
        fw_chunk!(16);
        fw_chunk!(8);
        fw_chunk!(4);
        fw_chunk!(2);
        fw_chunk!(1);

        // One streaming store at most for the last partial line.
        match len {
            0 => {}
            32 => S::movnt32(dest, src),
            16 => S::movnt16(dest, src),
            8 => S::movnt8(dest, src),
            4 => S::movnt4(dest, src),
            _ => memmove_small(dest, src, len, flush),
        }
    }
}

// =============================================================================
// BACKWARD
// =============================================================================

#[inline(always)]
unsafe fn memmove_movnt_bw<S: StreamStore, F: Flush>(
    dest: *mut u8,
    src: *const u8,
    mut len: usize,
    flush: &mut F,
) {
    unsafe {
        // Both pointers track the end of the part still to be copied.
        let mut dest = dest.add(len);
        let mut src = src.add(len);

        let misalign = (dest as usize) & (CACHE_LINE - 1);
        if misalign != 0 {
            let cnt = misalign.min(len);
            dest = dest.sub(cnt);
            src = src.sub(cnt);
            len -= cnt;
            memmove_small(dest, src, cnt, flush);
        }

        while len >= 32 * CACHE_LINE {
            dest = dest.sub(32 * CACHE_LINE);
            src = src.sub(32 * CACHE_LINE);
            len -= 32 * CACHE_LINE;
            S::movnt_lines::<32>(dest, src);
        }

        macro_rules! bw_chunk {
            ($lines:literal) => {
                if len >= $lines * CACHE_LINE {
                    dest = dest.sub($lines * CACHE_LINE);
                    src = src.sub($lines * CACHE_LINE);
                    len -= $lines * CACHE_LINE;
                    S::movnt_lines::<$lines>(dest, src);
                }
            };
        }
        bw_chunk!(16);
        bw_chunk!(8);
        bw_chunk!(4);
        bw_chunk!(2);
        bw_chunk!(1);

        if len == 0 {
            return;
        }
        dest = dest.sub(len);
        src = src.sub(len);
        match len {
            32 => S::movnt32(dest, src),
            16 => S::movnt16(dest, src),
            8 => S::movnt8(dest, src),
            4 => S::movnt4(dest, src),
            _ => memmove_small(dest, src, len, flush),
        }
    }
}
