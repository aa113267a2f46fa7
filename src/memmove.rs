//! Durable memmove entry points.
//!
//! Every entry point picks a traversal direction once, runs the streaming
//! engine with one flush kind, then applies its barrier once. After it
//! returns (and after the caller's `drain()` for the `nodrain` form) the
//! destination holds the source bytes and, unless the policy is a no-op,
//! those bytes have left the CPU cache.
#![allow(unsafe_code)]

use crate::barrier::Barrier;
use crate::flush::{Clflush, ClflushOpt, Clwb, EmptyFlush, Flush, FlushPolicy, NoFlush};
use crate::movnt::memmove_movnt;
use crate::simd::Isa;

/// Traversal order of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Low to high addresses.
    Forward,
    /// High to low addresses.
    Backward,
}

impl Direction {
    /// Forward unless `dest` starts inside `[src, src + len)`.
    ///
    /// The wrapping difference is huge when `dest < src`, so one unsigned
    /// compare covers both "disjoint" and "destination behind the source".
    #[inline(always)]
    pub fn select(dest: *const u8, src: *const u8, len: usize) -> Direction {
        if (dest as usize).wrapping_sub(src as usize) >= len {
            Direction::Forward
        } else {
            Direction::Backward
        }
    }
}

/// Durable memmove with an explicit backend, flush and barrier.
///
/// # Safety
///
/// - `dest` and `src` must be valid for reads/writes of `len` bytes
/// - Regions may overlap
/// - The CPU must support `isa` and the instruction `flush` issues
#[inline(always)]
pub unsafe fn copy_durable_with<F: Flush>(
    isa: Isa,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    flush: &mut F,
    barrier: Barrier,
) {
    let direction = Direction::select(dest, src, len);
    unsafe { memmove_movnt(isa, direction, dest, src, len, flush) };
    barrier.apply();
}

#[inline(always)]
unsafe fn copy_durable_policy(
    isa: Isa,
    dest: *mut u8,
    src: *const u8,
    len: usize,
    policy: FlushPolicy,
    barrier: Barrier,
) {
    unsafe {
        match policy {
            FlushPolicy::NoFlush => copy_durable_with(isa, dest, src, len, &mut NoFlush, barrier),
            FlushPolicy::Empty => copy_durable_with(isa, dest, src, len, &mut EmptyFlush, barrier),
            FlushPolicy::Clflush => copy_durable_with(isa, dest, src, len, &mut Clflush, barrier),
            FlushPolicy::ClflushOpt => {
                copy_durable_with(isa, dest, src, len, &mut ClflushOpt, barrier)
            }
            FlushPolicy::Clwb => copy_durable_with(isa, dest, src, len, &mut Clwb, barrier),
        }
    }
}

/// Durable memmove bound to `policy` and its barrier.
///
/// # Safety
///
/// - `dest` and `src` must be valid for reads/writes of `len` bytes
/// - Regions may overlap
/// - The CPU must support `policy` (see [`FlushPolicy::is_supported`])
pub unsafe fn copy_durable(dest: *mut u8, src: *const u8, len: usize, policy: FlushPolicy) {
    unsafe { copy_durable_policy(Isa::detect(), dest, src, len, policy, policy.barrier()) }
}

/// Durable memmove without the trailing fence.
///
/// The copy is only durable once the caller has called
/// [`drain`](crate::flush::drain). Useful to pay for one fence across a
/// batch of copies.
///
/// # Safety
///
/// Same as [`copy_durable`].
pub unsafe fn copy_durable_nodrain(dest: *mut u8, src: *const u8, len: usize, policy: FlushPolicy) {
    unsafe { copy_durable_policy(Isa::detect(), dest, src, len, policy, Barrier::NoFence) }
}

/// Durable copy between slices.
///
/// # Panics
///
/// If the slices differ in length, or the CPU lacks the flush instruction
/// of `policy`.
pub fn persist_copy(dst: &mut [u8], src: &[u8], policy: FlushPolicy) {
    assert_eq!(
        dst.len(),
        src.len(),
        "destination and source slices have different lengths"
    );
    assert!(
        policy.is_supported(),
        "flush policy {} is not supported by this CPU",
        policy
    );
    unsafe { copy_durable(dst.as_mut_ptr(), src.as_ptr(), src.len(), policy) }
}

// =============================================================================
// NAMED ENTRY POINTS
// =============================================================================

/// Streaming memmove, no flush, trailing fence.
///
/// # Safety
///
/// `dest` and `src` must be valid for reads/writes of `len` bytes.
pub unsafe fn memmove_movnt_noflush(dest: *mut u8, src: *const u8, len: usize) {
    unsafe { copy_durable_with(Isa::detect(), dest, src, len, &mut NoFlush, Barrier::Fence) }
}

/// Streaming memmove, edges reported through [`EmptyFlush`], trailing fence.
///
/// # Safety
///
/// `dest` and `src` must be valid for reads/writes of `len` bytes.
pub unsafe fn memmove_movnt_empty(dest: *mut u8, src: *const u8, len: usize) {
    unsafe { copy_durable_with(Isa::detect(), dest, src, len, &mut EmptyFlush, Barrier::Fence) }
}

/// Streaming memmove, edges flushed with `CLFLUSH`, trailing fence.
///
/// # Safety
///
/// `dest` and `src` must be valid for reads/writes of `len` bytes.
pub unsafe fn memmove_movnt_clflush(dest: *mut u8, src: *const u8, len: usize) {
    unsafe { copy_durable_with(Isa::detect(), dest, src, len, &mut Clflush, Barrier::Fence) }
}

/// Streaming memmove, edges flushed with `CLFLUSHOPT`, trailing fence.
///
/// # Safety
///
/// `dest` and `src` must be valid for reads/writes of `len` bytes, and the
/// CPU must support `CLFLUSHOPT`.
pub unsafe fn memmove_movnt_clflushopt(dest: *mut u8, src: *const u8, len: usize) {
    unsafe { copy_durable_with(Isa::detect(), dest, src, len, &mut ClflushOpt, Barrier::Fence) }
}

/// Streaming memmove, edges written back with `CLWB`, trailing fence.
///
/// # Safety
///
/// `dest` and `src` must be valid for reads/writes of `len` bytes, and the
/// CPU must support `CLWB`.
pub unsafe fn memmove_movnt_clwb(dest: *mut u8, src: *const u8, len: usize) {
    unsafe { copy_durable_with(Isa::detect(), dest, src, len, &mut Clwb, Barrier::Fence) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::{FlushRecorder, drain};
    use crate::simd::CACHE_LINE;
    use std::collections::BTreeSet;

    const LENGTHS: [usize; 22] = [
        0, 1, 3, 4, 7, 8, 15, 16, 31, 32, 63, 64, 65, 68, 72, 80, 96, 127, 128, 4095, 4096,
        1_000_003,
    ];

    /// xorshift64*, enough to make every byte position distinguishable.
    fn random_bytes(len: usize, mut seed: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            seed ^= seed >> 12;
            seed ^= seed << 25;
            seed ^= seed >> 27;
            let v = seed.wrapping_mul(0x2545_f491_4f6c_dd1d);
            out.extend_from_slice(&v.to_le_bytes()[..(len - out.len()).min(8)]);
        }
        out
    }

    /// Buffer whose start is 64-byte aligned, with room for any offset.
    struct LineBuf {
        storage: Vec<u8>,
        start: usize,
    }

    impl LineBuf {
        fn new(len: usize) -> Self {
            let storage = vec![0u8; len + 2 * CACHE_LINE];
            let start = storage.as_ptr().align_offset(CACHE_LINE);
            Self { storage, start }
        }

        fn at(&mut self, off: usize) -> *mut u8 {
            unsafe { self.storage.as_mut_ptr().add(self.start + off) }
        }

        fn slice(&self, off: usize, len: usize) -> &[u8] {
            &self.storage[self.start + off..self.start + off + len]
        }
    }

    #[test]
    fn test_round_trip_all_alignments() {
        let max = *LENGTHS.iter().max().unwrap_or(&0);
        let src = random_bytes(max, 0x9e37_79b9_7f4a_7c15);
        for isa in Isa::available() {
            let mut dst = LineBuf::new(max + CACHE_LINE);
            for len in LENGTHS {
                for align in 0..CACHE_LINE {
                    unsafe {
                        copy_durable_with(isa, dst.at(align), src.as_ptr(), len, &mut NoFlush, Barrier::Fence);
                    }
                    assert!(
                        dst.slice(align, len) == &src[..len],
                        "isa={isa} len={len} align={align}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_round_trip_with_real_flush() {
        let src = random_bytes(10_000, 7);
        for policy in FlushPolicy::ALL {
            if !policy.is_supported() {
                continue;
            }
            let mut dst = LineBuf::new(10_000 + CACHE_LINE);
            for (align, len) in [(0usize, 10_000usize), (5, 9_999), (63, 130), (17, 33)] {
                unsafe { copy_durable(dst.at(align), src.as_ptr(), len, policy) };
                assert!(
                    dst.slice(align, len) == &src[..len],
                    "policy={policy} align={align} len={len}"
                );
            }
        }
    }

    fn check_overlap(isa: Isa, len: usize, k: usize) {
        let total = len + k;
        let initial = random_bytes(total, (len * 31 + k) as u64 + 1);

        // Destination ahead of the source.
        let mut got = LineBuf::new(total);
        got.storage[got.start..got.start + total].copy_from_slice(&initial);
        let mut expected = initial.clone();
        unsafe {
            let base = got.at(0);
            copy_durable_with(isa, base.add(k), base, len, &mut NoFlush, Barrier::Fence);
            core::ptr::copy(expected.as_ptr(), expected.as_mut_ptr().add(k), len);
        }
        assert!(
            got.slice(0, total) == &expected[..],
            "dest ahead: isa={isa} len={len} k={k}"
        );

        // Destination behind the source.
        let mut got = LineBuf::new(total);
        got.storage[got.start..got.start + total].copy_from_slice(&initial);
        let mut expected = initial;
        unsafe {
            let base = got.at(0);
            copy_durable_with(isa, base, base.add(k), len, &mut NoFlush, Barrier::Fence);
            core::ptr::copy(expected.as_ptr().add(k), expected.as_mut_ptr(), len);
        }
        assert!(
            got.slice(0, total) == &expected[..],
            "dest behind: isa={isa} len={len} k={k}"
        );
    }

    #[test]
    fn test_overlap_matches_reference_move() {
        for isa in Isa::available() {
            // Every shift for lengths that exercise the edges and all classes.
            for len in [2usize, 7, 64, 65, 130, 300] {
                for k in 1..len {
                    check_overlap(isa, len, k);
                }
            }
            // Sampled shifts for the multi-chunk path.
            for len in [4096usize, 5000] {
                for k in [1usize, 3, 31, 63, 64, 65, 127, 1024, 2047, 2048, 2049, len - 1] {
                    check_overlap(isa, len, k);
                }
            }
        }
    }

    #[test]
    fn test_direction_select() {
        let buf = [0u8; 256];
        let p = buf.as_ptr();
        unsafe {
            assert_eq!(Direction::select(p.add(128), p, 64), Direction::Forward);
            assert_eq!(Direction::select(p, p.add(128), 64), Direction::Forward);
            assert_eq!(Direction::select(p, p.add(1), 64), Direction::Forward);
            assert_eq!(Direction::select(p.add(1), p, 64), Direction::Backward);
            assert_eq!(Direction::select(p.add(63), p, 64), Direction::Backward);
            assert_eq!(Direction::select(p.add(64), p, 64), Direction::Forward);
            assert_eq!(Direction::select(p, p, 0), Direction::Forward);
            assert_eq!(Direction::select(p, p, 1), Direction::Backward);
        }
        // Same inputs, same answer.
        for _ in 0..4 {
            assert_eq!(Direction::select(p.wrapping_add(5), p, 10), Direction::Backward);
        }
    }

    fn lines_covering(start: usize, len: usize) -> BTreeSet<usize> {
        let first = start & !(CACHE_LINE - 1);
        (first..start + len).step_by(CACHE_LINE).collect()
    }

    #[test]
    fn test_small_copy_flush_coverage() {
        let src = random_bytes(64, 3);
        for len in 1..=64usize {
            for align in [0usize, 1, 13, 40, 63] {
                let mut dst = LineBuf::new(256);
                let dest = dst.at(64 + align);
                let mut recorder = FlushRecorder::new();
                unsafe {
                    copy_durable_with(Isa::Sse2, dest, src.as_ptr(), len, &mut recorder, Barrier::Fence);
                }

                // Leading edge up to the line boundary, then a residue that
                // is either one streaming store or another small copy.
                let lead = if align == 0 { 0 } else { (CACHE_LINE - align).min(len) };
                let rest = len - lead;
                let mut expected = lines_covering(dest as usize, lead);
                if !matches!(rest, 0 | 4 | 8 | 16 | 32 | 64) {
                    expected.extend(lines_covering(dest as usize + lead, rest));
                }
                assert_eq!(recorder.lines(), expected, "len={len} align={align}");

                // A copy that never streams flushes exactly the lines it covers.
                if lead == len || (lead == 0 && !matches!(len, 4 | 8 | 16 | 32 | 64)) {
                    assert_eq!(
                        recorder.lines(),
                        lines_covering(dest as usize, len),
                        "len={len} align={align}"
                    );
                }
                assert!(dst.slice(64 + align, len) == &src[..len]);
            }
        }
    }

    #[test]
    fn test_streamed_chunks_are_not_flushed() {
        let src = random_bytes(1 << 16, 11);
        for isa in Isa::available() {
            for len in [64usize, 128, 2048, 4096, 1 << 16] {
                let mut dst = LineBuf::new(len);
                let mut recorder = FlushRecorder::new();
                unsafe {
                    copy_durable_with(isa, dst.at(0), src.as_ptr(), len, &mut recorder, Barrier::Fence);
                }
                assert!(recorder.calls().is_empty(), "isa={isa} len={len}");
                assert!(dst.slice(0, len) == &src[..len]);
            }
        }
    }

    #[test]
    fn test_zero_length_writes_nothing() {
        let src = [0xffu8; 64];
        for barrier in [Barrier::Fence, Barrier::NoFence] {
            let mut dst = LineBuf::new(128);
            let mut recorder = FlushRecorder::new();
            unsafe {
                copy_durable_with(Isa::detect(), dst.at(17), src.as_ptr(), 0, &mut recorder, barrier);
            }
            assert!(recorder.calls().is_empty());
            assert!(dst.storage.iter().all(|&b| b == 0));
        }
        unsafe {
            copy_durable(std::ptr::null_mut(), std::ptr::null(), 0, FlushPolicy::Clflush);
        }
    }

    #[test]
    fn test_repeat_is_idempotent() {
        let src = random_bytes(5_003, 19);
        let mut once = LineBuf::new(5_100);
        let mut twice = LineBuf::new(5_100);
        unsafe {
            copy_durable(once.at(9), src.as_ptr(), src.len(), FlushPolicy::Clflush);
            copy_durable(twice.at(9), src.as_ptr(), src.len(), FlushPolicy::Clflush);
            copy_durable(twice.at(9), src.as_ptr(), src.len(), FlushPolicy::Clflush);
        }
        assert!(once.slice(0, 5_100) == twice.slice(0, 5_100));
    }

    #[test]
    fn test_named_entry_points() {
        let src = random_bytes(3_333, 23);
        let mut entries: Vec<(&str, unsafe fn(*mut u8, *const u8, usize))> = vec![
            ("noflush", memmove_movnt_noflush),
            ("empty", memmove_movnt_empty),
            ("clflush", memmove_movnt_clflush),
        ];
        if FlushPolicy::ClflushOpt.is_supported() {
            entries.push(("clflushopt", memmove_movnt_clflushopt));
        }
        if FlushPolicy::Clwb.is_supported() {
            entries.push(("clwb", memmove_movnt_clwb));
        }
        for (name, entry) in entries {
            let mut dst = LineBuf::new(3_400);
            unsafe { entry(dst.at(21), src.as_ptr(), src.len()) };
            assert!(dst.slice(21, src.len()) == &src[..], "entry {name}");
        }
    }

    #[test]
    fn test_nodrain_then_drain() {
        let src = random_bytes(777, 29);
        let mut dst = LineBuf::new(800);
        unsafe {
            copy_durable_nodrain(dst.at(1), src.as_ptr(), 400, FlushPolicy::Clflush);
            copy_durable_nodrain(dst.at(401), src.as_ptr().add(400), 377, FlushPolicy::Clflush);
        }
        drain();
        assert!(dst.slice(1, 777) == &src[..]);
    }

    #[test]
    fn test_persist_copy_slices() {
        let src = random_bytes(1_500, 31);
        let mut dst = vec![0u8; 1_500];
        persist_copy(&mut dst, &src, FlushPolicy::Clflush);
        assert_eq!(dst, src);
    }

    #[test]
    #[should_panic(expected = "different lengths")]
    fn test_persist_copy_length_mismatch() {
        let src = [1u8; 8];
        let mut dst = [0u8; 9];
        persist_copy(&mut dst, &src, FlushPolicy::NoFlush);
    }
}
