//! Non-temporal store backends for x86_64
//!
//! The copy engine is written once against [`StreamStore`] and instantiated
//! per instruction set. Each backend moves whole cache lines with the widest
//! streaming store it has:
//!
//! - AVX-512F: one 64-byte `vmovntdq` per line
//! - AVX2: two 32-byte `vmovntdq` per line
//! - SSE2: four 16-byte `movntdq` per line
//!
//! A chunk is always loaded completely before its first store, so a chunk
//! whose source and destination overlap is still copied correctly.
//!
//! # Safety
//!
//! Every function here is unsafe: pointers must be valid for the accessed
//! range, the destination of a line store must be 64-byte aligned, and the
//! CPU must implement the backend's instruction set. Callers reach these
//! through a `#[target_feature]` wrapper selected by [`Isa`].

#![allow(unsafe_code)]

use core::arch::x86_64::*;
use std::fmt;
use std::sync::OnceLock;

use crate::config::Config;

/// Cache-line size assumed by the engine and the flush walk.
pub const CACHE_LINE: usize = 64;

// =============================================================================
// ISA SELECTION
// =============================================================================

/// Instruction set used for streaming stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Isa {
    Sse2,
    Avx2,
    Avx512f,
}

static DETECTED: OnceLock<Isa> = OnceLock::new();

impl Isa {
    /// Widest backend the CPU supports, cached after the first call.
    pub fn detect() -> Isa {
        *DETECTED.get_or_init(|| {
            let isa = Self::detect_with(Config::global());
            log::debug!("streaming store backend: {}", isa);
            isa
        })
    }

    /// Widest backend the CPU supports that `config` allows.
    pub fn detect_with(config: &Config) -> Isa {
        if !config.no_avx2 && !config.no_avx512f && Isa::Avx512f.is_supported() {
            Isa::Avx512f
        } else if !config.no_avx2 && Isa::Avx2.is_supported() {
            Isa::Avx2
        } else {
            Isa::Sse2
        }
    }

    pub fn is_supported(self) -> bool {
        match self {
            Isa::Sse2 => true,
            Isa::Avx2 => std::arch::is_x86_feature_detected!("avx2"),
            Isa::Avx512f => std::arch::is_x86_feature_detected!("avx512f"),
        }
    }

    /// All backends this CPU can run, narrowest first.
    pub fn available() -> Vec<Isa> {
        [Isa::Sse2, Isa::Avx2, Isa::Avx512f]
            .into_iter()
            .filter(|isa| isa.is_supported())
            .collect()
    }

    pub fn name(self) -> &'static str {
        match self {
            Isa::Sse2 => "sse2",
            Isa::Avx2 => "avx2",
            Isa::Avx512f => "avx512f",
        }
    }
}

impl fmt::Display for Isa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// STREAMING STORES
// =============================================================================

/// Non-temporal copy primitives of one instruction set.
pub(crate) trait StreamStore {
    /// Stream `LINES` cache lines from `src` to the 64-byte aligned `dest`.
    unsafe fn movnt_lines<const LINES: usize>(dest: *mut u8, src: *const u8);

    /// Stream 32 bytes to the 32-byte aligned `dest`.
    unsafe fn movnt32(dest: *mut u8, src: *const u8);

    /// Stream 16 bytes to the 16-byte aligned `dest`.
    #[inline(always)]
    unsafe fn movnt16(dest: *mut u8, src: *const u8) {
        unsafe {
            let xmm = _mm_loadu_si128(src.cast());
            _mm_stream_si128(dest.cast(), xmm);
        }
    }

    /// Stream 8 bytes (`movnti`, no alignment requirement).
    #[inline(always)]
    unsafe fn movnt8(dest: *mut u8, src: *const u8) {
        unsafe {
            let v = core::ptr::read_unaligned(src as *const i64);
            _mm_stream_si64(dest.cast(), v);
        }
    }

    /// Stream 4 bytes (`movnti`, no alignment requirement).
    #[inline(always)]
    unsafe fn movnt4(dest: *mut u8, src: *const u8) {
        unsafe {
            let v = core::ptr::read_unaligned(src as *const i32);
            _mm_stream_si32(dest.cast(), v);
        }
    }
}

/// SSE2 backend (x86_64 baseline).
pub(crate) struct Sse2;

impl StreamStore for Sse2 {
    #[inline(always)]
    unsafe fn movnt_lines<const LINES: usize>(dest: *mut u8, src: *const u8) {
        unsafe {
            let mut xmm = [[_mm_setzero_si128(); 4]; LINES];
            for (i, line) in xmm.iter_mut().enumerate() {
                let s = src.add(i * CACHE_LINE);
                for (j, reg) in line.iter_mut().enumerate() {
                    *reg = _mm_loadu_si128(s.add(j * 16).cast());
                }
            }
            for (i, line) in xmm.iter().enumerate() {
                let d = dest.add(i * CACHE_LINE);
                for (j, reg) in line.iter().enumerate() {
                    _mm_stream_si128(d.add(j * 16).cast(), *reg);
                }
            }
        }
    }

    #[inline(always)]
    unsafe fn movnt32(dest: *mut u8, src: *const u8) {
        unsafe {
            let x0 = _mm_loadu_si128(src.cast());
            let x1 = _mm_loadu_si128(src.add(16).cast());
            _mm_stream_si128(dest.cast(), x0);
            _mm_stream_si128(dest.add(16).cast(), x1);
        }
    }
}

/// AVX2 backend.
pub(crate) struct Avx2;

impl StreamStore for Avx2 {
    #[inline(always)]
    unsafe fn movnt_lines<const LINES: usize>(dest: *mut u8, src: *const u8) {
        unsafe {
            let mut ymm = [[_mm256_setzero_si256(); 2]; LINES];
            for (i, line) in ymm.iter_mut().enumerate() {
                let s = src.add(i * CACHE_LINE);
                line[0] = _mm256_loadu_si256(s.cast());
                line[1] = _mm256_loadu_si256(s.add(32).cast());
            }
            for (i, line) in ymm.iter().enumerate() {
                let d = dest.add(i * CACHE_LINE);
                _mm256_stream_si256(d.cast(), line[0]);
                _mm256_stream_si256(d.add(32).cast(), line[1]);
            }
        }
    }

    #[inline(always)]
    unsafe fn movnt32(dest: *mut u8, src: *const u8) {
        unsafe {
            let ymm = _mm256_loadu_si256(src.cast());
            _mm256_stream_si256(dest.cast(), ymm);
        }
    }
}

/// AVX-512F backend.
pub(crate) struct Avx512;

impl StreamStore for Avx512 {
    #[inline(always)]
    unsafe fn movnt_lines<const LINES: usize>(dest: *mut u8, src: *const u8) {
        unsafe {
            let mut zmm = [_mm512_setzero_si512(); LINES];
            for (i, reg) in zmm.iter_mut().enumerate() {
                *reg = _mm512_loadu_si512(src.add(i * CACHE_LINE).cast());
            }
            for (i, reg) in zmm.iter().enumerate() {
                _mm512_stream_si512(dest.add(i * CACHE_LINE).cast(), *reg);
            }
        }
    }

    #[inline(always)]
    unsafe fn movnt32(dest: *mut u8, src: *const u8) {
        // No point in a masked zmm store for half a line.
        unsafe { Avx2::movnt32(dest, src) }
    }
}
