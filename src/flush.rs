//! Cache-line flush policies.
//!
//! The [`Flush`] implementations here are the *unfenced* variants the copy
//! engine calls on the edges it writes with ordinary stores. Ordering is
//! left to the [`Barrier`](crate::barrier::Barrier) applied once at the end
//! of a copy. [`persist`] is the standalone, fenced form for callers that
//! wrote the bytes themselves.
#![allow(unsafe_code)]

use core::arch::x86_64::{__cpuid, __get_cpuid_max, _mm_clflush, _mm_sfence};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::barrier::Barrier;
use crate::config::Config;
use crate::simd::CACHE_LINE;

/// Something that forces modified cache lines towards the persistence domain.
pub trait Flush {
    /// Flush every cache line overlapping `[addr, addr + len)`.
    ///
    /// # Safety
    ///
    /// `addr` must point to mapped memory covering `len` bytes, and the CPU
    /// must implement the instruction the implementation issues.
    unsafe fn flush(&mut self, addr: *const u8, len: usize);
}

/// Call `f` with the start address of each cache line covering the range.
#[inline(always)]
fn for_each_line(addr: *const u8, len: usize, mut f: impl FnMut(*const u8)) {
    let end = addr as usize + len;
    let mut line = (addr as usize) & !(CACHE_LINE - 1);
    while line < end {
        f(line as *const u8);
        line += CACHE_LINE;
    }
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFlush;

impl Flush for NoFlush {
    #[inline(always)]
    unsafe fn flush(&mut self, _addr: *const u8, _len: usize) {}
}

/// Does nothing, but reports the range it would have flushed to the
/// `log` facade at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyFlush;

impl Flush for EmptyFlush {
    #[inline(always)]
    unsafe fn flush(&mut self, addr: *const u8, len: usize) {
        log::trace!("flush {:#x} ({})", addr as usize, len);
    }
}

/// `CLFLUSH`: evicting, ordered against other stores and flushes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clflush;

impl Flush for Clflush {
    #[inline(always)]
    unsafe fn flush(&mut self, addr: *const u8, len: usize) {
        for_each_line(addr, len, |line| unsafe { _mm_clflush(line) });
    }
}

/// `CLFLUSHOPT`: evicting, weakly ordered.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClflushOpt;

impl Flush for ClflushOpt {
    #[inline(always)]
    unsafe fn flush(&mut self, addr: *const u8, len: usize) {
        for_each_line(addr, len, |line| unsafe {
            std::arch::asm!(
                "clflushopt [{addr}]",
                addr = in(reg) line,
                options(nostack, preserves_flags)
            );
        });
    }
}

/// `CLWB`: writes the line back without evicting it, weakly ordered.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clwb;

impl Flush for Clwb {
    #[inline(always)]
    unsafe fn flush(&mut self, addr: *const u8, len: usize) {
        for_each_line(addr, len, |line| unsafe {
            std::arch::asm!(
                "clwb [{addr}]",
                addr = in(reg) line,
                options(nostack, preserves_flags)
            );
        });
    }
}

/// Records every flush request instead of issuing one.
///
/// Lets tests and tooling see exactly which ranges a copy would have
/// flushed.
#[derive(Debug, Clone, Default)]
pub struct FlushRecorder {
    calls: Vec<(usize, usize)>,
}

impl FlushRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(address, length)` of every flush call, in call order.
    pub fn calls(&self) -> &[(usize, usize)] {
        &self.calls
    }

    /// Start addresses of all cache lines touched by any recorded call.
    pub fn lines(&self) -> BTreeSet<usize> {
        let mut lines = BTreeSet::new();
        for &(addr, len) in &self.calls {
            for_each_line(addr as *const u8, len, |line| {
                lines.insert(line as usize);
            });
        }
        lines
    }

    pub fn clear(&mut self) {
        self.calls.clear();
    }
}

impl Flush for FlushRecorder {
    unsafe fn flush(&mut self, addr: *const u8, len: usize) {
        self.calls.push((addr as usize, len));
    }
}

/// Store fence. Orders earlier non-temporal stores and weakly ordered
/// flushes before anything issued afterwards.
#[inline(always)]
pub fn drain() {
    unsafe { _mm_sfence() };
}

// =============================================================================
// POLICY SELECTION
// =============================================================================

/// Named flush behaviours a durable copy can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlushPolicy {
    /// No flushing at all.
    NoFlush,
    /// No flushing; ranges are reported through [`EmptyFlush`].
    Empty,
    /// `CLFLUSH`
    Clflush,
    /// `CLFLUSHOPT`
    ClflushOpt,
    /// `CLWB`
    Clwb,
}

#[derive(Debug, Clone, Copy)]
struct CpuFlags {
    clflush: bool,
    clflushopt: bool,
    clwb: bool,
}

static CPU_FLAGS: OnceLock<CpuFlags> = OnceLock::new();
static DETECTED: OnceLock<FlushPolicy> = OnceLock::new();

fn cpu_flags() -> CpuFlags {
    *CPU_FLAGS.get_or_init(|| {
        #[allow(unused_unsafe)]
        unsafe {
            // CLFSH: CPUID.01H:EDX[19]
            let clflush = (__cpuid(1).edx & (1 << 19)) != 0;
            let (max_leaf, _) = __get_cpuid_max(0);
            let ebx7 = if max_leaf >= 7 { __cpuid(7).ebx } else { 0 };
            CpuFlags {
                clflush,
                // CPUID.07H:EBX[23]
                clflushopt: (ebx7 & (1 << 23)) != 0,
                // CPUID.07H:EBX[24]
                clwb: (ebx7 & (1 << 24)) != 0,
            }
        }
    })
}

impl FlushPolicy {
    pub const ALL: [FlushPolicy; 5] = [
        FlushPolicy::NoFlush,
        FlushPolicy::Empty,
        FlushPolicy::Clflush,
        FlushPolicy::ClflushOpt,
        FlushPolicy::Clwb,
    ];

    /// Best flush instruction this CPU offers, cached after the first call.
    pub fn detect() -> FlushPolicy {
        *DETECTED.get_or_init(|| {
            let policy = Self::detect_with(Config::global());
            log::debug!("detected flush policy: {}", policy);
            policy
        })
    }

    /// Best flush instruction this CPU offers that `config` allows.
    pub fn detect_with(config: &Config) -> FlushPolicy {
        if config.no_flush {
            return FlushPolicy::NoFlush;
        }
        let flags = cpu_flags();
        if flags.clwb && !config.no_clwb {
            FlushPolicy::Clwb
        } else if flags.clflushopt && !config.no_clflushopt {
            FlushPolicy::ClflushOpt
        } else {
            // CLFLUSH is part of the x86_64 baseline.
            FlushPolicy::Clflush
        }
    }

    /// Whether this CPU can execute the instruction the policy issues.
    pub fn is_supported(self) -> bool {
        match self {
            FlushPolicy::NoFlush | FlushPolicy::Empty => true,
            FlushPolicy::Clflush => cpu_flags().clflush,
            FlushPolicy::ClflushOpt => cpu_flags().clflushopt,
            FlushPolicy::Clwb => cpu_flags().clwb,
        }
    }

    /// Whether the policy moves anything out of the cache.
    pub fn flushes(self) -> bool {
        !matches!(self, FlushPolicy::NoFlush | FlushPolicy::Empty)
    }

    /// Barrier a copy bound to this policy ends with.
    ///
    /// None of the in-engine flushes fence, and the streaming stores always
    /// need one, so every policy takes the store fence.
    pub fn barrier(self) -> Barrier {
        Barrier::Fence
    }

    pub fn name(self) -> &'static str {
        match self {
            FlushPolicy::NoFlush => "noflush",
            FlushPolicy::Empty => "empty",
            FlushPolicy::Clflush => "clflush",
            FlushPolicy::ClflushOpt => "clflushopt",
            FlushPolicy::Clwb => "clwb",
        }
    }
}

impl fmt::Display for FlushPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error returned when parsing an unknown flush policy name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsePolicyError(String);

impl fmt::Display for ParsePolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown flush policy '{}' (expected noflush, empty, clflush, clflushopt or clwb)",
            self.0
        )
    }
}

impl std::error::Error for ParsePolicyError {}

impl FromStr for FlushPolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        FlushPolicy::ALL
            .into_iter()
            .find(|p| p.name() == lower)
            .ok_or_else(|| ParsePolicyError(s.to_string()))
    }
}

/// Flush `[addr, addr + len)` with `policy` and fence so the flushes are
/// complete before any later store.
///
/// - `Clflush`: flush each line, then `sfence`.
/// - `ClflushOpt`: `sfence`, flush each line, `sfence`. The leading fence
///   keeps the flushes from passing earlier non-temporal stores.
/// - `Clwb`: write back each line, then `sfence`.
/// - `NoFlush`, `Empty`: nothing is fenced.
///
/// # Safety
///
/// `addr` must point to mapped memory covering `len` bytes and the CPU must
/// support `policy` (see [`FlushPolicy::is_supported`]).
pub unsafe fn persist(addr: *const u8, len: usize, policy: FlushPolicy) {
    unsafe {
        match policy {
            FlushPolicy::NoFlush => NoFlush.flush(addr, len),
            FlushPolicy::Empty => EmptyFlush.flush(addr, len),
            FlushPolicy::Clflush => {
                Clflush.flush(addr, len);
                drain();
            }
            FlushPolicy::ClflushOpt => {
                drain();
                ClflushOpt.flush(addr, len);
                drain();
            }
            FlushPolicy::Clwb => {
                Clwb.flush(addr, len);
                drain();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clflush_always_available() {
        assert!(FlushPolicy::Clflush.is_supported());
        assert!(FlushPolicy::NoFlush.is_supported());
        assert!(FlushPolicy::Empty.is_supported());
    }

    #[test]
    fn test_detected_policy_is_supported() {
        let policy = FlushPolicy::detect();
        assert!(policy.is_supported(), "detected {} but CPU lacks it", policy);
        assert_eq!(policy, FlushPolicy::detect());
    }

    #[test]
    fn test_detect_respects_config() {
        let config = Config::new().with_no_clwb(true).with_no_clflushopt(true);
        assert_eq!(FlushPolicy::detect_with(&config), FlushPolicy::Clflush);

        let config = Config::new().with_no_flush(true);
        assert_eq!(FlushPolicy::detect_with(&config), FlushPolicy::NoFlush);

        let config = Config::new().with_no_clwb(true);
        let expected = if FlushPolicy::ClflushOpt.is_supported() {
            FlushPolicy::ClflushOpt
        } else {
            FlushPolicy::Clflush
        };
        assert_eq!(FlushPolicy::detect_with(&config), expected);
    }

    #[test]
    fn test_policy_names_round_trip() {
        for policy in FlushPolicy::ALL {
            assert_eq!(policy.to_string().parse::<FlushPolicy>(), Ok(policy));
        }
        assert_eq!("CLWB".parse::<FlushPolicy>(), Ok(FlushPolicy::Clwb));
        assert!("wbinvd".parse::<FlushPolicy>().is_err());
    }

    #[test]
    fn test_recorder_lines_cover_range() {
        let mut recorder = FlushRecorder::new();
        unsafe {
            recorder.flush((0x1000 + 60) as *const u8, 8);
            recorder.flush(0x2000 as *const u8, 64);
            recorder.flush(0x3000 as *const u8, 0);
        }
        assert_eq!(recorder.calls().len(), 3);
        let lines: Vec<usize> = recorder.lines().into_iter().collect();
        assert_eq!(lines, vec![0x1000, 0x1040, 0x2000]);

        recorder.clear();
        assert!(recorder.calls().is_empty());
    }

    #[test]
    fn test_flush_zero_length() {
        // Should not touch the (null) address.
        unsafe {
            Clflush.flush(std::ptr::null(), 0);
            persist(std::ptr::null(), 0, FlushPolicy::Clflush);
        }
    }

    #[test]
    fn test_persist_unaligned() {
        let data = vec![0u8; 256];
        let unaligned = unsafe { data.as_ptr().add(7) };
        for policy in FlushPolicy::ALL {
            if !policy.is_supported() {
                continue;
            }
            unsafe { persist(unaligned, 100, policy) };
        }
        assert!(data.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_flush_keeps_contents() {
        let mut data = vec![0u8; 4096];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut flushes: Vec<Box<dyn FnMut(*const u8, usize)>> = vec![
            Box::new(|p, n| unsafe { Clflush.flush(p, n) }),
            Box::new(|p, n| unsafe { EmptyFlush.flush(p, n) }),
        ];
        if FlushPolicy::Clwb.is_supported() {
            flushes.push(Box::new(|p, n| unsafe { Clwb.flush(p, n) }));
        }
        if FlushPolicy::ClflushOpt.is_supported() {
            flushes.push(Box::new(|p, n| unsafe { ClflushOpt.flush(p, n) }));
        }
        for flush in flushes.iter_mut() {
            flush(data.as_ptr().wrapping_add(3), 4000);
            drain();
        }
        for (i, b) in data.iter().enumerate() {
            assert_eq!(*b, (i % 251) as u8, "byte {} changed", i);
        }
    }
}
