//! Environment-driven configuration.
//!
//! All knobs only ever *restrict* what runtime detection picks, so a
//! configured process can never select an instruction the CPU lacks.

use std::sync::OnceLock;

/// Caps the ISA backend.
pub const ENV_NO_AVX512F: &str = "PMEMMOVE_NO_AVX512F";
/// Caps the ISA backend at SSE2.
pub const ENV_NO_AVX2: &str = "PMEMMOVE_NO_AVX2";
/// Keeps `FlushPolicy::detect` from choosing CLWB.
pub const ENV_NO_CLWB: &str = "PMEMMOVE_NO_CLWB";
/// Keeps `FlushPolicy::detect` from choosing CLFLUSHOPT.
pub const ENV_NO_CLFLUSHOPT: &str = "PMEMMOVE_NO_CLFLUSHOPT";
/// Makes `FlushPolicy::detect` return `NoFlush`.
pub const ENV_NO_FLUSH: &str = "PMEMMOVE_NO_FLUSH";

/// Detection overrides.
///
/// Default: everything allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Config {
    /// Never use the AVX-512F streaming backend.
    pub no_avx512f: bool,
    /// Never use the AVX2 (or AVX-512F) streaming backend.
    pub no_avx2: bool,
    /// Never pick CLWB during flush detection.
    pub no_clwb: bool,
    /// Never pick CLFLUSHOPT during flush detection.
    pub no_clflushopt: bool,
    /// Detected flush policy is `NoFlush`.
    pub no_flush: bool,
}

static GLOBAL: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Create a configuration with nothing disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    ///
    /// A variable is treated as set only when its value is `1`.
    pub fn from_lookup<L>(lookup: L) -> Self
    where
        L: Fn(&str) -> Option<String>,
    {
        let set = |name: &str| lookup(name).is_some_and(|v| v.trim() == "1");
        Self {
            no_avx512f: set(ENV_NO_AVX512F),
            no_avx2: set(ENV_NO_AVX2),
            no_clwb: set(ENV_NO_CLWB),
            no_clflushopt: set(ENV_NO_CLFLUSHOPT),
            no_flush: set(ENV_NO_FLUSH),
        }
    }

    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static Config {
        GLOBAL.get_or_init(|| {
            let config = Self::from_env();
            if config != Self::default() {
                log::debug!("pmemmove configuration overrides: {:?}", config);
            }
            config
        })
    }

    /// Disable the AVX-512F backend.
    pub fn with_no_avx512f(mut self, no_avx512f: bool) -> Self {
        self.no_avx512f = no_avx512f;
        self
    }

    /// Disable the AVX2 backend.
    pub fn with_no_avx2(mut self, no_avx2: bool) -> Self {
        self.no_avx2 = no_avx2;
        self
    }

    /// Disable CLWB in flush detection.
    pub fn with_no_clwb(mut self, no_clwb: bool) -> Self {
        self.no_clwb = no_clwb;
        self
    }

    /// Disable CLFLUSHOPT in flush detection.
    pub fn with_no_clflushopt(mut self, no_clflushopt: bool) -> Self {
        self.no_clflushopt = no_clflushopt;
        self
    }

    /// Disable flushing in flush detection.
    pub fn with_no_flush(mut self, no_flush: bool) -> Self {
        self.no_flush = no_flush;
        self
    }
}
