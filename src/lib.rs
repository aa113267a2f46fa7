//! pmemmove: durable memmove for persistent memory on x86_64.
//!
//! Copies stream the cache-line aligned bulk with non-temporal stores,
//! write the unaligned edges with ordinary stores plus a cache-line flush,
//! and end with a single store fence.

#[cfg(not(target_arch = "x86_64"))]
compile_error!("pmemmove only supports x86_64");

pub mod barrier;
pub mod config;
pub mod flush;
pub mod memmove;
mod movnt;
pub mod region;
pub mod simd;
mod small;
pub mod stats;

pub use barrier::Barrier;
pub use config::Config;
pub use flush::{
    Clflush, ClflushOpt, Clwb, EmptyFlush, Flush, FlushPolicy, FlushRecorder, NoFlush, drain,
    persist,
};
pub use memmove::{
    Direction, copy_durable, copy_durable_nodrain, copy_durable_with, memmove_movnt_clflush,
    memmove_movnt_clflushopt, memmove_movnt_clwb, memmove_movnt_empty, memmove_movnt_noflush,
    persist_copy,
};
pub use region::{DevDaxRegion, FileRegion, PmemRegion};
pub use simd::{CACHE_LINE, Isa};
