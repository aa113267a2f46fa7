//! Shared counters for bandwidth measurement.
//!
//! Workers and the reporter share these by reference; nothing here is a
//! process global.

use std::hint::spin_loop;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[repr(align(64))]
#[derive(Debug, Default)]
struct PaddedCounter(AtomicU64);

/// Per-worker completed-copy counters, one cache line each.
#[derive(Debug)]
pub struct Throughput {
    counters: Box<[PaddedCounter]>,
}

impl Throughput {
    pub fn new(workers: usize) -> Self {
        Self {
            counters: (0..workers).map(|_| PaddedCounter::default()).collect(),
        }
    }

    pub fn workers(&self) -> usize {
        self.counters.len()
    }

    /// Count one finished copy for `worker`.
    #[inline]
    pub fn record(&self, worker: usize) {
        self.add(worker, 1);
    }

    #[inline]
    pub fn add(&self, worker: usize, n: u64) {
        self.counters[worker].0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, worker: usize) -> u64 {
        self.counters[worker].0.load(Ordering::Relaxed)
    }

    /// Sum over all workers.
    pub fn total(&self) -> u64 {
        self.counters
            .iter()
            .map(|c| c.0.load(Ordering::Relaxed))
            .sum()
    }
}

/// Rendezvous of all workers plus the reporter, and a count of workers
/// still running.
#[derive(Debug)]
pub struct StartLine {
    parties: usize,
    arrived: AtomicUsize,
    running: AtomicUsize,
}

impl StartLine {
    /// `workers` workers and one reporter.
    pub fn new(workers: usize) -> Self {
        Self {
            parties: workers + 1,
            arrived: AtomicUsize::new(0),
            running: AtomicUsize::new(workers),
        }
    }

    /// Spin until every party has arrived.
    pub fn arrive_and_wait(&self) {
        self.arrived.fetch_add(1, Ordering::AcqRel);
        while self.arrived.load(Ordering::Acquire) < self.parties {
            spin_loop();
        }
    }

    /// Mark the calling worker as finished.
    pub fn depart(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }

    /// Workers that have not departed yet.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

/// Bytes per second in GB/s (10^9).
pub fn gb_per_sec(copies: u64, granularity: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs == 0.0 {
        return 0.0;
    }
    (copies as f64 * granularity as f64) / 1e9 / secs
}

/// Turns successive `Throughput::total` readings into rates.
#[derive(Debug)]
pub struct Sampler {
    granularity: usize,
    last_total: u64,
    last_at: Instant,
}

impl Sampler {
    pub fn new(granularity: usize, now: Instant) -> Self {
        Self {
            granularity,
            last_total: 0,
            last_at: now,
        }
    }

    /// Rate since the previous sample, in GB/s.
    pub fn sample(&mut self, total: u64, now: Instant) -> f64 {
        let delta = total.saturating_sub(self.last_total);
        let elapsed = now.saturating_duration_since(self.last_at);
        self.last_total = total;
        self.last_at = now;
        gb_per_sec(delta, self.granularity, elapsed)
    }
}
