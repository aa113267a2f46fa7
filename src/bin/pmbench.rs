//! Persistent-memory write bandwidth benchmark.
//!
//! Each worker repeatedly copies a volatile buffer of `granularity` bytes
//! into its own slice of a mapped region with the chosen flush policy; the
//! main thread prints the aggregate bandwidth once per second.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail, ensure};
use clap::Parser;
use pmemmove::stats::{Sampler, StartLine, Throughput};
use pmemmove::{DevDaxRegion, FileRegion, FlushPolicy, Isa, PmemRegion, copy_durable};

#[derive(Parser, Debug)]
#[command(name = "pmbench")]
#[command(about = "Test PM I/O bandwidth")]
struct Cli {
    /// Number of worker threads
    #[arg(short = 't', long, default_value = "1")]
    threads: usize,

    /// Bytes per copy; accepts k/K and m/M suffixes (e.g. 4k)
    #[arg(short = 'g', long, default_value = "64", value_parser = parse_size)]
    granularity: usize,

    /// Flush policy: noflush, empty, clflush, clflushopt or clwb (default: best available)
    #[arg(short = 'p', long)]
    policy: Option<FlushPolicy>,

    /// Device-DAX path, e.g. /dev/dax0.0
    #[arg(long, conflicts_with = "file")]
    device: Option<PathBuf>,

    /// File to create and map instead of a device
    #[arg(long)]
    file: Option<PathBuf>,

    /// Region size; accepts k/K, m/M and g/G suffixes
    #[arg(short = 's', long, default_value = "1g", value_parser = parse_size)]
    size: usize,

    /// Copies per worker
    #[arg(short = 'n', long, default_value = "10000000")]
    ops: u64,

    /// Pin worker i to core i and the reporter to core `threads`
    #[arg(long)]
    pin: bool,
}

/// Parse `64`, `4k`, `2M`, `1g`.
fn parse_size(s: &str) -> Result<usize, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 10),
        Some('m' | 'M') => (&s[..s.len() - 1], 20),
        Some('g' | 'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let n: usize = digits
        .parse()
        .map_err(|e| format!("invalid size '{}': {}", s, e))?;
    n.checked_mul(1usize << shift)
        .filter(|&v| v > 0)
        .ok_or_else(|| format!("invalid size '{}'", s))
}

fn pin_to_core(core_id: usize) -> Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core_id, &mut set);
        let ret = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to pin to core {}", core_id));
        }
    }
    Ok(())
}

fn map_region(cli: &Cli) -> Result<Box<dyn PmemRegion>> {
    match (&cli.device, &cli.file) {
        (Some(dev), None) => {
            let region = unsafe { DevDaxRegion::open_len(dev, cli.size) }
                .with_context(|| format!("cannot map {}", dev.display()))?;
            Ok(Box::new(region))
        }
        (None, Some(file)) => {
            let region = unsafe { FileRegion::create(file, cli.size) }
                .with_context(|| format!("cannot map {}", file.display()))?;
            Ok(Box::new(region))
        }
        _ => bail!("exactly one of --device or --file is required"),
    }
}

struct Worker<'a> {
    id: usize,
    region: &'a dyn PmemRegion,
    policy: FlushPolicy,
    granularity: usize,
    threads: usize,
    ops: u64,
    pin: bool,
    thpt: &'a Throughput,
    start: &'a StartLine,
}

impl Worker<'_> {
    fn run(self) -> Result<()> {
        // A failed pin must not keep the others waiting at the start line.
        if self.pin {
            if let Err(e) = pin_to_core(self.id) {
                log::warn!("worker {}: {:#}", self.id, e);
            }
        }
        let local = vec![self.id as u8; self.granularity];

        let units = (self.region.len() / self.threads) / self.granularity;
        let base = units * self.granularity * self.id;

        self.start.arrive_and_wait();
        for i in 0..self.ops {
            let slot = (i % units as u64) as usize;
            unsafe {
                let dest = self.region.as_ptr().add(base + slot * self.granularity);
                copy_durable(dest, local.as_ptr(), self.granularity, self.policy);
            }
            self.thpt.record(self.id);
        }
        self.start.depart();
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    ensure!(cli.threads > 0, "--threads must be at least 1");
    let policy = cli.policy.unwrap_or_else(FlushPolicy::detect);
    ensure!(
        policy.is_supported(),
        "flush policy {} is not supported by this CPU",
        policy
    );

    let region = map_region(&cli)?;
    ensure!(
        region.len() / cli.threads >= cli.granularity,
        "region of {} bytes is too small for {} threads at {} bytes per copy",
        region.len(),
        cli.threads,
        cli.granularity
    );
    log::info!(
        "{} threads, {} bytes per copy, policy {}, backend {}",
        cli.threads,
        cli.granularity,
        policy,
        Isa::detect()
    );

    if cli.pin {
        pin_to_core(cli.threads)?;
    }

    let thpt = Throughput::new(cli.threads);
    let start = StartLine::new(cli.threads);
    let region: &dyn PmemRegion = &*region;

    std::thread::scope(|s| -> Result<()> {
        let handles = (0..cli.threads)
            .map(|id| {
                let worker = Worker {
                    id,
                    region,
                    policy,
                    granularity: cli.granularity,
                    threads: cli.threads,
                    ops: cli.ops,
                    pin: cli.pin,
                    thpt: &thpt,
                    start: &start,
                };
                std::thread::Builder::new()
                    .name(format!("pmbench-{}", id))
                    .spawn_scoped(s, move || worker.run())
                    .context("failed to spawn worker")
            })
            .collect::<Result<Vec<_>>>()?;

        start.arrive_and_wait();
        let mut sampler = Sampler::new(cli.granularity, Instant::now());
        let mut next = Instant::now() + Duration::from_secs(1);
        while start.running() > 0 {
            let now = Instant::now();
            if now < next {
                std::thread::sleep((next - now).min(Duration::from_millis(10)));
                continue;
            }
            next += Duration::from_secs(1);
            if start.running() == 0 {
                break;
            }
            println!("{:.3} GB/s", sampler.sample(thpt.total(), now));
        }

        for handle in handles {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("worker thread panicked"),
            }
        }
        Ok(())
    })?;

    log::info!("total copies: {}", thpt.total());
    Ok(())
}
