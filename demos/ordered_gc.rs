use anyhow::{bail, Result};
use nanosched::prelude::*;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

const BASES: [u8; 4] = *b"ACGT";

/// Per-read summary computed on the worker threads
#[derive(Debug, Clone, Copy)]
pub struct GcStats {
    gc: usize,
    len: usize,
}
impl GcStats {
    pub fn from_read(read: &[u8]) -> Result<Self> {
        let mut gc = 0;
        for &base in read {
            match base {
                b'G' | b'C' => gc += 1,
                b'A' | b'T' | b'N' => {}
                _ => bail!("invalid base: {}", base as char),
            }
        }
        Ok(Self {
            gc,
            len: read.len(),
        })
    }

    pub fn percent(&self) -> usize {
        if self.len == 0 {
            0
        } else {
            self.gc * 100 / self.len
        }
    }
}

/// Order-sensitive summary folded on the calling thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcSummary {
    checksum: u64,
    histogram: Vec<usize>,
}
impl Default for GcSummary {
    fn default() -> Self {
        Self {
            checksum: 17,
            histogram: vec![0; 101],
        }
    }
}
impl GcSummary {
    pub fn add(mut self, stats: GcStats) -> Result<Self> {
        self.checksum = self
            .checksum
            .wrapping_mul(1_000_003)
            .wrapping_add(stats.gc as u64);
        self.histogram[stats.percent()] += 1;
        Ok(self)
    }
}

fn random_reads(num_reads: usize, read_len: usize, seed: u64) -> impl Iterator<Item = Vec<u8>> {
    let mut rng = SmallRng::seed_from_u64(seed);
    (0..num_reads).map(move |_| {
        (0..read_len)
            .map(|_| BASES[rng.random_range(0..BASES.len())])
            .collect()
    })
}

fn gc_summary(scheduler: &mut Scheduler, num_reads: usize, read_len: usize) -> Result<GcSummary> {
    let summary = scheduler.execute(
        random_reads(num_reads, read_len, 42),
        |read| GcStats::from_read(&read),
        GcSummary::default(),
        |stats, summary: GcSummary| summary.add(stats),
    )?;
    Ok(summary)
}

fn time_it<T>(f: impl FnOnce() -> Result<T>, name: &str) -> Result<T> {
    let start = Instant::now();
    let out = f()?;
    println!("{name}: {:?}", start.elapsed());
    Ok(out)
}

pub fn main() -> Result<()> {
    pretty_env_logger::init();

    let num_reads = 200_000;
    let read_len = 150;
    let n_threads = num_cpus::get();

    let mut single = Scheduler::new(100, 1)?;
    let expected = time_it(
        || gc_summary(&mut single, num_reads, read_len),
        "gc - 1 thread",
    )?;

    let mut scheduler = Scheduler::with_threads(n_threads)?;
    scheduler.set_progress_monitor(LogProgress::new("gc"));
    let observed = time_it(
        || gc_summary(&mut scheduler, num_reads, read_len),
        &format!("gc - {n_threads} threads"),
    )?;

    if expected != observed {
        bail!("parallel summary differs from the sequential one");
    }
    println!("checksum: {:#018x}", observed.checksum);

    let modal = observed
        .histogram
        .iter()
        .enumerate()
        .max_by_key(|(_, n)| **n)
        .map_or(0, |(pct, _)| pct);
    println!("modal GC content: {modal}%");

    // a malformed read fails the whole run with its sequence id
    let reads = vec![b"ACGT".to_vec(), b"ACXT".to_vec(), b"GGCC".to_vec()];
    match scheduler.execute(
        reads,
        |read| GcStats::from_read(&read),
        GcSummary::default(),
        |stats, summary: GcSummary| summary.add(stats),
    ) {
        Ok(_) => bail!("malformed read was accepted"),
        Err(err) => println!("expected failure: {err}"),
    }

    scheduler.shutdown();
    single.shutdown();
    Ok(())
}
