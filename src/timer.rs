//! Cumulative per-stage timing
//!
//! The scheduler accumulates how much wall-clock time was spent pulling
//! input, inside `transform`, inside `combine`, and outside of `execute`
//! altogether. Worker time is summed across threads, so the map stage can
//! exceed the elapsed wall time.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// The stages timed by the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Input,
    Map,
    Reduce,
    Outside,
}
impl Stage {
    const ALL: [Stage; 4] = [Stage::Input, Stage::Map, Stage::Reduce, Stage::Outside];

    fn label(self) -> &'static str {
        match self {
            Self::Input => "Input   time",
            Self::Map => "Map     time",
            Self::Reduce => "Reduce  time",
            Self::Outside => "Outside time",
        }
    }
}

/// Thread-safe accumulator of nanoseconds per stage
#[derive(Debug)]
pub struct StageTimes {
    input: AtomicU64,
    map: AtomicU64,
    reduce: AtomicU64,
    outside: AtomicU64,
    /// Start of the current stretch of time spent outside `execute`
    outside_since: Mutex<Option<Instant>>,
}
impl Default for StageTimes {
    fn default() -> Self {
        Self::new()
    }
}
impl StageTimes {
    /// Creates a new accumulator; the outside clock starts running immediately
    #[must_use]
    pub fn new() -> Self {
        Self {
            input: AtomicU64::new(0),
            map: AtomicU64::new(0),
            reduce: AtomicU64::new(0),
            outside: AtomicU64::new(0),
            outside_since: Mutex::new(Some(Instant::now())),
        }
    }

    fn counter(&self, stage: Stage) -> &AtomicU64 {
        match stage {
            Stage::Input => &self.input,
            Stage::Map => &self.map,
            Stage::Reduce => &self.reduce,
            Stage::Outside => &self.outside,
        }
    }

    pub fn add(&self, stage: Stage, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.counter(stage).fetch_add(nanos, Ordering::Relaxed);
    }

    /// Runs `f` and charges its wall-clock time to `stage`
    pub fn time<T>(&self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.add(stage, start.elapsed());
        out
    }

    /// Stops the outside clock (entering `execute`)
    pub fn stop_outside(&self) {
        if let Some(since) = self.outside_since.lock().take() {
            self.add(Stage::Outside, since.elapsed());
        }
    }

    /// Restarts the outside clock (leaving `execute`)
    pub fn restart_outside(&self) {
        let mut since = self.outside_since.lock();
        if since.is_none() {
            *since = Some(Instant::now());
        }
    }

    /// A snapshot of the accumulated times
    #[must_use]
    pub fn report(&self) -> TimingReport {
        let load = |stage| Duration::from_nanos(self.counter(stage).load(Ordering::Relaxed));
        TimingReport {
            input: load(Stage::Input),
            map: load(Stage::Map),
            reduce: load(Stage::Reduce),
            outside: load(Stage::Outside),
        }
    }
}

/// Accumulated time per stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingReport {
    pub input: Duration,
    pub map: Duration,
    pub reduce: Duration,
    pub outside: Duration,
}
impl TimingReport {
    #[must_use]
    pub fn get(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Input => self.input,
            Stage::Map => self.map,
            Stage::Reduce => self.reduce,
            Stage::Outside => self.outside,
        }
    }

    #[must_use]
    pub fn total(&self) -> Duration {
        self.input + self.map + self.reduce + self.outside
    }

    /// Percentage of the total attributed to `stage` (0 when nothing was timed)
    #[must_use]
    pub fn percent(&self, stage: Stage) -> f64 {
        let total = self.total().as_secs_f64();
        if total == 0.0 {
            0.0
        } else {
            self.get(stage).as_secs_f64() / total * 100.0
        }
    }
}
impl fmt::Display for TimingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, stage) in Stage::ALL.into_iter().enumerate() {
            if idx > 0 {
                writeln!(f)?;
            }
            write!(
                f,
                "{}: {:.3?} ({:5.2}%)",
                stage.label(),
                self.get(stage),
                self.percent(stage)
            )?;
        }
        Ok(())
    }
}
