use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{bounded, unbounded};
use crossbeam::sync::WaitGroup;

use crate::error::{ConfigError, Result, StateError};
use crate::pool::{MapJob, WorkerPool};
use crate::producer::Producer;
use crate::progress::ProgressMonitor;
use crate::reducer::Reducer;
use crate::timer::{StageTimes, TimingReport};
use crate::tracker::ErrorTracker;

/// Input buffer size per worker thread when none is configured
pub const DEFAULT_BUFFER_PER_THREAD: usize = 100;

/// Ordered parallel map/reduce over a sequential input stream.
///
/// `execute` behaves exactly like
///
/// ```text
/// let mut acc = initial;
/// for element in source {
///     acc = combine(transform(element)?, acc)?;
/// }
/// ```
///
/// except that `transform` runs on a pool of worker threads. `combine` is
/// always called on the calling thread, in source order, whatever order the
/// workers finish in, so the result does not depend on the thread count.
///
/// At most `buffer_size` elements of a run are in memory at once, counting
/// those queued for the workers, being transformed, and transformed but not
/// yet folded. A slow `combine` therefore throttles the source rather than
/// letting results pile up.
///
/// The worker pool is created with the scheduler and reused by every
/// `execute` until [`Scheduler::shutdown`].
///
/// # Example
///
/// ```rust
/// use nanosched::Scheduler;
///
/// let mut scheduler = Scheduler::new(1000, 4).unwrap();
/// let sum = scheduler
///     .execute(0..10_000u64, |x| Ok(2 * x), 0, |v, acc| Ok(v + acc))
///     .unwrap();
/// assert_eq!(sum, 99_990_000);
/// scheduler.shutdown();
/// ```
pub struct Scheduler {
    buffer_size: usize,
    thread_count: usize,
    pool: WorkerPool,
    shutdown: bool,
    debug: bool,
    monitor: Option<Box<dyn ProgressMonitor + Send>>,
    times: Arc<StageTimes>,
}
impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("buffer_size", &self.buffer_size)
            .field("thread_count", &self.thread_count)
            .field("shutdown", &self.shutdown)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}
impl Scheduler {
    /// Creates a scheduler and starts its worker threads.
    ///
    /// # Arguments
    ///
    /// * `buffer_size` - Maximum number of elements in flight, and capacity of the input queue (at least 1)
    /// * `thread_count` - Number of worker threads applying the transform (at least 1)
    pub fn new(buffer_size: usize, thread_count: usize) -> Result<Self> {
        if buffer_size < 1 {
            return Err(ConfigError::InvalidBufferSize(buffer_size).into());
        }
        if thread_count < 1 {
            return Err(ConfigError::InvalidThreadCount(thread_count).into());
        }
        let pool = WorkerPool::new(thread_count)?;
        log::debug!("Started scheduler with {thread_count} workers and a buffer of {buffer_size}");
        Ok(Self {
            buffer_size,
            thread_count,
            pool,
            shutdown: false,
            debug: false,
            monitor: None,
            times: Arc::new(StageTimes::new()),
        })
    }

    /// Creates a scheduler buffering [`DEFAULT_BUFFER_PER_THREAD`] elements per thread
    pub fn with_threads(thread_count: usize) -> Result<Self> {
        Self::new(
            thread_count.max(1).saturating_mul(DEFAULT_BUFFER_PER_THREAD),
            thread_count,
        )
    }

    #[must_use]
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::default()
    }

    /// Capacity of the bounded input queue
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of worker threads
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Whether [`Scheduler::shutdown`] has been called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    #[must_use]
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Turns verbose scheduling messages on or off
    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    /// Sets the monitor told about the progress of every following run
    pub fn set_progress_monitor<P>(&mut self, monitor: P)
    where
        P: ProgressMonitor + Send + 'static,
    {
        self.monitor = Some(Box::new(monitor));
    }

    pub fn clear_progress_monitor(&mut self) {
        self.monitor = None;
    }

    /// Time accumulated per stage over every run so far
    #[must_use]
    pub fn timing(&self) -> TimingReport {
        self.times.report()
    }

    /// Runs an ordered map/reduce over an infallible source.
    ///
    /// See [`Scheduler::try_execute`] for the fallible version.
    pub fn execute<S, T, M, R, F, C>(
        &mut self,
        source: S,
        transform: F,
        initial: R,
        combine: C,
    ) -> Result<R>
    where
        S: IntoIterator<Item = T>,
        S::IntoIter: Send + 'static,
        T: Send + 'static,
        M: Send + 'static,
        F: Fn(T) -> anyhow::Result<M> + Send + Sync + 'static,
        C: FnMut(M, R) -> anyhow::Result<R>,
    {
        self.try_execute(
            source.into_iter().map(Ok::<T, Infallible>),
            transform,
            initial,
            combine,
        )
    }

    /// Runs an ordered map/reduce over a source that can fail.
    ///
    /// The source is drained on a dedicated thread; `transform` is applied on
    /// the worker pool; `combine` folds the results on the calling thread in
    /// source order. The first failure of any of the three aborts the run and
    /// is returned as a [`crate::RunError`]; the other threads of the run stop
    /// at their next queue operation.
    ///
    /// Fails immediately with [`StateError::Shutdown`] after
    /// [`Scheduler::shutdown`], without starting any thread.
    pub fn try_execute<S, T, E, M, R, F, C>(
        &mut self,
        source: S,
        transform: F,
        initial: R,
        combine: C,
    ) -> Result<R>
    where
        S: IntoIterator<Item = std::result::Result<T, E>>,
        S::IntoIter: Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        M: Send + 'static,
        F: Fn(T) -> anyhow::Result<M> + Send + Sync + 'static,
        C: FnMut(M, R) -> anyhow::Result<R>,
    {
        if self.shutdown {
            return Err(StateError::Shutdown.into());
        }
        self.times.stop_outside();
        let result = self.run(source.into_iter(), transform, initial, combine);
        self.times.restart_outside();
        result
    }

    fn run<I, T, E, M, R, F, C>(&mut self, source: I, transform: F, initial: R, combine: C) -> Result<R>
    where
        I: Iterator<Item = std::result::Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + 'static,
        M: Send + 'static,
        F: Fn(T) -> anyhow::Result<M> + Send + Sync + 'static,
        C: FnMut(M, R) -> anyhow::Result<R>,
    {
        self.debug_print(format_args!("Executing run"));

        let tracker = Arc::new(ErrorTracker::new());
        let _cancel_on_exit = CancelOnDrop(&tracker);

        let (input_tx, input_rx) = bounded(self.buffer_size);
        // caps elements pulled but not yet folded, wherever they are in the run
        let (permits_tx, permits_rx) = bounded(self.buffer_size);
        let (result_tx, result_rx) = unbounded();
        let transform = Arc::new(transform);
        let running = WaitGroup::new();

        for _ in 0..self.thread_count {
            let job = MapJob::new(
                input_rx.clone(),
                result_tx.clone(),
                Arc::clone(&transform),
                Arc::clone(&tracker),
                Arc::clone(&self.times),
                running.clone(),
            );
            self.pool.submit(move || {
                job.run();
            })?;
        }
        drop(input_rx);

        let producer = Producer::new(
            source,
            input_tx,
            result_tx,
            permits_tx,
            Arc::clone(&tracker),
            Arc::clone(&self.times),
        )
        .spawn()?;

        let reducer = Reducer::new(initial, combine)
            .with_timer(Arc::clone(&self.times))
            .with_permits(permits_rx);
        let outcome = reducer.wait_for_final_reduce(&result_rx, &tracker, self.monitor.as_deref_mut());
        drop(result_rx);

        // every other thread of the run is done or stops at its next queue operation
        match producer.join() {
            Ok(Some(total)) => self.debug_print(format_args!("Input produced {total} elements")),
            Ok(None) => self.debug_print(format_args!("Input stopped early")),
            Err(_) => log::error!("Input thread panicked outside of the source"),
        }
        running.wait();

        match outcome {
            Ok(accumulator) => {
                self.debug_print(format_args!("Run complete"));
                Ok(accumulator)
            }
            Err(err) => {
                self.debug_print(format_args!("Run failed: {err}"));
                Err(err.into())
            }
        }
    }

    /// Stops the worker pool and releases its threads.
    ///
    /// Idempotent, and safe to call on a scheduler that never executed
    /// anything. Every later `execute` fails with [`StateError::Shutdown`].
    pub fn shutdown(&mut self) {
        if self.shutdown {
            return;
        }
        self.pool.shutdown();
        self.shutdown = true;

        self.times.stop_outside();
        for line in self.times.report().to_string().lines() {
            log::info!("{line}");
        }
    }

    fn debug_print(&self, args: fmt::Arguments<'_>) {
        let current = thread::current();
        let name = current.name().unwrap_or("<unnamed>");
        if self.debug {
            log::info!("Thread {name}: {args}");
        } else {
            log::debug!("Thread {name}: {args}");
        }
    }
}
impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cancels the run when dropped, so an unwinding caller releases the run's threads
struct CancelOnDrop<'a>(&'a ErrorTracker);
impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Builder for a [`Scheduler`]
///
/// Unset values fall back to one worker per CPU and
/// [`DEFAULT_BUFFER_PER_THREAD`] buffered elements per worker.
#[derive(Debug, Clone, Default)]
pub struct SchedulerBuilder {
    /// Optional number of worker threads
    threads: Option<usize>,
    /// Optional capacity of the input queue
    buffer_size: Option<usize>,
    /// Optional verbose scheduling messages
    debug: Option<bool>,
}
impl SchedulerBuilder {
    /// Sets the number of worker threads
    ///
    /// # Examples
    ///
    /// ```rust
    /// use nanosched::SchedulerBuilder;
    ///
    /// let scheduler = SchedulerBuilder::default().threads(2).build().unwrap();
    /// assert_eq!(scheduler.thread_count(), 2);
    /// assert_eq!(scheduler.buffer_size(), 200);
    /// ```
    #[must_use]
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    /// Sets the capacity of the bounded input queue
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size);
        self
    }

    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = Some(debug);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        let threads = self.threads.unwrap_or_else(num_cpus::get);
        let buffer_size = self
            .buffer_size
            .unwrap_or_else(|| threads.max(1).saturating_mul(DEFAULT_BUFFER_PER_THREAD));
        let mut scheduler = Scheduler::new(buffer_size, threads)?;
        scheduler.set_debug(self.debug.unwrap_or(false));
        Ok(scheduler)
    }
}
