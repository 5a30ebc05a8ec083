//! Persistent worker threads and the per-run map job
//!
//! The [`WorkerPool`] owns `thread_count` named threads that live until the
//! scheduler is shut down. Each run submits one [`MapJob`] per thread; a map
//! job drains the run's bounded input queue, applies the transform and
//! publishes every result, still tagged with its sequence id, to the run's
//! result stream. Workers finish in any order; restoring the order is the
//! reducer's job.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{select, unbounded, Receiver, Sender};
use crossbeam::sync::WaitGroup;

use crate::error::{panic_to_error, Result, RunError, StateError};
use crate::tagged::Tagged;
use crate::timer::{Stage, StageTimes};
use crate::tracker::ErrorTracker;

/// Prefix of the worker thread names, followed by the worker index
pub const WORKER_THREAD_PREFIX: &str = "nanosched-map";

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of threads executing submitted jobs
pub struct WorkerPool {
    /// `None` once the pool has been shut down
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
    num_threads: usize,
}
impl WorkerPool {
    /// Spawns `num_threads` idle worker threads
    pub fn new(num_threads: usize) -> Result<Self> {
        let (job_tx, job_rx) = unbounded::<Job>();
        let mut handles = Vec::with_capacity(num_threads);
        for tid in 0..num_threads {
            let job_rx = job_rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{WORKER_THREAD_PREFIX}-{tid}"))
                .spawn(move || worker_loop(tid, &job_rx))?;
            handles.push(handle);
        }
        Ok(Self {
            job_tx: Some(job_tx),
            handles,
            num_threads,
        })
    }

    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.job_tx.is_none()
    }

    /// Queues a job for the next idle worker
    pub fn submit<J>(&self, job: J) -> Result<()>
    where
        J: FnOnce() + Send + 'static,
    {
        let Some(job_tx) = &self.job_tx else {
            return Err(StateError::Shutdown.into());
        };
        job_tx
            .send(Box::new(job))
            .map_err(|_| StateError::Shutdown.into())
    }

    /// Stops accepting jobs and joins every worker once its queue is drained.
    ///
    /// Idempotent.
    pub fn shutdown(&mut self) {
        if self.job_tx.take().is_none() {
            return;
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                log::error!("Worker thread panicked outside of a job");
            }
        }
        log::debug!("Worker pool of {} threads shut down", self.num_threads);
    }
}
impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(tid: usize, job_rx: &Receiver<Job>) {
    log::trace!("Worker {tid} started");
    // exits once the pool drops its sender
    for job in job_rx {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("Job panicked on worker {tid}");
        }
    }
    log::trace!("Worker {tid} exiting");
}

/// One worker's share of a run: transform elements until the input closes
pub(crate) struct MapJob<T, M, F> {
    input_rx: Receiver<Tagged<T>>,
    result_tx: Sender<Tagged<M>>,
    transform: Arc<F>,
    tracker: Arc<ErrorTracker>,
    times: Arc<StageTimes>,
    /// Released when the job is dropped
    _running: WaitGroup,
}
impl<T, M, F> MapJob<T, M, F>
where
    T: Send + 'static,
    M: Send + 'static,
    F: Fn(T) -> anyhow::Result<M> + Send + Sync + 'static,
{
    pub fn new(
        input_rx: Receiver<Tagged<T>>,
        result_tx: Sender<Tagged<M>>,
        transform: Arc<F>,
        tracker: Arc<ErrorTracker>,
        times: Arc<StageTimes>,
        running: WaitGroup,
    ) -> Self {
        Self {
            input_rx,
            result_tx,
            transform,
            tracker,
            times,
            _running: running,
        }
    }

    /// Transforms elements until the input queue is closed and empty, the run
    /// is cancelled, or the transform fails. Returns the number of elements
    /// this job transformed.
    pub fn run(self) -> usize {
        let cancel = self.tracker.cancellation();
        let mut n_mapped = 0;
        loop {
            let tagged = select! {
                recv(self.input_rx) -> msg => match msg {
                    Ok(tagged) => tagged,
                    // closed: the producer is done
                    Err(_) => break,
                },
                recv(cancel) -> _ => break,
            };
            if self.tracker.is_cancelled() {
                break;
            }
            let (seq, Some(element)) = tagged.into_parts() else {
                break;
            };

            let transform = &*self.transform;
            let mapped = self.times.time(Stage::Map, || {
                catch_unwind(AssertUnwindSafe(|| transform(element)))
            });
            match mapped {
                Ok(Ok(value)) => {
                    if self.result_tx.send(Tagged::new(value, seq)).is_err() {
                        break;
                    }
                    n_mapped += 1;
                }
                Ok(Err(source)) => {
                    self.tracker.notify(RunError::Transform { seq, source });
                    break;
                }
                Err(payload) => {
                    self.tracker.notify(RunError::Transform {
                        seq,
                        source: panic_to_error(&*payload, "transform"),
                    });
                    break;
                }
            }
        }
        log::trace!("Map job finished after {n_mapped} elements");
        n_mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_on_named_workers() -> anyhow::Result<()> {
        let pool = WorkerPool::new(2)?;
        assert_eq!(pool.num_threads(), 2);

        let (tx, rx) = unbounded();
        for _ in 0..4 {
            let tx = tx.clone();
            pool.submit(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
            })?;
        }
        drop(tx);

        let names = rx.iter().collect::<Vec<_>>();
        assert_eq!(names.len(), 4);
        for name in names {
            assert!(name.unwrap().starts_with(WORKER_THREAD_PREFIX));
        }
        Ok(())
    }

    #[test]
    fn test_shutdown_is_idempotent() -> anyhow::Result<()> {
        let mut pool = WorkerPool::new(3)?;
        assert!(!pool.is_shutdown());
        pool.shutdown();
        pool.shutdown();
        assert!(pool.is_shutdown());

        let err = pool.submit(|| {}).unwrap_err();
        assert!(err.is_shutdown());
        Ok(())
    }

    #[test]
    fn test_panicking_job_keeps_worker_alive() -> anyhow::Result<()> {
        let pool = WorkerPool::new(1)?;
        pool.submit(|| panic!("job failure"))?;

        let (tx, rx) = bounded(1);
        pool.submit(move || tx.send(42).unwrap())?;
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, 42);
        Ok(())
    }

    fn map_job<F>(
        transform: F,
    ) -> (
        MapJob<u64, u64, F>,
        Sender<Tagged<u64>>,
        Receiver<Tagged<u64>>,
        Arc<ErrorTracker>,
    )
    where
        F: Fn(u64) -> anyhow::Result<u64> + Send + Sync + 'static,
    {
        let (input_tx, input_rx) = bounded(16);
        let (result_tx, result_rx) = unbounded();
        let tracker = Arc::new(ErrorTracker::new());
        let job = MapJob::new(
            input_rx,
            result_tx,
            Arc::new(transform),
            Arc::clone(&tracker),
            Arc::new(StageTimes::new()),
            WaitGroup::new(),
        );
        (job, input_tx, result_rx, tracker)
    }

    #[test]
    fn test_map_job_keeps_sequence_ids() {
        let (job, input_tx, result_rx, tracker) = map_job(|x| Ok(x * 10));
        for seq in 0..5 {
            input_tx.send(Tagged::new(seq + 1, seq)).unwrap();
        }
        drop(input_tx);

        assert_eq!(job.run(), 5);
        let results = result_rx.iter().collect::<Vec<_>>();
        assert_eq!(results.len(), 5);
        for tagged in results {
            assert_eq!(tagged.value(), Some(&((tagged.seq() + 1) * 10)));
        }
        assert!(!tracker.has_failed());
    }

    #[test]
    fn test_map_job_stops_on_transform_error() {
        let (job, input_tx, result_rx, tracker) = map_job(|x| {
            if x == 3 {
                anyhow::bail!("bad locus {x}")
            }
            Ok(x)
        });
        for seq in 0..6 {
            input_tx.send(Tagged::new(seq, seq)).unwrap();
        }
        drop(input_tx);

        assert_eq!(job.run(), 3);
        assert_eq!(result_rx.iter().count(), 3);
        let err = tracker.take_error().unwrap();
        assert!(matches!(err, RunError::Transform { seq: 3, .. }));
    }

    #[test]
    fn test_map_job_reports_panics() {
        let (job, input_tx, _result_rx, tracker) = map_job(|x| {
            assert!(x != 1, "pileup overflow");
            Ok(x)
        });
        input_tx.send(Tagged::new(0, 0)).unwrap();
        input_tx.send(Tagged::new(1, 1)).unwrap();
        drop(input_tx);

        assert_eq!(job.run(), 1);
        let err = tracker.take_error().unwrap();
        assert_eq!(err.seq(), 1);
        assert!(err.cause().to_string().contains("pileup overflow"));
    }

    #[test]
    fn test_map_job_exits_on_cancel() -> anyhow::Result<()> {
        let pool = WorkerPool::new(1)?;
        let (job, _input_tx, _result_rx, tracker) = map_job(Ok);
        let (done_tx, done_rx) = bounded(1);
        pool.submit(move || done_tx.send(job.run()).unwrap())?;

        // input is still open, so only cancellation can end the job
        std::thread::sleep(Duration::from_millis(20));
        assert!(done_rx.try_recv().is_err());
        tracker.cancel();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5))?, 0);
        Ok(())
    }
}
