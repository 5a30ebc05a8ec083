//! Order-preserving fold of transformed results
//!
//! Results reach the reducer in whatever order the workers finish. The
//! reducer stages them in a [`ResultBuffer`] keyed by sequence id and folds
//! only the result whose id equals its cursor, so `combine` sees exactly the
//! sequence a single-threaded loop over the source would have produced. No
//! commutativity or associativity is assumed of `combine`.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam::channel::{select, Receiver};

use crate::error::RunError;
use crate::progress::{ProgressMonitor, PROGRESS_INTERVAL};
use crate::tagged::Tagged;
use crate::timer::{Stage, StageTimes};
use crate::tracker::ErrorTracker;

/// Sparse map of results that arrived ahead of the reducer's cursor
#[derive(Debug)]
pub struct ResultBuffer<M> {
    pending: HashMap<u64, M>,
}
impl<M> Default for ResultBuffer<M> {
    fn default() -> Self {
        Self::new()
    }
}
impl<M> ResultBuffer<M> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }

    /// Stages a result.
    ///
    /// # Panics
    ///
    /// Panics if a result with the same sequence id is already staged.
    pub fn insert(&mut self, seq: u64, value: M) {
        let previous = self.pending.insert(seq, value);
        assert!(
            previous.is_none(),
            "sequence id {seq} was published more than once"
        );
    }

    /// Removes the result with the given sequence id, if it has arrived
    pub fn take(&mut self, seq: u64) -> Option<M> {
        self.pending.remove(&seq)
    }

    #[must_use]
    pub fn contains(&self, seq: u64) -> bool {
        self.pending.contains_key(&seq)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Folds results strictly in sequence order
pub struct Reducer<M, R, C> {
    combine: C,
    /// Taken while `combine` runs; stays empty if it fails
    accumulator: Option<R>,
    /// Sequence id of the next result to fold
    cursor: u64,
    /// Total number of results, once the producer has seen the end of the source
    total: Option<u64>,
    times: Option<Arc<StageTimes>>,
    /// In-flight permits of the producer; one is handed back per fold
    permits: Option<Receiver<()>>,
    _result: std::marker::PhantomData<fn(M)>,
}
impl<M, R, C> Reducer<M, R, C>
where
    M: 'static,
    C: FnMut(M, R) -> anyhow::Result<R>,
{
    pub fn new(initial: R, combine: C) -> Self {
        Self {
            combine,
            accumulator: Some(initial),
            cursor: 0,
            total: None,
            times: None,
            permits: None,
            _result: std::marker::PhantomData,
        }
    }

    /// Charges time spent in `combine` to the reduce stage of `times`
    #[must_use]
    pub fn with_timer(mut self, times: Arc<StageTimes>) -> Self {
        self.times = Some(times);
        self
    }

    /// Releases one of the producer's in-flight permits after every fold
    #[must_use]
    pub fn with_permits(mut self, permits: Receiver<()>) -> Self {
        self.permits = Some(permits);
        self
    }

    /// Sequence id of the next result to fold, which is also the number of
    /// results folded so far
    #[must_use]
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    #[must_use]
    pub fn total_job_count(&self) -> Option<u64> {
        self.total
    }

    /// Whether every result has been folded.
    ///
    /// Only true once the total is known, however far the cursor has advanced.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total == Some(self.cursor)
    }

    /// The current accumulator (`None` after a failed combine)
    #[must_use]
    pub fn accumulator(&self) -> Option<&R> {
        self.accumulator.as_ref()
    }

    /// Records the total number of results of the run.
    ///
    /// # Panics
    ///
    /// Panics if the total was already set or is behind the cursor.
    pub fn set_total_job_count(&mut self, total: u64) {
        assert!(
            self.total.is_none(),
            "total job count set twice ({:?} then {total})",
            self.total
        );
        assert!(
            total >= self.cursor,
            "total job count {total} is behind the {} results already reduced",
            self.cursor
        );
        self.total = Some(total);
    }

    /// Folds staged results for as long as the next expected one is present.
    ///
    /// Never blocks. Returns the number of results folded by this call.
    pub fn reduce_as_much_as_possible(
        &mut self,
        buffer: &mut ResultBuffer<M>,
    ) -> Result<usize, RunError> {
        self.drain(buffer, None)
    }

    fn drain(
        &mut self,
        buffer: &mut ResultBuffer<M>,
        mut monitor: Option<&mut (dyn ProgressMonitor + Send + 'static)>,
    ) -> Result<usize, RunError> {
        let mut n_reduced = 0;
        while let Some(value) = buffer.take(self.cursor) {
            let count = self.cursor + 1;
            if count % PROGRESS_INTERVAL == 0 {
                if let Some(monitor) = monitor.as_deref_mut() {
                    monitor.progress(count, &value);
                }
            }
            self.fold(value)?;
            n_reduced += 1;
        }
        Ok(n_reduced)
    }

    /// Accepts one message from the result stream.
    ///
    /// A terminal marker sets the total job count; a result is staged and
    /// everything that became foldable is folded. Returns the number of
    /// results folded.
    ///
    /// # Panics
    ///
    /// Panics if the result was already folded or lies beyond the known total.
    pub fn offer(
        &mut self,
        buffer: &mut ResultBuffer<M>,
        tagged: Tagged<M>,
    ) -> Result<usize, RunError> {
        self.offer_reporting(buffer, tagged, None)
    }

    fn offer_reporting(
        &mut self,
        buffer: &mut ResultBuffer<M>,
        tagged: Tagged<M>,
        monitor: Option<&mut (dyn ProgressMonitor + Send + 'static)>,
    ) -> Result<usize, RunError> {
        let (seq, value) = tagged.into_parts();
        let Some(value) = value else {
            self.set_total_job_count(seq);
            return Ok(0);
        };
        assert!(
            seq >= self.cursor,
            "sequence id {seq} arrived after it was already reduced"
        );
        if let Some(total) = self.total {
            assert!(seq < total, "sequence id {seq} is beyond the total of {total}");
        }
        buffer.insert(seq, value);
        self.drain(buffer, monitor)
    }

    fn fold(&mut self, value: M) -> Result<(), RunError> {
        let Some(accumulator) = self.accumulator.take() else {
            panic!("reduce called after combine failed at element {}", self.cursor);
        };
        let combine = &mut self.combine;
        let folded = match &self.times {
            Some(times) => times.time(Stage::Reduce, || combine(value, accumulator)),
            None => combine(value, accumulator),
        };
        match folded {
            Ok(accumulator) => {
                self.accumulator = Some(accumulator);
                self.cursor += 1;
                if let Some(permits) = &self.permits {
                    // every folded element was pulled under a permit
                    let _ = permits.try_recv();
                }
                Ok(())
            }
            Err(source) => Err(RunError::Combine {
                seq: self.cursor,
                source,
            }),
        }
    }

    /// Drives the run from the calling thread until every result is folded.
    ///
    /// Blocks on the result stream and the tracker's cancellation signal.
    /// Returns the final accumulator, or the first error captured by any
    /// thread of the run. The monitor, if any, is told about every multiple of
    /// [`PROGRESS_INTERVAL`] folds, with the result being folded at that
    /// point, and about completion.
    ///
    /// # Panics
    ///
    /// Panics if the result stream closes before completion without any error
    /// having been captured.
    pub fn wait_for_final_reduce(
        mut self,
        results: &Receiver<Tagged<M>>,
        tracker: &ErrorTracker,
        mut monitor: Option<&mut (dyn ProgressMonitor + Send + 'static)>,
    ) -> Result<R, RunError> {
        let mut buffer = ResultBuffer::new();
        let cancel = tracker.cancellation();
        while !self.is_complete() {
            if tracker.is_cancelled() {
                return Err(captured(tracker));
            }
            let msg = select! {
                recv(results) -> msg => msg,
                recv(cancel) -> _ => return Err(captured(tracker)),
            };
            let Ok(tagged) = msg else {
                if tracker.is_cancelled() {
                    return Err(captured(tracker));
                }
                panic!(
                    "result stream closed after {} results with total {:?} and no error",
                    self.cursor, self.total
                );
            };

            if let Err(err) = self.offer_reporting(&mut buffer, tagged, monitor.as_deref_mut()) {
                tracker.notify(err);
                return Err(captured(tracker));
            }
        }

        debug_assert!(buffer.is_empty());
        if let Some(monitor) = monitor {
            monitor.on_complete(self.cursor);
        }
        let Some(accumulator) = self.accumulator else {
            panic!("run completed without an accumulator");
        };
        Ok(accumulator)
    }
}

/// The error that cancelled the run
fn captured(tracker: &ErrorTracker) -> RunError {
    match tracker.take_error() {
        Some(err) => err,
        None => panic!("run cancelled without a captured error"),
    }
}
