//! Input side of a run
//!
//! The producer drains the caller's source on its own thread, tags every
//! element with the next sequence id and offers it to the bounded input
//! queue. Before pulling an element it takes one of `buffer_size` in-flight
//! permits, which the reducer hands back as it folds. At most `buffer_size`
//! elements are therefore alive between the source and the accumulator
//! (queued, being transformed, or waiting to be folded), whatever the size of
//! the source or the relative speed of `transform` and `combine`.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{select, Sender};

use crate::error::{panic_to_error, Result, RunError};
use crate::tagged::Tagged;
use crate::timer::{Stage, StageTimes};
use crate::tracker::ErrorTracker;

/// Name given to the per-run input thread
pub const INPUT_THREAD_NAME: &str = "nanosched-input";

/// Tags and enqueues the elements of a fallible source
pub(crate) struct Producer<I, T, M> {
    source: I,
    /// Bounded queue feeding the workers; dropping it closes the queue
    input_tx: Sender<Tagged<T>>,
    /// Result stream of the run, used once for the terminal marker
    result_tx: Sender<Tagged<M>>,
    /// One slot per element pulled but not yet folded
    permits: Sender<()>,
    tracker: Arc<ErrorTracker>,
    times: Arc<StageTimes>,
}
impl<I, T, E, M> Producer<I, T, M>
where
    I: Iterator<Item = std::result::Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<anyhow::Error> + 'static,
    M: Send + 'static,
{
    pub fn new(
        source: I,
        input_tx: Sender<Tagged<T>>,
        result_tx: Sender<Tagged<M>>,
        permits: Sender<()>,
        tracker: Arc<ErrorTracker>,
        times: Arc<StageTimes>,
    ) -> Self {
        Self {
            source,
            input_tx,
            result_tx,
            permits,
            tracker,
            times,
        }
    }

    /// Runs the producer on a dedicated, named thread
    pub fn spawn(self) -> Result<JoinHandle<Option<u64>>> {
        let handle = thread::Builder::new()
            .name(INPUT_THREAD_NAME.to_string())
            .spawn(move || self.run())?;
        Ok(handle)
    }

    /// Drains the source until it is exhausted, fails, or the run is cancelled.
    ///
    /// Each element is pulled only once an in-flight permit is available.
    ///
    /// On exhaustion the terminal marker carrying the total element count is
    /// published to the result stream and the count is returned. In every case
    /// the input queue is closed when the producer is dropped, which is what
    /// tells the workers that no more input will arrive.
    pub fn run(mut self) -> Option<u64> {
        let mut seq = 0u64;
        loop {
            if self.tracker.is_cancelled() {
                log::trace!("Producer stopping at element {seq}: run cancelled");
                return None;
            }
            if !self.acquire_permit() {
                log::trace!("Producer stopping at element {seq}: no permit");
                return None;
            }

            let source = &mut self.source;
            let next = self.times.time(Stage::Input, || {
                catch_unwind(AssertUnwindSafe(|| source.next()))
            });
            let element = match next {
                Ok(Some(Ok(element))) => element,
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    self.tracker.notify(RunError::Source {
                        seq,
                        source: err.into(),
                    });
                    return None;
                }
                Err(payload) => {
                    self.tracker.notify(RunError::Source {
                        seq,
                        source: panic_to_error(&*payload, "source"),
                    });
                    return None;
                }
            };

            if !self.offer(Tagged::new(element, seq)) {
                return None;
            }
            seq += 1;
        }

        log::debug!("Source exhausted after {seq} elements");
        if self.result_tx.send(Tagged::terminal(seq)).is_err() {
            log::trace!("Reducer left before the terminal marker was published");
        }
        Some(seq)
    }

    /// Blocks until fewer than `buffer_size` elements are in flight or the run
    /// is cancelled
    fn acquire_permit(&self) -> bool {
        let cancel = self.tracker.cancellation();
        select! {
            send(self.permits, ()) -> res => res.is_ok(),
            recv(cancel) -> _ => false,
        }
    }

    /// Blocks until the element is queued or the run is cancelled
    fn offer(&self, tagged: Tagged<T>) -> bool {
        let cancel = self.tracker.cancellation();
        select! {
            send(self.input_tx, tagged) -> res => res.is_ok(),
            recv(cancel) -> _ => false,
        }
    }
}
