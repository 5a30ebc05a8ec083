//! Cross-thread failure capture for a single run
//!
//! The tracker keeps the first [`RunError`] reported by any thread of a run and
//! drops every later one. Recording an error also closes the tracker's
//! cancellation channel, which every blocking point of the run selects on, so
//! a failure in one thread wakes the others immediately.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::error::RunError;

/// First-error-wins cell with a broadcast cancellation signal
#[derive(Debug)]
pub struct ErrorTracker {
    /// Set once an error has been captured
    failed: AtomicBool,
    /// Set once the run has been cancelled (always set when `failed` is)
    cancelled: AtomicBool,
    /// The captured error, until it is taken by the caller
    error: Mutex<Option<RunError>>,
    /// Dropped to cancel; nothing is ever sent on it
    cancel_tx: Mutex<Option<Sender<()>>>,
    cancel_rx: Receiver<()>,
}
impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}
impl ErrorTracker {
    #[must_use]
    pub fn new() -> Self {
        let (cancel_tx, cancel_rx) = bounded(0);
        Self {
            failed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            cancel_tx: Mutex::new(Some(cancel_tx)),
            cancel_rx,
        }
    }

    /// Records an error if none has been recorded yet and cancels the run.
    ///
    /// Returns `true` if this error was the one kept.
    pub fn notify(&self, err: RunError) -> bool {
        {
            let mut slot = self.error.lock();
            if slot.is_some() || self.failed.load(Ordering::Acquire) {
                log::trace!("Dropping error raised after the first failure: {err}");
                return false;
            }
            log::warn!("Captured error, cancelling run: {err}");
            *slot = Some(err);
            self.failed.store(true, Ordering::Release);
        }
        self.cancel();
        true
    }

    /// Cancels the run without recording an error.
    ///
    /// Idempotent. Every thread blocked in a `select` on [`Self::cancellation`]
    /// is woken.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.cancel_tx.lock().take();
    }

    /// Whether an error has been captured
    #[must_use]
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Whether the run has been cancelled, by an error or explicitly
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A receiver that becomes ready (disconnected) once the run is cancelled
    #[must_use]
    pub fn cancellation(&self) -> &Receiver<()> {
        &self.cancel_rx
    }

    /// Removes the captured error, leaving the tracker failed
    pub fn take_error(&self) -> Option<RunError> {
        self.error.lock().take()
    }
}
