use std::any::Any;

use auto_impl::auto_impl;

/// Number of folds between two progress callbacks
pub const PROGRESS_INTERVAL: u64 = 100;

/// Trait for types that observe the progress of a run.
///
/// The monitor is called on the thread that invoked `execute`, every
/// [`PROGRESS_INTERVAL`] folds, with the number of elements reduced so far in
/// the current run and the transformed value of the element reaching that
/// count, just before it is folded. Since reduction is strictly ordered,
/// `n_reduced` is also the position in the source up to which the traversal
/// is complete.
///
/// The value is type-erased so one monitor can serve runs of different result
/// types; downcast it to the run's result type to read e.g. a locus.
///
/// ```rust
/// use std::any::Any;
/// use nanosched::ProgressMonitor;
///
/// struct LastLocus(Option<(String, u64)>);
/// impl ProgressMonitor for LastLocus {
///     fn progress(&mut self, _n_reduced: u64, last: &dyn Any) {
///         if let Some(locus) = last.downcast_ref::<(String, u64)>() {
///             self.0 = Some(locus.clone());
///         }
///     }
/// }
/// ```
#[auto_impl(&mut, Box)]
pub trait ProgressMonitor {
    /// Called with the number of elements reduced so far and the result being folded
    fn progress(&mut self, n_reduced: u64, last: &dyn Any);

    /// Called once a run has folded every element
    /// Default implementation does nothing
    #[allow(unused_variables)]
    fn on_complete(&mut self, n_reduced: u64) {}
}

/// A [`ProgressMonitor`] that reports through the `log` facade
#[derive(Debug, Clone)]
pub struct LogProgress {
    label: String,
}
impl LogProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}
impl Default for LogProgress {
    fn default() -> Self {
        Self::new("nanosched")
    }
}
impl ProgressMonitor for LogProgress {
    fn progress(&mut self, n_reduced: u64, _last: &dyn Any) {
        log::info!("[{}] reduced {} elements", self.label, n_reduced);
    }

    fn on_complete(&mut self, n_reduced: u64) {
        log::info!("[{}] finished after {} elements", self.label, n_reduced);
    }
}
