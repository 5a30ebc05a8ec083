/// Custom Result type for scheduler operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the scheduler, encompassing all possible error cases
/// that can occur while configuring or running an ordered map/reduce.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub enum Error {
    /// A collaborator (source, transform or combine) failed during a run
    RunError(#[from] RunError),
    /// The scheduler was used in a state that does not allow the operation
    StateError(#[from] StateError),
    /// Invalid construction parameters
    ConfigError(#[from] ConfigError),
    /// Standard I/O errors from the Rust standard library (thread spawning)
    IoError(#[from] std::io::Error),
}
impl Error {
    /// Returns the run error if this error originated from a collaborator
    #[must_use]
    pub fn as_run_error(&self) -> Option<&RunError> {
        match self {
            Self::RunError(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this error was raised because the scheduler was already shut down
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::StateError(StateError::Shutdown))
    }
}

/// Errors raised by the caller-supplied functions of a single run.
///
/// Only the first failure of a run is kept; everything that races in after it is dropped.
#[derive(thiserror::Error, Debug)]
pub enum RunError {
    /// The input iterator failed (or panicked) while producing an element
    ///
    /// # Fields
    /// * `seq` - The sequence id the failed element would have received
    #[error("Source failed while producing element {seq}: {source}")]
    Source { seq: u64, source: anyhow::Error },

    /// The transform function failed (or panicked) on an element
    ///
    /// # Fields
    /// * `seq` - The sequence id of the element being transformed
    #[error("Transform failed on element {seq}: {source}")]
    Transform { seq: u64, source: anyhow::Error },

    /// The combine function failed while folding a result
    ///
    /// # Fields
    /// * `seq` - The sequence id of the result being folded
    #[error("Combine failed on element {seq}: {source}")]
    Combine { seq: u64, source: anyhow::Error },
}
impl RunError {
    /// Sequence id of the element the failure is attached to
    #[must_use]
    pub fn seq(&self) -> u64 {
        match self {
            Self::Source { seq, .. } | Self::Transform { seq, .. } | Self::Combine { seq, .. } => {
                *seq
            }
        }
    }

    /// The underlying collaborator error
    #[must_use]
    pub fn cause(&self) -> &anyhow::Error {
        match self {
            Self::Source { source, .. }
            | Self::Transform { source, .. }
            | Self::Combine { source, .. } => source,
        }
    }
}

/// Errors from using the scheduler in the wrong lifecycle state
#[derive(thiserror::Error, Debug)]
pub enum StateError {
    /// `execute` was called after `shutdown`
    #[error("Execute called on a scheduler that has already been shut down")]
    Shutdown,
}

/// Errors that can occur while configuring a scheduler
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// The bounded input queue must hold at least one element
    ///
    /// # Arguments
    /// * `usize` - The rejected buffer size
    #[error("Buffer size must be >= 1, got {0}")]
    InvalidBufferSize(usize),

    /// At least one worker thread is required
    ///
    /// # Arguments
    /// * `usize` - The rejected thread count
    #[error("Thread count must be >= 1, got {0}")]
    InvalidThreadCount(usize),
}

/// Renders a caught panic payload into an error
pub(crate) fn panic_to_error(payload: &(dyn std::any::Any + Send), context: &str) -> anyhow::Error {
    let message = if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    };
    anyhow::anyhow!("{context} panicked: {message}")
}
