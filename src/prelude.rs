//! Commonly used types for building ordered map/reduce traversals
//!
//! ```rust
//! use nanosched::prelude::*;
//! ```

pub use crate::{
    Error, LogProgress, ProgressMonitor, Result, RunError, Scheduler, SchedulerBuilder,
};
