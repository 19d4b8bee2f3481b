//! Build-side half of the data pipeline: dependency tracking, the
//! import/cook queue, background saving and the build-on-demand loader
//! device.
//!
//! The cook queue pulls seed keys, asks the [`DependencyTracker`] whether
//! the cooked artifact is still valid, invokes the asset-specific cooker
//! when it is not, pushes the cooked object's references back onto the
//! queue and hands the object to the [`SaveThread`]. Everything here runs
//! on dedicated threads and talks to the async loader only through
//! thread-safe queues.

// crate-specific lint exceptions:
#![warn(missing_docs)]

use ember_data_runtime::container::ContainerError;
use thiserror::Error;

mod dependency_tracker;
pub use dependency_tracker::*;

mod save_thread;
pub use save_thread::*;

mod cook_queue;
pub use cook_queue::*;

mod build_device;
pub use build_device::*;

mod reload;
pub use reload::*;

#[cfg(test)]
mod test_cook;

/// Error type of the build pipeline.
#[derive(Error, Debug)]
pub enum Error {
    /// Underlying I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Container serialization failure.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// The run-wide failure ceiling was exceeded; the whole queue run is
    /// treated as systemically broken.
    #[error("{0} files failed cooking, something must be very wrong, stopping the run")]
    TooManyFailures(u32),

    /// The caller cancelled the run.
    #[error("cook run cancelled")]
    Cancelled,
}
