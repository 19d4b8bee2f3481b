//! Cooker invocation contract of the data pipeline.
//!
//! A *cooker* transforms one source asset into a loadable, typed resource
//! object. This crate defines the generic invocation surface the cook
//! queue and the build-on-demand device drive; the cooking logic for any
//! particular asset type lives with that asset type, behind the
//! [`Cooker`] trait.

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod compiler_api;
pub use compiler_api::*;

mod compiler_registry;
pub use compiler_registry::*;
