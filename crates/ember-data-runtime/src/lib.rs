//! Runtime resource management for the data pipeline.
//!
//! This crate owns the three runtime-facing pieces of the pipeline:
//!
//! * the resource identity model ([`ResourcePath`], [`ResourceType`],
//!   [`ResourceKey`]) and the type reflection service ([`TypeRegistry`]),
//! * the binary container format and its chunked batch loader
//!   ([`container`]),
//! * the [`AssetRegistry`] which services `load` requests, deduplicates
//!   concurrent loads and drives reload notifications.
//!
//! ## Container file format
//! ```markdown
//! |--------------- header ---------------|
//! | magic, version, flags                |
//! | headers_end, objects_end             |
//! | chunk directory (offset, count) x 7  |
//! |------------- chunk tables -----------|
//! | strings | names | types | properties |
//! | paths | imports | exports            |
//! |------------ object payloads ---------|
//! | export #0 bytes (document root)      |
//! | export #1 bytes                      |
//! | ...                                  |
//! ```
//!
//! Exports are deserialized in table order. Parent references always point
//! to an earlier export, so the object tree can be rebuilt in a single
//! forward pass. When the `protected layout` flag is set every payload
//! carries its own CRC32 which is verified before deserialization.

// crate-specific lint exceptions:
#![warn(missing_docs)]

mod resource;
pub use resource::*;

mod reflection;
pub use reflection::*;

mod handle;
pub use handle::*;

pub mod container;
pub mod vfs;

mod registry;
pub use registry::*;

#[cfg(test)]
mod test_container;
#[cfg(test)]
mod test_resource;
