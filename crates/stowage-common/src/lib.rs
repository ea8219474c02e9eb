//! # stowage-common
//!
//! Shared utilities and types for the stowage volume daemon:
//! - The common error type crossing every crate boundary
//! - Validated container ids for ASEC images
//! - The daemon's filesystem path table
//!
//! The control-surface response codes live in the core crate next to the
//! broadcaster; only the pieces needed by every crate are here.

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{StowageError, StowageResult};
pub use id::ContainerId;
pub use paths::StowagePaths;
