//! # Genesis Common
//!
//! Shared types for the Genesis cell pipeline.
//!
//! This crate provides the foundational types used by the world and server
//! crates:
//! - Cell and block positions, section-local offset packing
//! - Namespaced identifiers and content ids
//! - Schema versions and magic bytes for persisted records
//! - Common error types
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod coords;
pub mod error;
pub mod ids;
pub mod version;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coords::*;
    pub use crate::error::*;
    pub use crate::ids::*;
    pub use crate::version::*;
}

pub use prelude::*;
