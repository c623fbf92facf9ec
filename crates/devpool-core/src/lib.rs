//! devpool-core: Core types for the devpool allocator
//!
//! This crate provides the fundamental types used throughout devpool:
//! - Environment and device records as persisted in the registry documents
//! - Configuration types
//! - Error handling

pub mod config;
pub mod error;
pub mod model;

pub use config::*;
pub use error::*;
pub use model::*;
