//! devpool-store: Registry document storage
//!
//! This crate provides the open-mutate-commit scope every command runs in:
//! - Exclusive advisory lock per document
//! - Load-or-create of the JSON document
//! - Atomic save on commit, discard on drop

pub mod document;

pub use document::{DocumentGuard, DocumentStore};
