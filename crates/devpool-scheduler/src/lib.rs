//! devpool-scheduler: Registries and allocation for devpool
//!
//! This crate provides the state each command mutates inside a document scope:
//! - Environment registry (processes, owner, configuration)
//! - Device registry with first-available allocation
//! - Liveness reconciliation for both registries
//! - The live-environment port the device side consults

pub mod environments;
pub mod gpu_allocator;
pub mod port;
pub mod reconcile;

pub use environments::EnvironmentRegistry;
pub use gpu_allocator::{DeviceRegistry, Rebalance};
pub use port::LiveEnvironments;
pub use reconcile::{DeviceSweep, EnvironmentSweep};
