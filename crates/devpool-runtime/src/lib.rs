//! devpool-runtime: Host collaborators
//!
//! This crate answers the questions devpool asks of the operating system:
//! - Whether a process is still running
//! - Who is invoking the command
//! - How many devices the host has

pub mod hardware;
pub mod process;
pub mod traits;

pub use hardware::detect_device_count;
pub use process::{current_owner, default_environment_id, default_process_id, HostProcesses, Owner};
pub use traits::ProcessLiveness;
