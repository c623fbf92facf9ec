//! Error types for devpool

use crate::model::DeviceIndex;
use thiserror::Error;

/// Main error type for devpool
#[derive(Error, Debug)]
pub enum DevpoolError {
    /// Every device is attached (or excluded) at the moment of the search
    #[error("No available device")]
    NoAvailableDevice,

    /// Attach targeted a device that already has an attachment
    #[error("Device {0} is busy")]
    DeviceBusy(DeviceIndex),

    /// Requested total exceeds the size of the pool
    #[error("Insufficient devices: requested {requested}, pool has {total}")]
    InsufficientDevices { requested: u32, total: u32 },

    /// Index outside the fixed device pool
    #[error("Device {0} does not exist")]
    DeviceNotFound(DeviceIndex),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Lock acquisition error
    #[error("Lock error: {0}")]
    Lock(String),

    /// Host runtime error (process or hardware queries)
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DevpoolError {
    /// Whether this error is an allocation failure reported to the user
    /// rather than an operational fault.
    pub fn is_allocation_error(&self) -> bool {
        matches!(
            self,
            DevpoolError::NoAvailableDevice
                | DevpoolError::DeviceBusy(_)
                | DevpoolError::InsufficientDevices { .. }
                | DevpoolError::DeviceNotFound(_)
        )
    }
}

/// Result type for devpool operations
pub type DevpoolResult<T> = Result<T, DevpoolError>;

impl From<serde_json::Error> for DevpoolError {
    fn from(err: serde_json::Error) -> Self {
        DevpoolError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DevpoolError {
    fn from(err: toml::de::Error) -> Self {
        DevpoolError::Config(err.to_string())
    }
}
