//! Device-count source
//!
//! Consulted once, when the devices document is first created.

use devpool_core::{DeviceConfig, DevpoolError, DevpoolResult};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

/// Resolve the pool size from the configured override or the hardware query
pub async fn detect_device_count(config: &DeviceConfig) -> DevpoolResult<u32> {
    if let Some(count) = config.count {
        debug!(count = count, "Using configured device count");
        return Ok(count);
    }

    let (program, args) = config
        .query_command
        .split_first()
        .ok_or_else(|| DevpoolError::Config("devices.query_command is empty".to_string()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = timeout(Duration::from_secs(config.query_timeout_secs), cmd.output())
        .await
        .map_err(|_| {
            DevpoolError::Runtime(format!(
                "Device query '{}' timed out after {}s",
                program, config.query_timeout_secs
            ))
        })?
        .map_err(|e| DevpoolError::Runtime(format!("Failed to run '{}': {}", program, e)))?;

    if !output.status.success() {
        return Err(DevpoolError::Runtime(format!(
            "Device query '{}' failed ({}): {}",
            program,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let count = count_listed_devices(&String::from_utf8_lossy(&output.stdout));
    info!(count = count, command = %program, "Detected devices");
    Ok(count)
}

/// One device per non-blank line
pub fn count_listed_devices(listing: &str) -> u32 {
    listing.lines().filter(|line| !line.trim().is_empty()).count() as u32
}
