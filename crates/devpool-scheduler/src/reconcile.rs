//! Liveness reconciliation
//!
//! Both sweeps remove entries whose backing liveness condition no longer
//! holds: processes that are not alive, environments without processes, and
//! attachments whose environment is gone.

use devpool_core::{DeviceIndex, EnvId, Pid};
use devpool_runtime::ProcessLiveness;
use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::environments::EnvironmentRegistry;
use crate::gpu_allocator::DeviceRegistry;

/// Result of an environment sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentSweep {
    /// Processes dropped from their environment
    pub removed_pids: Vec<Pid>,
    /// Environments removed because no process remained
    pub removed_envs: Vec<EnvId>,
}

impl EnvironmentSweep {
    pub fn is_empty(&self) -> bool {
        self.removed_pids.is_empty() && self.removed_envs.is_empty()
    }
}

/// Result of a device sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSweep {
    /// Every attachment removed, as `(device, environment)`
    pub detached: Vec<(DeviceIndex, EnvId)>,
    /// Devices left without attachments by this sweep, in sweep order
    pub freed: Vec<DeviceIndex>,
}

/// Filter every environment's processes through `liveness` and remove the
/// environments left empty
pub fn sweep_environments<L>(registry: &mut EnvironmentRegistry, liveness: &L) -> EnvironmentSweep
where
    L: ProcessLiveness + ?Sized,
{
    let mut sweep = EnvironmentSweep::default();
    let envs = registry.entries_mut();

    for env in envs.values_mut() {
        env.process_ids.retain(|pid| {
            let alive = liveness.is_alive(*pid);
            if !alive {
                sweep.removed_pids.push(*pid);
            }
            alive
        });
    }

    envs.retain(|env_id, env| {
        let keep = !env.process_ids.is_empty();
        if !keep {
            sweep.removed_envs.push(*env_id);
        }
        keep
    });

    if sweep.is_empty() {
        debug!("Environment sweep removed nothing");
    } else {
        info!(
            pids = ?sweep.removed_pids,
            envs = ?sweep.removed_envs,
            "Environment sweep"
        );
    }
    sweep
}

/// Detach every environment `should_remove` selects, visiting devices from
/// the highest index down.
///
/// With a `budget`, the sweep stops once that many devices have been left
/// without attachments by it.
pub fn sweep_devices<P>(
    registry: &mut DeviceRegistry,
    should_remove: P,
    budget: Option<usize>,
) -> DeviceSweep
where
    P: Fn(EnvId) -> bool,
{
    let mut sweep = DeviceSweep::default();

    for (index, device) in registry.devices_mut().iter_mut().rev() {
        if budget.is_some_and(|budget| sweep.freed.len() >= budget) {
            break;
        }

        let doomed: Vec<EnvId> = device
            .attachments
            .keys()
            .copied()
            .filter(|env_id| should_remove(*env_id))
            .collect();
        if doomed.is_empty() {
            continue;
        }

        for env_id in doomed {
            device.attachments.remove(&env_id);
            sweep.detached.push((*index, env_id));
        }
        if device.is_free() {
            sweep.freed.push(*index);
        }
    }

    if !sweep.detached.is_empty() {
        info!(detached = ?sweep.detached, freed = ?sweep.freed, "Device sweep");
    }
    sweep
}

/// Detach environments missing from `live`
pub fn sweep_dead_attachments(
    registry: &mut DeviceRegistry,
    live: &BTreeSet<EnvId>,
) -> DeviceSweep {
    debug!(live = ?live, "Sweeping attachments of dead environments");
    sweep_devices(registry, |env_id| !live.contains(&env_id), None)
}

/// Detach one environment regardless of liveness, highest indices first
pub fn release_environment(
    registry: &mut DeviceRegistry,
    env_id: EnvId,
    budget: Option<usize>,
) -> DeviceSweep {
    sweep_devices(registry, |candidate| candidate == env_id, budget)
}
