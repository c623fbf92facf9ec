//! Device registry and first-available allocation
//!
//! Root of the devices document: `{ "devices": { "<index>": { "eids": { ... } } } }`.
//! A device holds at most one attachment at a time.

use devpool_core::{
    Attachment, Device, DeviceField, DeviceIndex, DevpoolError, DevpoolResult, EnvId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::reconcile;

/// Fixed-size pool of devices keyed by index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistry {
    #[serde(default)]
    devices: BTreeMap<DeviceIndex, Device>,
}

/// Devices changed by [`DeviceRegistry::ensure_count`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rebalance {
    pub attached: Vec<DeviceIndex>,
    pub detached: Vec<DeviceIndex>,
}

impl DeviceRegistry {
    /// Create a pool of `count` free devices indexed `0..count`
    pub fn with_count(count: u32) -> Self {
        info!(count = count, "Initializing device registry");
        Self {
            devices: (0..count).map(|index| (index, Device::default())).collect(),
        }
    }

    /// Get the total number of devices
    pub fn total_count(&self) -> u32 {
        self.devices.len() as u32
    }

    /// Get the number of devices without attachments
    pub fn available_count(&self) -> u32 {
        self.devices.values().filter(|d| d.is_free()).count() as u32
    }

    pub fn device(&self, index: DeviceIndex) -> Option<&Device> {
        self.devices.get(&index)
    }

    /// Devices in ascending index order
    pub fn iter(&self) -> impl Iterator<Item = (DeviceIndex, &Device)> {
        self.devices.iter().map(|(index, device)| (*index, device))
    }

    /// Indices attached to `env_id`, ascending
    pub fn resolve_attached(&self, env_id: EnvId) -> Vec<DeviceIndex> {
        self.iter()
            .filter(|(_, device)| device.is_attached_to(env_id))
            .map(|(index, _)| index)
            .collect()
    }

    /// Lowest free index not in `exclude`
    pub fn find_available(&self, exclude: &BTreeSet<DeviceIndex>) -> DevpoolResult<DeviceIndex> {
        self.iter()
            .find(|(index, device)| device.is_free() && !exclude.contains(index))
            .map(|(index, _)| index)
            .ok_or(DevpoolError::NoAvailableDevice)
    }

    /// `count` distinct free indices, ascending. Nothing is attached here.
    pub fn find_available_many(&self, count: u32) -> DevpoolResult<Vec<DeviceIndex>> {
        let mut found = BTreeSet::new();
        for _ in 0..count {
            let index = self.find_available(&found)?;
            found.insert(index);
        }
        Ok(found.into_iter().collect())
    }

    /// Attach every index in `indices` to `env_id`.
    ///
    /// The whole batch is validated before the first attachment is written, so
    /// either all devices are attached or none are. Repeated indices count once.
    pub fn attach(&mut self, env_id: EnvId, indices: &[DeviceIndex]) -> DevpoolResult<()> {
        let indices: BTreeSet<DeviceIndex> = indices.iter().copied().collect();
        for index in &indices {
            let device = self
                .devices
                .get(index)
                .ok_or(DevpoolError::DeviceNotFound(*index))?;
            if !device.is_free() {
                return Err(DevpoolError::DeviceBusy(*index));
            }
        }

        let attached_at = Timestamp::now();
        for index in &indices {
            if let Some(device) = self.devices.get_mut(index) {
                device.attachments.insert(
                    env_id,
                    Attachment {
                        env_id,
                        attached_at,
                    },
                );
            }
        }

        info!(env_id = env_id, devices = ?indices, "Attached devices");
        Ok(())
    }

    /// Detach `env_id` from one device, or from every device when `index`
    /// is `None`. Absent attachments are ignored.
    ///
    /// Returns the indices actually detached.
    pub fn detach(&mut self, env_id: EnvId, index: Option<DeviceIndex>) -> Vec<DeviceIndex> {
        let mut detached = Vec::new();
        for (candidate, device) in self.devices.iter_mut() {
            if index.is_some_and(|wanted| wanted != *candidate) {
                continue;
            }
            if device.attachments.remove(&env_id).is_some() {
                detached.push(*candidate);
            }
        }

        if detached.is_empty() {
            debug!(env_id = env_id, index = ?index, "Nothing to detach");
        } else {
            info!(env_id = env_id, devices = ?detached, "Detached devices");
        }
        detached
    }

    /// Grow or shrink the set of devices attached to `env_id` to `target`.
    ///
    /// Growth takes the lowest free indices. Shrinking releases the
    /// environment's highest indices first.
    pub fn ensure_count(&mut self, env_id: EnvId, target: u32) -> DevpoolResult<Rebalance> {
        let current = self.resolve_attached(env_id).len() as u32;

        if current < target {
            let total = self.total_count();
            if target > total {
                return Err(DevpoolError::InsufficientDevices {
                    requested: target,
                    total,
                });
            }
            let indices = self.find_available_many(target - current)?;
            self.attach(env_id, &indices)?;
            Ok(Rebalance {
                attached: indices,
                detached: Vec::new(),
            })
        } else if current > target {
            let budget = (current - target) as usize;
            let sweep = reconcile::release_environment(self, env_id, Some(budget));
            Ok(Rebalance {
                attached: Vec::new(),
                detached: sweep.freed,
            })
        } else {
            debug!(env_id = env_id, count = current, "Device count already satisfied");
            Ok(Rebalance::default())
        }
    }

    /// Project `fields` for the devices attached to `env_id`, or for every
    /// device when `env_id` is `None`
    pub fn query(&self, env_id: Option<EnvId>, fields: &[DeviceField]) -> Vec<Vec<String>> {
        self.iter()
            .filter(|(_, device)| env_id.map_or(true, |id| device.is_attached_to(id)))
            .map(|(index, device)| fields.iter().map(|f| device.field(index, f)).collect())
            .collect()
    }

    pub(crate) fn devices_mut(&mut self) -> &mut BTreeMap<DeviceIndex, Device> {
        &mut self.devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_registry_empty() {
        let registry = DeviceRegistry::default();
        assert_eq!(registry.total_count(), 0);
        assert_eq!(registry.available_count(), 0);
        assert!(matches!(
            registry.find_available(&BTreeSet::new()),
            Err(DevpoolError::NoAvailableDevice)
        ));
    }

    #[test]
    fn test_find_available_skips_attached_and_excluded() {
        let mut registry = DeviceRegistry::with_count(4);
        registry.attach(2, &[0]).unwrap();

        assert_eq!(registry.find_available(&BTreeSet::new()).unwrap(), 1);
        assert_eq!(registry.find_available(&BTreeSet::from([1, 2])).unwrap(), 3);
    }

    #[test]
    fn test_find_available_many() {
        let mut registry = DeviceRegistry::with_count(5);
        registry.attach(2, &[1]).unwrap();

        let found = registry.find_available_many(3).unwrap();
        assert_eq!(found, vec![0, 2, 3]);
        assert_eq!(registry.available_count(), 4);
    }

    #[test]
    fn test_find_available_many_exhausted() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(2, &[0]).unwrap();

        assert!(matches!(
            registry.find_available_many(3),
            Err(DevpoolError::NoAvailableDevice)
        ));
        assert_eq!(registry.available_count(), 2);
    }

    #[test]
    fn test_attach_and_resolve() {
        let mut registry = DeviceRegistry::with_count(4);
        registry.attach(7, &[3, 1]).unwrap();

        assert_eq!(registry.resolve_attached(7), vec![1, 3]);
        assert_eq!(registry.available_count(), 2);
        let attachment = &registry.device(3).unwrap().attachments[&7];
        assert_eq!(attachment.env_id, 7);
    }

    #[test]
    fn test_attach_busy_device_is_all_or_nothing() {
        let mut registry = DeviceRegistry::with_count(4);
        registry.attach(2, &[3]).unwrap();

        let result = registry.attach(9, &[1, 3]);

        assert!(matches!(result, Err(DevpoolError::DeviceBusy(3))));
        assert!(registry.device(1).unwrap().is_free());
        assert!(registry.resolve_attached(9).is_empty());
    }

    #[test]
    fn test_attach_busy_single_device() {
        let mut registry = DeviceRegistry::with_count(4);
        registry.attach(2, &[3]).unwrap();

        assert!(matches!(
            registry.attach(9, &[3]),
            Err(DevpoolError::DeviceBusy(3))
        ));
        assert!(registry.query(Some(9), &[DeviceField::Index]).is_empty());
    }

    #[test]
    fn test_attach_repeated_index() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(7, &[1, 1]).unwrap();

        assert_eq!(registry.resolve_attached(7), vec![1]);
        assert_eq!(registry.device(1).unwrap().attachments.len(), 1);
        assert_eq!(registry.available_count(), 2);
    }

    #[test]
    fn test_attach_unknown_device() {
        let mut registry = DeviceRegistry::with_count(2);
        assert!(matches!(
            registry.attach(9, &[0, 5]),
            Err(DevpoolError::DeviceNotFound(5))
        ));
        assert_eq!(registry.available_count(), 2);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(7, &[0, 2]).unwrap();
        registry.attach(8, &[1]).unwrap();

        assert_eq!(registry.detach(7, None), vec![0, 2]);
        let once = registry.clone();
        assert!(registry.detach(7, None).is_empty());

        assert_eq!(registry, once);
        assert_eq!(registry.resolve_attached(8), vec![1]);
    }

    #[test]
    fn test_detach_single_index() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(7, &[0, 2]).unwrap();

        assert_eq!(registry.detach(7, Some(2)), vec![2]);
        assert!(registry.detach(7, Some(1)).is_empty());
        assert!(registry.detach(7, Some(10)).is_empty());
        assert_eq!(registry.resolve_attached(7), vec![0]);
    }

    #[test]
    fn test_ensure_count_grow_then_shrink() {
        let mut registry = DeviceRegistry::with_count(4);

        let grown = registry.ensure_count(7, 2).unwrap();
        assert_eq!(grown.attached, vec![0, 1]);
        assert_eq!(registry.resolve_attached(7), vec![0, 1]);

        let shrunk = registry.ensure_count(7, 1).unwrap();
        assert_eq!(shrunk.detached.len(), 1);
        let remaining = registry.resolve_attached(7);
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0] == 0 || remaining[0] == 1);
    }

    #[test]
    fn test_ensure_count_shrinks_highest_first() {
        let mut registry = DeviceRegistry::with_count(4);
        registry.attach(7, &[0, 2, 3]).unwrap();

        let shrunk = registry.ensure_count(7, 1).unwrap();
        assert_eq!(shrunk.detached, vec![3, 2]);
        assert_eq!(registry.resolve_attached(7), vec![0]);
    }

    #[test]
    fn test_ensure_count_tops_up() {
        let mut registry = DeviceRegistry::with_count(4);
        registry.attach(7, &[2]).unwrap();
        registry.attach(8, &[0]).unwrap();

        let grown = registry.ensure_count(7, 3).unwrap();
        assert_eq!(grown.attached, vec![1, 3]);
        assert_eq!(registry.resolve_attached(7), vec![1, 2, 3]);

        assert_eq!(registry.ensure_count(7, 3).unwrap(), Rebalance::default());
    }

    #[test]
    fn test_ensure_count_insufficient() {
        let mut registry = DeviceRegistry::with_count(2);
        assert!(matches!(
            registry.ensure_count(7, 3),
            Err(DevpoolError::InsufficientDevices {
                requested: 3,
                total: 2
            })
        ));
    }

    #[test]
    fn test_ensure_count_pool_exhausted_attaches_nothing() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(8, &[0, 1]).unwrap();

        assert!(matches!(
            registry.ensure_count(7, 2),
            Err(DevpoolError::NoAvailableDevice)
        ));
        assert!(registry.resolve_attached(7).is_empty());
    }

    #[test]
    fn test_query_fields() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(7, &[1]).unwrap();

        let fields = [DeviceField::Index, DeviceField::State, DeviceField::EnvIds];
        let rows = registry.query(None, &fields);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["0", "free", ""]);
        assert_eq!(rows[1], vec!["1", "attached", "7"]);

        assert_eq!(registry.query(Some(7), &fields), vec![vec!["1", "attached", "7"]]);
    }

    #[test]
    fn test_document_round_trip() {
        let mut registry = DeviceRegistry::with_count(3);
        registry.attach(12, &[2]).unwrap();

        let json = serde_json::to_value(&registry).unwrap();
        assert!(json["devices"]["0"]["eids"].as_object().unwrap().is_empty());
        assert_eq!(json["devices"]["2"]["eids"]["12"]["eid"], 12);

        let reloaded: DeviceRegistry = serde_json::from_value(json).unwrap();
        assert_eq!(reloaded, registry);
        assert_eq!(reloaded.resolve_attached(12), vec![2]);
    }
}
