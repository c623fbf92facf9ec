//! Live-environment port
//!
//! The device side never reads the environments document directly. It asks
//! this interface which environments exist and what they are configured for.

use devpool_core::{DevpoolResult, EnvId};
use std::collections::BTreeSet;

use crate::environments::EnvironmentRegistry;

pub trait LiveEnvironments {
    /// Ids of every environment currently registered
    fn live_ids(&self) -> DevpoolResult<BTreeSet<EnvId>>;

    /// The configured device count of `env_id`, if it exists and has one
    fn device_count(&self, env_id: EnvId) -> DevpoolResult<Option<u32>>;
}

impl LiveEnvironments for EnvironmentRegistry {
    fn live_ids(&self) -> DevpoolResult<BTreeSet<EnvId>> {
        Ok(EnvironmentRegistry::live_ids(self))
    }

    fn device_count(&self, env_id: EnvId) -> DevpoolResult<Option<u32>> {
        Ok(self.get(env_id).and_then(|env| env.config.device_count))
    }
}
