//! CLI commands implementation
//!
//! Every command opens exactly one registry document at a time. Device
//! commands that need to know which environments are alive ask the
//! environments document first, through [`StoredEnvironments`], and only then
//! lock the devices document.

pub mod env;
pub mod gpu;

use devpool_core::{DevpoolConfig, DevpoolError, DevpoolResult, EnvId};
use devpool_runtime::{detect_device_count, HostProcesses, ProcessLiveness};
use devpool_scheduler::reconcile::sweep_dead_attachments;
use devpool_scheduler::{DeviceRegistry, EnvironmentRegistry, LiveEnvironments};
use devpool_store::DocumentStore;
use std::collections::BTreeSet;
use tracing::debug;

/// Options shared by every command
pub struct Context<L = HostProcesses> {
    pub config: DevpoolConfig,
    /// Run the liveness sweep before the command
    pub cleanup: bool,
    /// Recreate the command's own document
    pub reset: bool,
    pub liveness: L,
}

impl Context {
    pub fn new(config: DevpoolConfig, cleanup: bool, reset: bool) -> Self {
        Self {
            config,
            cleanup,
            reset,
            liveness: HostProcesses,
        }
    }
}

impl<L: ProcessLiveness> Context<L> {
    pub fn environment_store(&self) -> DocumentStore<EnvironmentRegistry> {
        DocumentStore::new(self.config.storage.environments_path())
    }

    pub fn device_store(&self) -> DocumentStore<DeviceRegistry> {
        DocumentStore::new(self.config.storage.devices_path())
    }

    /// The environments document seen from the device side
    pub fn live_environments(&self) -> StoredEnvironments<'_, L> {
        StoredEnvironments {
            store: self.environment_store(),
            liveness: &self.liveness,
            cleanup: self.cleanup,
        }
    }

    /// Run `f` against the environments document, sweeping it first
    pub fn with_environments<F, R>(&self, f: F) -> DevpoolResult<R>
    where
        F: FnOnce(&mut EnvironmentRegistry) -> DevpoolResult<R>,
    {
        self.environment_store()
            .transact(|| Ok(EnvironmentRegistry::new()), self.reset, |envs| {
                if self.cleanup {
                    envs.cleanup(&self.liveness);
                }
                f(envs)
            })
    }

    /// Run `f` against the devices document.
    ///
    /// Live environment ids are read before the devices document is locked.
    /// The device count is only queried when the document has to be created.
    pub async fn with_devices<F, R>(&self, f: F) -> DevpoolResult<R>
    where
        F: FnOnce(&mut DeviceRegistry) -> DevpoolResult<R>,
    {
        let live: Option<BTreeSet<EnvId>> = if self.cleanup {
            Some(self.live_environments().live_ids()?)
        } else {
            None
        };

        let store = self.device_store();
        let count = if self.reset || !store.exists() {
            Some(detect_device_count(&self.config.devices).await?)
        } else {
            None
        };

        let init = || {
            count.map(DeviceRegistry::with_count).ok_or_else(|| {
                DevpoolError::Storage(format!(
                    "{} disappeared while it was being opened, retry",
                    store.path().display()
                ))
            })
        };

        store.transact(init, self.reset, |devices| {
            if let Some(live) = &live {
                sweep_dead_attachments(devices, live);
            }
            f(devices)
        })
    }
}

/// [`LiveEnvironments`] backed by the environments document.
///
/// Each call is its own locked scope, swept first unless cleanup is disabled.
pub struct StoredEnvironments<'a, L> {
    store: DocumentStore<EnvironmentRegistry>,
    liveness: &'a L,
    cleanup: bool,
}

impl<L: ProcessLiveness> StoredEnvironments<'_, L> {
    fn read<F, R>(&self, f: F) -> DevpoolResult<R>
    where
        F: FnOnce(&EnvironmentRegistry) -> R,
    {
        self.store
            .transact(|| Ok(EnvironmentRegistry::new()), false, |envs| {
                if self.cleanup {
                    envs.cleanup(self.liveness);
                }
                Ok(f(envs))
            })
    }
}

impl<L: ProcessLiveness> LiveEnvironments for StoredEnvironments<'_, L> {
    fn live_ids(&self) -> DevpoolResult<BTreeSet<EnvId>> {
        let ids = self.read(|envs| envs.live_ids())?;
        debug!(live = ?ids, "Read live environments");
        Ok(ids)
    }

    fn device_count(&self, env_id: EnvId) -> DevpoolResult<Option<u32>> {
        self.read(|envs| envs.get(env_id).and_then(|env| env.config.device_count))
    }
}
