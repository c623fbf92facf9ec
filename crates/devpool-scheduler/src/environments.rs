//! Environment registry
//!
//! Root of the environments document: `{ "envs": { "<id>": { ... } } }`.

use devpool_core::{ConfigUpdate, EnvId, Environment, EnvironmentField, Pid};
use devpool_runtime::ProcessLiveness;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

use crate::reconcile::{self, EnvironmentSweep};

/// Registry of live environments keyed by id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRegistry {
    #[serde(default)]
    envs: BTreeMap<EnvId, Environment>,
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.envs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envs.is_empty()
    }

    pub fn get(&self, env_id: EnvId) -> Option<&Environment> {
        self.envs.get(&env_id)
    }

    pub fn live_ids(&self) -> BTreeSet<EnvId> {
        self.envs.keys().copied().collect()
    }

    /// The environment holding `pid`, if any
    pub fn find_by_process(&self, pid: Pid) -> Option<&Environment> {
        self.envs.values().find(|env| env.process_ids.contains(&pid))
    }

    /// Register `pid` with the environment `env_id`, creating it on first use.
    ///
    /// The owner is only recorded when the environment is created. A pid that
    /// is already registered with the environment is not added again.
    pub fn activate(
        &mut self,
        pid: Pid,
        env_id: EnvId,
        owner_uid: u32,
        owner_name: &str,
    ) -> &Environment {
        let env = self.envs.entry(env_id).or_insert_with(|| {
            info!(env_id = env_id, owner = owner_name, "Creating environment");
            Environment::new(env_id, owner_uid, owner_name)
        });

        if env.process_ids.contains(&pid) {
            debug!(env_id = env_id, pid = pid, "Process already active");
        } else {
            env.process_ids.push(pid);
            debug!(env_id = env_id, pid = pid, "Activated process");
        }

        env
    }

    /// Remove `pid` from whichever environment holds it.
    ///
    /// Runs the environment sweep with every process except `pid` treated as
    /// alive, so an environment left without processes is dropped here.
    pub fn deactivate(&mut self, pid: Pid) -> EnvironmentSweep {
        match self.find_by_process(pid) {
            Some(env) => debug!(env_id = env.id, pid = pid, "Deactivating process"),
            None => debug!(pid = pid, "Deactivated process belongs to no environment"),
        }
        let others_alive = move |candidate: Pid| candidate != pid;
        reconcile::sweep_environments(self, &others_alive)
    }

    /// Drop dead processes and the environments left without any
    pub fn cleanup<L: ProcessLiveness + ?Sized>(&mut self, liveness: &L) -> EnvironmentSweep {
        reconcile::sweep_environments(self, liveness)
    }

    /// Apply a configuration change. Unknown ids are ignored.
    ///
    /// Returns whether the environment exists.
    pub fn configure(&mut self, env_id: EnvId, update: ConfigUpdate) -> bool {
        match self.envs.get_mut(&env_id) {
            Some(env) => {
                debug!(env_id = env_id, update = ?update, "Configuring environment");
                env.config.apply(update);
                true
            }
            None => {
                debug!(env_id = env_id, "Configure on unknown environment ignored");
                false
            }
        }
    }

    /// Project `fields` for one environment or all of them.
    ///
    /// An unknown id yields no rows.
    pub fn query(&self, env_id: Option<EnvId>, fields: &[EnvironmentField]) -> Vec<Vec<String>> {
        let project =
            |env: &Environment| -> Vec<String> { fields.iter().map(|f| env.field(f)).collect() };
        match env_id {
            Some(id) => self.envs.get(&id).map(project).into_iter().collect(),
            None => self.envs.values().map(project).collect(),
        }
    }

    pub(crate) fn entries_mut(&mut self) -> &mut BTreeMap<EnvId, Environment> {
        &mut self.envs
    }
}
