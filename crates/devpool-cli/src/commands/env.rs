//! Environment commands

use devpool_core::{ConfigUpdate, DevpoolResult, EnvId, EnvironmentField, Pid};
use devpool_runtime::process::{default_environment_id, default_process_id};
use devpool_runtime::{current_owner, ProcessLiveness};
use tracing::info;

use super::Context;
use crate::render;

const PS_FIELDS: [EnvironmentField; 6] = [
    EnvironmentField::Id,
    EnvironmentField::OwnerName,
    EnvironmentField::CreatedAt,
    EnvironmentField::ProcessIds,
    EnvironmentField::Name,
    EnvironmentField::DeviceCount,
];
const PS_HEADERS: [&str; 6] = ["eid", "user", "created", "pids", "name", "gpus"];

/// Register a process with an environment, creating the environment if new.
///
/// Defaults to the calling shell and its session.
pub fn activate<L: ProcessLiveness>(
    ctx: &Context<L>,
    pid: Option<Pid>,
    eid: Option<EnvId>,
) -> DevpoolResult<EnvId> {
    let pid = pid.unwrap_or_else(default_process_id);
    let eid = eid.unwrap_or_else(|| default_environment_id(pid));
    let owner = current_owner();

    ctx.with_environments(|envs| {
        envs.activate(pid, eid, owner.uid, &owner.name);
        Ok(())
    })?;
    info!(pid = pid, env_id = eid, "Process activated");
    Ok(eid)
}

/// Remove a process from its environment
pub fn deactivate<L: ProcessLiveness>(ctx: &Context<L>, pid: Option<Pid>) -> DevpoolResult<()> {
    let pid = pid.unwrap_or_else(default_process_id);
    let sweep = ctx.with_environments(|envs| Ok(envs.deactivate(pid)))?;
    info!(pid = pid, removed_envs = ?sweep.removed_envs, "Process deactivated");
    Ok(())
}

/// Set or clear one configuration key. Unknown environments are ignored.
pub fn configure<L: ProcessLiveness>(
    ctx: &Context<L>,
    eid: EnvId,
    update: ConfigUpdate,
) -> DevpoolResult<bool> {
    ctx.with_environments(|envs| Ok(envs.configure(eid, update)))
}

pub fn ps<L: ProcessLiveness>(ctx: &Context<L>, csv: bool) -> DevpoolResult<String> {
    let rows = ctx.with_environments(|envs| Ok(envs.query(None, &PS_FIELDS)))?;
    Ok(if csv {
        render::csv(&PS_HEADERS, &rows)
    } else {
        render::table(&PS_HEADERS, &rows)
    })
}

pub fn query<L: ProcessLiveness>(
    ctx: &Context<L>,
    eid: Option<EnvId>,
    fields: &[String],
) -> DevpoolResult<String> {
    let fields: Vec<EnvironmentField> = if fields.is_empty() {
        EnvironmentField::DEFAULT.to_vec()
    } else {
        fields.iter().map(|f| EnvironmentField::parse(f)).collect()
    };
    let rows = ctx.with_environments(|envs| Ok(envs.query(eid, &fields)))?;
    Ok(render::lines(&rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::test_context;
    use devpool_core::ConfigKey;

    #[test]
    fn test_activate_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 2);
        ctx.liveness.spawn(100);

        assert_eq!(activate(&ctx, Some(100), Some(7)).unwrap(), 7);
        configure(&ctx, 7, ConfigUpdate::SetName("train".to_string())).unwrap();

        let fields = vec!["id".to_string(), "config.name".to_string(), "gpus".to_string()];
        assert_eq!(query(&ctx, None, &fields).unwrap(), "7,train,\n");
        assert_eq!(query(&ctx, Some(9), &fields).unwrap(), "");
    }

    #[test]
    fn test_cleanup_removes_exited_environments() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(&dir, 2);
        ctx.liveness.spawn(100);
        ctx.liveness.spawn(200);
        activate(&ctx, Some(100), Some(7)).unwrap();
        activate(&ctx, Some(200), Some(8)).unwrap();

        ctx.liveness.exit(200);
        ctx.cleanup = false;
        let ids = vec!["id".to_string()];
        assert_eq!(query(&ctx, None, &ids).unwrap(), "7\n8\n");

        ctx.cleanup = true;
        assert_eq!(query(&ctx, None, &ids).unwrap(), "7\n");
    }

    #[test]
    fn test_deactivate_keeps_live_processes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 2);
        ctx.liveness.spawn(100);
        ctx.liveness.spawn(200);
        activate(&ctx, Some(100), Some(7)).unwrap();
        activate(&ctx, Some(200), Some(7)).unwrap();

        deactivate(&ctx, Some(100)).unwrap();

        let pids = vec!["pids".to_string()];
        assert_eq!(query(&ctx, Some(7), &pids).unwrap(), "200\n");
    }

    #[test]
    fn test_configure_unknown_environment() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 2);
        assert!(!configure(&ctx, 42, ConfigUpdate::Clear(ConfigKey::Name)).unwrap());
    }

    #[test]
    fn test_reset_clears_environments() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = test_context(&dir, 2);
        ctx.liveness.spawn(100);
        activate(&ctx, Some(100), Some(7)).unwrap();

        ctx.reset = true;
        let out = ps(&ctx, true).unwrap();
        assert_eq!(out, "eid,user,created,pids,name,gpus\n");
    }
}
