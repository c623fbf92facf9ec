//! Device commands

use devpool_core::{DeviceField, DeviceIndex, DevpoolResult, EnvId};
use devpool_runtime::ProcessLiveness;
use devpool_scheduler::LiveEnvironments;
use tracing::debug;

use super::Context;
use crate::render;

/// Device count used when an environment has none configured
pub const DEFAULT_DEVICE_COUNT: u32 = 1;

const PS_FIELDS: [DeviceField; 4] = [
    DeviceField::Index,
    DeviceField::State,
    DeviceField::EnvIds,
    DeviceField::AttachedAt,
];
const PS_HEADERS: [&str; 4] = ["index", "state", "eids", "attached"];

/// Which devices `attach` should claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachRequest {
    /// These exact devices
    Indices(Vec<DeviceIndex>),
    /// This many more free devices
    Count(u32),
    /// Exactly this many devices in total
    Ensure(u32),
    /// The environment's configured device count
    Configured,
}

/// Attach devices to `eid`. Returns every device attached to it afterwards.
pub async fn attach<L: ProcessLiveness>(
    ctx: &Context<L>,
    eid: EnvId,
    request: AttachRequest,
) -> DevpoolResult<Vec<DeviceIndex>> {
    let configured_target = if request == AttachRequest::Configured {
        let configured = ctx.live_environments().device_count(eid)?;
        debug!(env_id = eid, configured = ?configured, "Resolved configured device count");
        configured.unwrap_or(DEFAULT_DEVICE_COUNT)
    } else {
        DEFAULT_DEVICE_COUNT
    };

    ctx.with_devices(|devices| {
        match request {
            AttachRequest::Indices(indices) => devices.attach(eid, &indices)?,
            AttachRequest::Count(count) => {
                let indices = devices.find_available_many(count)?;
                devices.attach(eid, &indices)?;
            }
            AttachRequest::Ensure(target) => {
                devices.ensure_count(eid, target)?;
            }
            AttachRequest::Configured => {
                devices.ensure_count(eid, configured_target)?;
            }
        }
        Ok(devices.resolve_attached(eid))
    })
    .await
}

/// Detach `eid` from one device or all of them
pub async fn detach<L: ProcessLiveness>(
    ctx: &Context<L>,
    eid: EnvId,
    index: Option<DeviceIndex>,
) -> DevpoolResult<Vec<DeviceIndex>> {
    ctx.with_devices(|devices| Ok(devices.detach(eid, index)))
        .await
}

pub async fn ps<L: ProcessLiveness>(ctx: &Context<L>, csv: bool) -> DevpoolResult<String> {
    let rows = ctx
        .with_devices(|devices| Ok(devices.query(None, &PS_FIELDS)))
        .await?;
    Ok(if csv {
        render::csv(&PS_HEADERS, &rows)
    } else {
        render::table(&PS_HEADERS, &rows)
    })
}

pub async fn query<L: ProcessLiveness>(
    ctx: &Context<L>,
    eid: Option<EnvId>,
    fields: &[String],
) -> DevpoolResult<String> {
    let fields: Vec<DeviceField> = if fields.is_empty() {
        DeviceField::DEFAULT.to_vec()
    } else {
        fields.iter().map(|f| DeviceField::parse(f)).collect()
    };
    let rows = ctx
        .with_devices(|devices| Ok(devices.query(eid, &fields)))
        .await?;
    Ok(render::lines(&rows))
}

/// Comma-separated indices, the form `CUDA_VISIBLE_DEVICES` takes
pub fn format_indices(indices: &[DeviceIndex]) -> String {
    indices
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::env;
    use crate::commands::tests::test_context;
    use devpool_core::{ConfigUpdate, DevpoolError};

    #[tokio::test]
    async fn test_ensure_then_shrink() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 4);
        ctx.liveness.spawn(100);
        env::activate(&ctx, Some(100), Some(7)).unwrap();

        let attached = attach(&ctx, 7, AttachRequest::Ensure(2)).await.unwrap();
        assert_eq!(attached, vec![0, 1]);

        let attached = attach(&ctx, 7, AttachRequest::Ensure(1)).await.unwrap();
        assert_eq!(attached.len(), 1);
        assert!(attached[0] == 0 || attached[0] == 1);
    }

    #[tokio::test]
    async fn test_attach_busy_device() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 4);
        ctx.liveness.spawn(100);
        ctx.liveness.spawn(200);
        env::activate(&ctx, Some(100), Some(2)).unwrap();
        env::activate(&ctx, Some(200), Some(9)).unwrap();

        attach(&ctx, 2, AttachRequest::Indices(vec![3])).await.unwrap();
        let result = attach(&ctx, 9, AttachRequest::Indices(vec![1, 3])).await;
        assert!(matches!(result, Err(DevpoolError::DeviceBusy(3))));

        let eids = vec!["index".to_string()];
        assert_eq!(query(&ctx, Some(9), &eids).await.unwrap(), "");
        assert_eq!(query(&ctx, Some(2), &eids).await.unwrap(), "3\n");
    }

    #[tokio::test]
    async fn test_attach_configured_count() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 4);
        ctx.liveness.spawn(100);
        ctx.liveness.spawn(200);
        env::activate(&ctx, Some(100), Some(7)).unwrap();
        env::activate(&ctx, Some(200), Some(8)).unwrap();
        env::configure(&ctx, 7, ConfigUpdate::SetDeviceCount(3)).unwrap();

        let attached = attach(&ctx, 7, AttachRequest::Configured).await.unwrap();
        assert_eq!(attached, vec![0, 1, 2]);

        let attached = attach(&ctx, 8, AttachRequest::Configured).await.unwrap();
        assert_eq!(attached, vec![3]);

        let result = attach(&ctx, 8, AttachRequest::Count(1)).await;
        assert!(matches!(result, Err(DevpoolError::NoAvailableDevice)));
    }

    #[tokio::test]
    async fn test_exited_environment_releases_devices() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 2);
        ctx.liveness.spawn(100);
        ctx.liveness.spawn(200);
        env::activate(&ctx, Some(100), Some(7)).unwrap();
        env::activate(&ctx, Some(200), Some(8)).unwrap();
        attach(&ctx, 7, AttachRequest::Count(2)).await.unwrap();

        let result = attach(&ctx, 8, AttachRequest::Count(1)).await;
        assert!(matches!(result, Err(DevpoolError::NoAvailableDevice)));

        ctx.liveness.exit(100);
        let attached = attach(&ctx, 8, AttachRequest::Count(1)).await.unwrap();
        assert_eq!(attached, vec![0]);

        let ps_out = ps(&ctx, true).await.unwrap();
        assert!(ps_out.starts_with("index,state,eids,attached\n0,attached,8,"));
        assert!(ps_out.ends_with("1,free,,\n"));
    }

    #[tokio::test]
    async fn test_detach_twice() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(&dir, 3);
        ctx.liveness.spawn(100);
        env::activate(&ctx, Some(100), Some(7)).unwrap();
        attach(&ctx, 7, AttachRequest::Count(2)).await.unwrap();

        assert_eq!(detach(&ctx, 7, None).await.unwrap(), vec![0, 1]);
        let once = ps(&ctx, true).await.unwrap();
        assert!(detach(&ctx, 7, None).await.unwrap().is_empty());
        assert_eq!(ps(&ctx, true).await.unwrap(), once);
    }

    #[test]
    fn test_format_indices() {
        assert_eq!(format_indices(&[]), "");
        assert_eq!(format_indices(&[0, 3]), "0,3");
    }
}
