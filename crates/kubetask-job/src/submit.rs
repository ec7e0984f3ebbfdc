//! Idempotent submission
//!
//! `submit` always deletes any object left under the derived name before
//! creating the new one, so at most one live object exists per name.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cluster::WorkloadApi;
use crate::compiler::CompiledManifest;
use crate::error::{JobError, Result};

/// Delay between existence checks while a deleted object drains
pub const DELETE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Existence checks before creating anyway
pub const DELETE_POLL_ATTEMPTS: u32 = 30;

/// Delete the object if it exists. A missing object is a no-op.
pub async fn stop(api: &dyn WorkloadApi, manifest: &CompiledManifest) -> Result<()> {
    let exists = api
        .exists(&manifest.namespace, &manifest.name)
        .await
        .map_err(|e| cluster_error(manifest, e))?;
    if !exists {
        debug!(job = %manifest.name, namespace = %manifest.namespace, "Nothing to stop");
        return Ok(());
    }

    api.delete(&manifest.namespace, &manifest.name)
        .await
        .map_err(|e| cluster_error(manifest, e))?;
    info!(job = %manifest.name, namespace = %manifest.namespace, "Deleted workload");
    Ok(())
}

/// Replace whatever lives under the derived name with `manifest`
pub async fn submit(api: &dyn WorkloadApi, manifest: &CompiledManifest) -> Result<()> {
    stop(api, manifest).await?;
    wait_until_gone(api, manifest).await?;

    api.create(&manifest.namespace, &manifest.object)
        .await
        .map_err(|e| cluster_error(manifest, e))?;
    info!(
        job = %manifest.name,
        namespace = %manifest.namespace,
        kind = ?manifest.kind,
        cluster = %manifest.target,
        "Submitted workload"
    );
    Ok(())
}

/// Background deletion keeps the old object around briefly; creating under
/// the same name before it is gone would conflict.
async fn wait_until_gone(api: &dyn WorkloadApi, manifest: &CompiledManifest) -> Result<()> {
    for attempt in 1..=DELETE_POLL_ATTEMPTS {
        let exists = api
            .exists(&manifest.namespace, &manifest.name)
            .await
            .map_err(|e| cluster_error(manifest, e))?;
        if !exists {
            return Ok(());
        }
        debug!(job = %manifest.name, attempt, "Waiting for previous workload to be removed");
        tokio::time::sleep(DELETE_POLL_INTERVAL).await;
    }
    warn!(job = %manifest.name, "Previous workload still present, creating anyway");
    Ok(())
}

fn cluster_error(manifest: &CompiledManifest, source: kubetask_common::Error) -> JobError {
    JobError::cluster(manifest.target.to_string(), source)
}
