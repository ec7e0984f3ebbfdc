//! Cluster side of queue admission: the Volcano `Queue` resource

use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kubetask_common::error::is_not_found;
use kubetask_common::{
    ClusterClientProvider, ClusterTarget, CrdKind, CrdRegistry, Error, Result, FIELD_MANAGER,
};
use kubetask_volcano::{QueueState, VolcanoQueue};
use tracing::{debug, info};

/// Operations on Volcano queues in one cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClusterOps: Send + Sync {
    /// Create or replace the queue by server-side apply
    async fn apply(&self, cluster: &str, queue: &VolcanoQueue) -> Result<()>;

    /// Delete the queue; a missing queue is not an error
    async fn delete(&self, cluster: &str, name: &str) -> Result<()>;

    /// Reported state, or `None` when the queue does not exist
    async fn state(&self, cluster: &str, name: &str) -> Result<Option<QueueState>>;
}

/// [`QueueClusterOps`] through the cached client provider
pub struct KubeQueueOps {
    provider: Arc<dyn ClusterClientProvider>,
    crds: Arc<CrdRegistry>,
}

impl KubeQueueOps {
    pub fn new(provider: Arc<dyn ClusterClientProvider>, crds: Arc<CrdRegistry>) -> Self {
        Self { provider, crds }
    }

    async fn api(&self, cluster: &str) -> Result<Api<DynamicObject>> {
        let client = self.provider.client(&ClusterTarget::cluster(cluster)).await?;
        let ar = self.crds.resolve(CrdKind::VolcanoQueue);
        Ok(Api::all_with(client, &ar))
    }
}

#[async_trait]
impl QueueClusterOps for KubeQueueOps {
    async fn apply(&self, cluster: &str, queue: &VolcanoQueue) -> Result<()> {
        let api = self.api(cluster).await?;
        let json = serde_json::to_value(queue)
            .map_err(|e| Error::serialization_for("Queue", e.to_string()))?;
        let obj: DynamicObject = serde_json::from_value(json)
            .map_err(|e| Error::serialization_for("Queue", e.to_string()))?;

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&queue.metadata.name, &params, &Patch::Apply(&obj))
            .await
            .map_err(|e| Error::cluster(cluster, format!("failed to apply queue: {}", e)))?;
        info!(queue = %queue.metadata.name, cluster = %cluster, "Applied Volcano queue");
        Ok(())
    }

    async fn delete(&self, cluster: &str, name: &str) -> Result<()> {
        let api = self.api(cluster).await?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(queue = %name, cluster = %cluster, "Deleted Volcano queue");
                Ok(())
            }
            Err(e) if is_not_found(&e) => {
                debug!(queue = %name, cluster = %cluster, "Volcano queue already gone");
                Ok(())
            }
            Err(e) => Err(Error::cluster(cluster, format!("failed to delete queue: {}", e))),
        }
    }

    async fn state(&self, cluster: &str, name: &str) -> Result<Option<QueueState>> {
        let api = self.api(cluster).await?;
        let Some(obj) = api.get_opt(name).await? else {
            return Ok(None);
        };
        let json = serde_json::to_value(&obj)
            .map_err(|e| Error::serialization_for("Queue", e.to_string()))?;
        Ok(Some(QueueState::from_object(&json)))
    }
}
