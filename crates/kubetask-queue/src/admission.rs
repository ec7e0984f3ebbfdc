//! Queue admission manager
//!
//! Keeps queue rows and their Volcano queues in step. Writes go to the
//! cluster first and the row second, so a failed cluster call never leaves a
//! row behind. Queues owned by the local-test cluster never touch a cluster.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use kubetask_common::EngineConfig;
use kubetask_volcano::{compile_queue, QueueInput, QueueState, VolcanoQueue};
use tracing::{debug, info, warn};

use crate::cluster::QueueClusterOps;
use crate::error::{QueueError, Result};
use crate::model::{NewQueue, Page, Queue, QueueChangeset, QueueUpdate, QueuedTaskStatus, ResourceUsage};
use crate::repository::{QueueRepository, QueuedTaskRepository};

/// Settings the manager reads from the engine configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueSettings {
    pub local_test_cluster_code: String,
    pub default_gpu_type: String,
    pub gpu_types: Vec<String>,
}

impl From<&EngineConfig> for QueueSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            local_test_cluster_code: config.local_test_cluster_code.clone(),
            default_gpu_type: config.default_gpu_type.clone(),
            gpu_types: config.gpu_type_list(),
        }
    }
}

/// CRUD for queues, mirrored to Volcano
pub struct QueueManager {
    queues: Arc<dyn QueueRepository>,
    tasks: Arc<dyn QueuedTaskRepository>,
    cluster: Arc<dyn QueueClusterOps>,
    settings: QueueSettings,
    /// Names with a create in flight
    creating: DashSet<String>,
}

/// Holds a queue name for one create; released on drop
struct NameReservation<'a> {
    names: &'a DashSet<String>,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.names.remove(&self.name);
    }
}

impl QueueManager {
    pub fn new(
        queues: Arc<dyn QueueRepository>,
        tasks: Arc<dyn QueuedTaskRepository>,
        cluster: Arc<dyn QueueClusterOps>,
        settings: QueueSettings,
    ) -> Self {
        Self {
            queues,
            tasks,
            cluster,
            settings,
            creating: DashSet::new(),
        }
    }

    /// Create a queue. The Volcano queue is applied before the row is stored.
    pub async fn create(&self, request: NewQueue) -> Result<Queue> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(QueueError::Validation("queue name is empty".to_string()));
        }
        request.capability.validate()?;
        let _reservation = self.reserve(&name)?;
        if self.queues.find_by_name(&name).await?.is_some() {
            warn!(queue = %name, "Queue already exists");
            return Err(QueueError::QueueExists { name });
        }

        let now = Utc::now();
        let queue = Queue {
            id: 0,
            name,
            project_code: request.project_code,
            description: request.description,
            cluster: request.cluster,
            weight: request.weight.unwrap_or(1),
            reclaimable: request.reclaimable.unwrap_or(true),
            capability: request.capability,
            state: QueueState::Unknown,
            created_at: now,
            updated_at: now,
        };

        if self.is_local(&queue) {
            debug!(queue = %queue.name, "Local test cluster, skipping Volcano queue");
        } else {
            self.apply(&queue).await?;
        }
        let queue = self.queues.insert(queue).await?;
        info!(queue = %queue.name, id = queue.id, cluster = %queue.cluster, "Created queue");
        Ok(queue)
    }

    /// Apply an update. Cluster-affecting changes re-apply the Volcano queue
    /// before the row is written; description changes touch the row only.
    pub async fn update(&self, id: i64, update: QueueUpdate) -> Result<Queue> {
        let current = self.get(id).await?;
        if let Some(name) = &update.name {
            if name.trim() != current.name {
                return Err(QueueError::Validation(format!(
                    "queue '{}' cannot be renamed",
                    current.name
                )));
            }
        }
        if let Some(capability) = &update.capability {
            capability.validate()?;
        }

        let changes = QueueChangeset::between(&current, &update);
        if changes.is_empty() {
            debug!(queue = %current.name, "Nothing to update");
            return Ok(current);
        }

        let mut queue = current;
        if let Some(description) = update.description {
            queue.description = Some(description);
        }
        if let Some(weight) = update.weight {
            queue.weight = weight;
        }
        if let Some(reclaimable) = update.reclaimable {
            queue.reclaimable = reclaimable;
        }
        if let Some(capability) = update.capability {
            queue.capability = capability;
        }
        queue.updated_at = Utc::now();

        if changes.affects_cluster() && !self.is_local(&queue) {
            self.apply(&queue).await?;
        }
        self.queues.update(&queue).await?;
        info!(queue = %queue.name, ?changes, "Updated queue");
        Ok(queue)
    }

    /// Delete the Volcano queue, then the row. A cluster failure keeps the row.
    pub async fn delete(&self, id: i64) -> Result<()> {
        let queue = self.get(id).await?;
        if !self.is_local(&queue) {
            self.cluster
                .delete(&queue.cluster, &self.manifest(&queue).metadata.name)
                .await
                .map_err(|e| QueueError::cluster(&queue.cluster, e))?;
        }
        self.queues.delete(id).await?;
        info!(queue = %queue.name, id, "Deleted queue");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Queue> {
        self.queues
            .get(id)
            .await?
            .ok_or(QueueError::NotFound { id })
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<Queue>> {
        self.queues.find_by_name(name).await
    }

    pub async fn list(&self, project_code: Option<i64>, page: usize, page_size: usize) -> Result<Page<Queue>> {
        self.queues.list(project_code, page, page_size).await
    }

    /// GPU resource keys a capability may name
    pub fn gpu_types(&self) -> Vec<String> {
        self.settings.gpu_types.clone()
    }

    /// Resources held by the queue's running tasks
    pub async fn resource_usage(&self, queue_name: &str) -> Result<ResourceUsage> {
        let running = self
            .tasks
            .list_by_queue(queue_name, Some(QueuedTaskStatus::Running))
            .await?;
        let mut usage = ResourceUsage::default();
        for task in &running {
            usage.add(&task.footprint, &self.settings.default_gpu_type);
        }
        Ok(usage)
    }

    /// Read the Volcano queue's state into the row
    pub async fn refresh_state(&self, id: i64) -> Result<Queue> {
        let mut queue = self.get(id).await?;
        if self.is_local(&queue) {
            return Ok(queue);
        }
        let state = self
            .cluster
            .state(&queue.cluster, &queue.name)
            .await
            .map_err(|e| QueueError::cluster(&queue.cluster, e))?
            .unwrap_or_default();
        if state != queue.state {
            queue.state = state;
            queue.updated_at = Utc::now();
            self.queues.update(&queue).await?;
            debug!(queue = %queue.name, state = state.as_str(), "Queue state changed");
        }
        Ok(queue)
    }

    /// Volcano queue rendered from a row
    pub fn manifest(&self, queue: &Queue) -> VolcanoQueue {
        compile_queue(QueueInput {
            name: queue.name.clone(),
            weight: queue.weight,
            reclaimable: queue.reclaimable,
            capability: queue.capability.to_resources(&self.settings.default_gpu_type),
        })
    }

    /// The name stays reserved from the existence check until the row is
    /// stored, so a concurrent create never reaches the cluster.
    fn reserve(&self, name: &str) -> Result<NameReservation<'_>> {
        if !self.creating.insert(name.to_string()) {
            warn!(queue = %name, "Queue creation already in progress");
            return Err(QueueError::QueueExists {
                name: name.to_string(),
            });
        }
        Ok(NameReservation {
            names: &self.creating,
            name: name.to_string(),
        })
    }

    async fn apply(&self, queue: &Queue) -> Result<()> {
        self.cluster
            .apply(&queue.cluster, &self.manifest(queue))
            .await
            .map_err(|e| QueueError::cluster(&queue.cluster, e))
    }

    fn is_local(&self, queue: &Queue) -> bool {
        queue.cluster == self.settings.local_test_cluster_code
    }
}
