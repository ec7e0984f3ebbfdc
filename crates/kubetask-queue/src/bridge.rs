//! Queued-task status bridge
//!
//! Turns the scheduler's task lifecycle signals into queued-task status
//! changes. The two signal handlers never fail: bookkeeping errors are logged
//! and dropped so task-result processing carries on.

use std::sync::Arc;

use chrono::Utc;
use kubetask_common::TaskType;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::{NewQueuedTask, QueuedTask, QueuedTaskStatus};
use crate::repository::{QueuedTaskRepository, Upserted};

pub struct QueuedTaskBridge {
    tasks: Arc<dyn QueuedTaskRepository>,
    queue_enabled: bool,
}

impl QueuedTaskBridge {
    pub fn new(tasks: Arc<dyn QueuedTaskRepository>, queue_enabled: bool) -> Self {
        Self {
            tasks,
            queue_enabled,
        }
    }

    /// A task of `task_type` started running
    pub async fn on_task_running(&self, task_code: i64, task_type: TaskType) {
        if !self.queue_enabled || !task_type.tracks_running() {
            return;
        }
        self.transition(task_code, QueuedTaskStatus::Running).await;
    }

    /// A task of `task_type` finished; it waits for the next workflow run
    pub async fn on_task_finished(&self, task_code: i64, task_type: TaskType) {
        if !self.queue_enabled || !task_type.tracks_finished() {
            return;
        }
        self.transition(task_code, QueuedTaskStatus::PendingRerun).await;
    }

    async fn transition(&self, task_code: i64, status: QueuedTaskStatus) {
        match self.tasks.set_status(task_code, status).await {
            Ok(true) => debug!(task_code, ?status, "Queued task status updated"),
            Ok(false) => debug!(task_code, ?status, "No queued task recorded for code"),
            Err(e) => warn!(task_code, ?status, error = %e, "Failed to update queued task status"),
        }
    }

    /// Insert or refresh the record for a task code. New records start
    /// `Queued`; existing ones keep their status.
    pub async fn record(&self, observed: NewQueuedTask) -> Result<QueuedTask> {
        let status = match self.tasks.find(observed.code).await? {
            Some(existing) => existing.status,
            None => QueuedTaskStatus::Queued,
        };
        let task = QueuedTask {
            code: observed.code,
            queue: observed.queue,
            workflow_name: observed.workflow_name,
            task_name: observed.task_name,
            priority: observed.priority,
            footprint: observed.footprint,
            status,
            updated_at: Utc::now(),
        };
        let upserted = self.tasks.upsert(task.clone()).await?;
        if upserted == Upserted::Inserted {
            info!(task_code = task.code, queue = %task.queue, "Recorded queued task");
        }
        Ok(task)
    }

    /// Set a status explicitly. Returns false when the code is unknown.
    pub async fn set_status(&self, task_code: i64, status: QueuedTaskStatus) -> Result<bool> {
        self.tasks.set_status(task_code, status).await
    }

    pub async fn list_by_queue(&self, queue: &str) -> Result<Vec<QueuedTask>> {
        self.tasks.list_by_queue(queue, None).await
    }
}
