//! Queue and queued-task entities

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kubetask_volcano::QueueState;
use serde::{Deserialize, Serialize};

use crate::error::{QueueError, Result};

/// Resource ceiling of a queue. Memory is in Gi.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Capability {
    pub cpu: Option<f64>,
    pub memory: Option<f64>,
    pub gpu: Option<f64>,
    /// GPU resource key; the configured default applies when unset
    pub gpu_type: Option<String>,
}

impl Capability {
    pub fn validate(&self) -> Result<()> {
        let quantity = |field: &str, v: Option<f64>| match v {
            Some(v) if !v.is_finite() || v < 0.0 => Err(QueueError::InvalidCapability {
                message: format!("{} must be a non-negative number, got {}", field, v),
            }),
            _ => Ok(()),
        };
        quantity("cpu", self.cpu)?;
        quantity("memory", self.memory)?;
        quantity("gpu", self.gpu)
    }

    /// Kubernetes resource map for the Volcano queue spec
    pub fn to_resources(&self, default_gpu_type: &str) -> BTreeMap<String, String> {
        let mut resources = BTreeMap::new();
        if let Some(cpu) = self.cpu {
            resources.insert("cpu".to_string(), number(cpu));
        }
        if let Some(memory) = self.memory {
            resources.insert("memory".to_string(), format!("{}Gi", number(memory)));
        }
        if let Some(gpu) = self.gpu.filter(|g| *g > 0.0) {
            let key = self
                .gpu_type
                .as_deref()
                .filter(|t| !t.is_empty())
                .unwrap_or(default_gpu_type);
            resources.insert(key.to_string(), number(gpu));
        }
        resources
    }
}

fn number(v: f64) -> String {
    if v.fract() == 0.0 {
        format!("{}", v as i64)
    } else {
        v.to_string()
    }
}

/// Admission unit mirrored to a Volcano queue
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Queue {
    pub id: i64,
    pub name: String,
    pub project_code: Option<i64>,
    pub description: Option<String>,
    /// Cluster identifier owning the Volcano queue
    pub cluster: String,
    pub weight: u32,
    pub reclaimable: bool,
    pub capability: Capability,
    pub state: QueueState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a queue
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewQueue {
    pub name: String,
    pub project_code: Option<i64>,
    pub description: Option<String>,
    pub cluster: String,
    /// Defaults to 1
    pub weight: Option<u32>,
    /// Defaults to true
    pub reclaimable: Option<bool>,
    pub capability: Capability,
}

/// Requested changes to a queue; unset fields stay as they are
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueUpdate {
    /// Must match the current name when given
    pub name: Option<String>,
    pub description: Option<String>,
    pub weight: Option<u32>,
    pub reclaimable: Option<bool>,
    pub capability: Option<Capability>,
}

/// Fields an update actually changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueChangeset {
    pub description: bool,
    pub weight: bool,
    pub reclaimable: bool,
    pub capability: bool,
}

impl QueueChangeset {
    /// Diff `update` against `current`
    pub fn between(current: &Queue, update: &QueueUpdate) -> Self {
        Self {
            description: update
                .description
                .as_ref()
                .is_some_and(|d| current.description.as_ref() != Some(d)),
            weight: update.weight.is_some_and(|w| w != current.weight),
            reclaimable: update.reclaimable.is_some_and(|r| r != current.reclaimable),
            capability: update
                .capability
                .as_ref()
                .is_some_and(|c| *c != current.capability),
        }
    }

    /// Changes the Volcano queue must see
    pub fn affects_cluster(&self) -> bool {
        self.weight || self.reclaimable || self.capability
    }

    pub fn is_empty(&self) -> bool {
        !self.description && !self.affects_cluster()
    }
}

/// Lifecycle of a queued task across workflow runs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueuedTaskStatus {
    Queued,
    Running,
    /// Finished this run; waiting for the next one
    PendingRerun,
    Succeeded,
    Failed,
}

/// Resources a task last asked for. Memory is in Gi.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceFootprint {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: Option<f64>,
    pub gpu_type: Option<String>,
}

/// Per-task-code bookkeeping record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTask {
    /// Stable task definition code, shared by every retry
    pub code: i64,
    pub queue: String,
    pub workflow_name: String,
    pub task_name: String,
    pub priority: i32,
    pub footprint: ResourceFootprint,
    pub status: QueuedTaskStatus,
    pub updated_at: DateTime<Utc>,
}

/// Observation of a task entering a queue
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NewQueuedTask {
    pub code: i64,
    pub queue: String,
    pub workflow_name: String,
    pub task_name: String,
    pub priority: i32,
    pub footprint: ResourceFootprint,
}

/// One page of a listing. `page` starts at 1.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl<T> Page<T> {
    /// Slice `all` into the requested page
    pub fn of(all: Vec<T>, page: usize, page_size: usize) -> Self {
        let page = page.max(1);
        let page_size = page_size.max(1);
        let total = all.len();
        let items = all
            .into_iter()
            .skip((page - 1).saturating_mul(page_size))
            .take(page_size)
            .collect();
        Self {
            items,
            total,
            page,
            page_size,
        }
    }
}

/// Resources held by a queue's running tasks
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu: f64,
    pub memory: f64,
    /// GPU quantity per GPU resource key
    pub gpu: BTreeMap<String, f64>,
}

impl ResourceUsage {
    pub fn add(&mut self, footprint: &ResourceFootprint, default_gpu_type: &str) {
        self.cpu += footprint.cpu;
        self.memory += footprint.memory;
        if let Some(gpu) = footprint.gpu.filter(|g| *g > 0.0) {
            let key = footprint
                .gpu_type
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| default_gpu_type.to_string());
            *self.gpu.entry(key).or_default() += gpu;
        }
    }
}
