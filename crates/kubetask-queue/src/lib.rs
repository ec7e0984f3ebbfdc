//! Queue admission for kubetask
//!
//! Manages Volcano queues and the per-task-code records that track which
//! queued tasks are running, plus the bridge that updates those records from
//! scheduler lifecycle signals.

pub mod admission;
pub mod bridge;
pub mod cluster;
pub mod error;
pub mod model;
pub mod repository;

pub use admission::{QueueManager, QueueSettings};
pub use bridge::QueuedTaskBridge;
pub use cluster::{KubeQueueOps, QueueClusterOps};
pub use error::{QueueError, Result};
pub use model::{
    Capability, NewQueue, NewQueuedTask, Page, Queue, QueueUpdate, QueuedTask, QueuedTaskStatus,
    ResourceFootprint, ResourceUsage,
};
pub use repository::{
    InMemoryQueueRepository, InMemoryQueuedTaskRepository, QueueRepository, QueuedTaskRepository,
};
