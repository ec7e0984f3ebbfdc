//! Volcano resources for queue-admitted execution
//!
//! Typed `batch.volcano.sh/v1alpha1` Jobs and `scheduling.volcano.sh/v1beta1`
//! Queues plus pure builders. No cluster access happens here.

mod compiler;
mod types;

pub use compiler::{compile_queue, compile_vcjob, QueueInput, TaskInput, VCJobInput};
pub use types::{
    QueueMetadata, QueueState, VCJob, VCJobMetadata, VCJobSpec, VCJobTask, VCJobTaskPolicy,
    VolcanoQueue, VolcanoQueueSpec,
};

/// Scheduler name Volcano registers with kube-scheduler
pub const VOLCANO_SCHEDULER: &str = "volcano";

/// Queue used when a request names none
pub const DEFAULT_QUEUE: &str = "default";
