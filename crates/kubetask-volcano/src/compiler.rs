//! Builders for Volcano Jobs and Queues
//!
//! Jobs start from an authored template and only get identity, queue and
//! per-task pod templates overlaid. Queues are built from scratch.

use std::collections::BTreeMap;

use crate::types::{QueueMetadata, VCJob, VCJobTask, VolcanoQueue, VolcanoQueueSpec};
use crate::DEFAULT_QUEUE;

/// One task to place into a VCJob
#[derive(Clone, Debug)]
pub struct TaskInput {
    /// Task name; matched against the template's tasks
    pub name: String,
    /// Pod replicas for this task
    pub replicas: u32,
    /// Fully compiled pod template
    pub template: serde_json::Value,
}

/// Identity and tasks for a queue-admitted job
#[derive(Clone, Debug)]
pub struct VCJobInput {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Queue name; blank falls back to `default`
    pub queue: Option<String>,
    pub tasks: Vec<TaskInput>,
}

/// Overlay `input` onto an authored VCJob template.
///
/// Template tasks are matched by name and keep their policies; tasks the
/// template does not author are appended. `minAvailable` keeps the authored
/// value when present, otherwise it gang-schedules every replica.
pub fn compile_vcjob(mut base: VCJob, input: VCJobInput) -> VCJob {
    base.metadata.name = input.name;
    base.metadata.namespace = input.namespace;
    base.metadata.labels.extend(input.labels);

    let queue = input
        .queue
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_QUEUE.to_string());
    base.spec.queue = Some(queue);

    let mut tasks = Vec::with_capacity(input.tasks.len());
    for task in input.tasks {
        let authored = base.spec.tasks.iter().find(|t| t.name == task.name);
        let policies = authored.map(|t| t.policies.clone()).unwrap_or_default();
        tasks.push(VCJobTask {
            name: task.name,
            replicas: task.replicas,
            template: task.template,
            policies,
        });
    }

    if base.spec.min_available.is_none() {
        base.spec.min_available = Some(tasks.iter().map(|t| t.replicas).sum());
    }
    base.spec.tasks = tasks;
    base
}

/// Desired shape of a Volcano queue
#[derive(Clone, Debug, PartialEq)]
pub struct QueueInput {
    pub name: String,
    pub weight: u32,
    pub reclaimable: bool,
    /// Resource ceiling keyed by resource name
    pub capability: BTreeMap<String, String>,
}

/// Build a Volcano Queue; capability doubles as the deserved share
pub fn compile_queue(input: QueueInput) -> VolcanoQueue {
    VolcanoQueue {
        api_version: "scheduling.volcano.sh/v1beta1".to_string(),
        kind: "Queue".to_string(),
        metadata: QueueMetadata { name: input.name },
        spec: VolcanoQueueSpec {
            weight: input.weight,
            reclaimable: input.reclaimable,
            deserved: input.capability.clone(),
            capability: input.capability,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{VCJobMetadata, VCJobSpec, VCJobTaskPolicy};

    fn template() -> VCJob {
        VCJob {
            api_version: "batch.volcano.sh/v1alpha1".to_string(),
            kind: "Job".to_string(),
            metadata: VCJobMetadata {
                name: String::new(),
                namespace: String::new(),
                labels: BTreeMap::from([("team".to_string(), "ml".to_string())]),
            },
            spec: VCJobSpec {
                scheduler_name: "volcano".to_string(),
                min_available: None,
                max_retry: Some(0),
                queue: None,
                priority_class_name: None,
                tasks: vec![VCJobTask {
                    name: "master".to_string(),
                    replicas: 1,
                    template: serde_json::Value::Null,
                    policies: vec![VCJobTaskPolicy {
                        event: "TaskCompleted".to_string(),
                        action: "CompleteJob".to_string(),
                    }],
                }],
                policies: vec![],
                plugins: BTreeMap::from([(
                    "pytorch".to_string(),
                    vec!["--master=master".to_string()],
                )]),
            },
        }
    }

    fn pod(image: &str) -> serde_json::Value {
        serde_json::json!({ "spec": { "containers": [{ "name": "c", "image": image }] } })
    }

    #[test]
    fn overlays_identity_and_keeps_authored_fields() {
        let job = compile_vcjob(
            template(),
            VCJobInput {
                name: "train-42".to_string(),
                namespace: "ml".to_string(),
                labels: BTreeMap::from([("name".to_string(), "train-42".to_string())]),
                queue: Some("gpu".to_string()),
                tasks: vec![
                    TaskInput {
                        name: "master".to_string(),
                        replicas: 1,
                        template: pod("img:1"),
                    },
                    TaskInput {
                        name: "worker".to_string(),
                        replicas: 3,
                        template: pod("img:1"),
                    },
                ],
            },
        );

        assert_eq!(job.metadata.name, "train-42");
        assert_eq!(job.metadata.labels.get("team").map(String::as_str), Some("ml"));
        assert_eq!(job.metadata.labels.get("name").map(String::as_str), Some("train-42"));
        assert_eq!(job.spec.queue.as_deref(), Some("gpu"));
        assert_eq!(job.spec.max_retry, Some(0));
        assert!(job.spec.plugins.contains_key("pytorch"));
        assert_eq!(job.spec.min_available, Some(4));
        assert_eq!(job.spec.tasks.len(), 2);
        assert_eq!(job.spec.tasks[0].policies.len(), 1);
        assert!(job.spec.tasks[1].policies.is_empty());
        assert_eq!(job.spec.tasks[1].template["spec"]["containers"][0]["image"], "img:1");
    }

    #[test]
    fn blank_queue_defaults() {
        let job = compile_vcjob(
            template(),
            VCJobInput {
                name: "a-1".to_string(),
                namespace: "ns".to_string(),
                labels: BTreeMap::new(),
                queue: Some("  ".to_string()),
                tasks: vec![],
            },
        );
        assert_eq!(job.spec.queue.as_deref(), Some("default"));
    }

    #[test]
    fn queue_capability_is_mirrored() {
        let queue = compile_queue(QueueInput {
            name: "gpu".to_string(),
            weight: 3,
            reclaimable: false,
            capability: BTreeMap::from([
                ("cpu".to_string(), "16".to_string()),
                ("memory".to_string(), "64Gi".to_string()),
            ]),
        });
        let json = serde_json::to_value(&queue).unwrap();
        assert_eq!(json["apiVersion"], "scheduling.volcano.sh/v1beta1");
        assert_eq!(json["metadata"]["name"], "gpu");
        assert_eq!(json["spec"]["weight"], 3);
        assert_eq!(json["spec"]["reclaimable"], false);
        assert_eq!(json["spec"]["capability"]["memory"], "64Gi");
        assert_eq!(json["spec"]["deserved"]["cpu"], "16");
    }
}
