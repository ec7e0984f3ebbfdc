//! Request files compiled through a configured engine
//!
//! Compilation never contacts a cluster, so these run without one.

use std::collections::BTreeMap;
use std::sync::Arc;

use kubetask_common::client::FileKubeconfigResolver;
use kubetask_common::{CachedClientProvider, EngineConfig, TaskType};
use kubetask_job::{Engine, ExecutionRequest, LiveInstanceSet, WorkloadKind};

const REQUEST: &str = r#"
taskName: Train_Model
taskInstanceId: 42
taskCode: 9001
processInstanceId: 7
image: registry.local/train:1.0
command: '["python", "train.py"]'
args: '["--epochs", "3"]'
namespace: ml
cluster: prod
fetches:
  - fetchName: images
    fetchType: s3
    hostPath: /mnt/fetch
    args: '["--source", "s3://bucket/images"]'
  - fetchName: labels
    fetchType: s3
    hostPath: /mnt/fetch
    args: '["--source", "s3://bucket/labels"]'
"#;

fn engine(config: &EngineConfig) -> Engine {
    let provider = Arc::new(CachedClientProvider::new(
        Arc::new(FileKubeconfigResolver::new(BTreeMap::new())),
        config.connect_timeout(),
        config.read_timeout(),
    ));
    Engine::from_config(config, provider, Arc::new(LiveInstanceSet::new())).unwrap()
}

fn request(task_type: TaskType, queue_enabled: bool) -> ExecutionRequest {
    let req: ExecutionRequest = serde_yaml::from_str(REQUEST).unwrap();
    req.for_task_type(task_type, queue_enabled).unwrap()
}

#[test]
fn plain_task_compiles_to_one_batch_job() {
    let config = EngineConfig::default();
    let manifests = engine(&config).compile(&request(TaskType::K8s, false)).unwrap();

    assert_eq!(manifests.len(), 1);
    let m = &manifests[0];
    assert_eq!(m.kind, WorkloadKind::Plain);
    assert_eq!(m.name, "trainmodel-42");
    assert_eq!(m.object["apiVersion"], "batch/v1");
    assert_eq!(m.object["metadata"]["namespace"], "ml");
}

#[test]
fn queue_feature_routes_tasks_through_volcano() {
    let config = EngineConfig {
        queue_enabled: true,
        ..Default::default()
    };
    let manifests = engine(&config).compile(&request(TaskType::K8s, true)).unwrap();

    let m = &manifests[0];
    assert_eq!(m.kind, WorkloadKind::QueueAdmitted);
    assert_eq!(m.object["kind"], "Job");
    assert_eq!(m.object["spec"]["schedulerName"], "volcano");
    assert_eq!(m.object["spec"]["queue"], "default");
}

#[test]
fn dataset_tasks_fan_out_one_job_per_fetch() {
    let config = EngineConfig::default();
    let manifests = engine(&config)
        .compile(&request(TaskType::DataSetK8s, false))
        .unwrap();

    let names: Vec<_> = manifests.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["trainmodel-42-0", "trainmodel-42-1"]);
    assert_eq!(manifests[1].index, Some(1));
}
