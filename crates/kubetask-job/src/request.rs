//! Execution requests
//!
//! An [`ExecutionRequest`] is the cluster-agnostic description of one task
//! attempt. It is immutable once handed to the compiler.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use kubetask_common::{ClusterTarget, CrdKind, TaskType};
use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

/// Workload shape the compiler renders
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WorkloadKind {
    Plain,
    QueueAdmitted,
    FlinkOperator,
    SparkOperator,
    PyTorchOperator,
}

impl WorkloadKind {
    /// Resource coordinates backing this kind
    pub fn crd_kind(&self) -> CrdKind {
        match self {
            Self::Plain => CrdKind::BatchJob,
            Self::QueueAdmitted => CrdKind::VolcanoJob,
            Self::FlinkOperator => CrdKind::FlinkDeployment,
            Self::SparkOperator => CrdKind::SparkApplication,
            Self::PyTorchOperator => CrdKind::PyTorchJob,
        }
    }
}

/// Master/worker replica split for distributed training
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterWorker {
    pub master: u32,
    pub worker: u32,
}

/// Flink operator parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlinkParams {
    /// API server reached without credentials
    pub master_url: Option<String>,
    pub parallelism: Option<u32>,
    pub slots: Option<u32>,
    pub main_class: Option<String>,
    pub job_manager_memory: Option<String>,
    pub task_manager_memory: Option<String>,
}

/// Spark operator parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SparkParams {
    /// API server reached without credentials
    pub master_url: Option<String>,
    pub program_type: Option<String>,
    pub main_class: Option<String>,
    pub main_application_file: Option<String>,
    pub spark_version: Option<String>,
    pub service_account: Option<String>,
    pub driver_cores: Option<u32>,
    pub driver_memory: Option<String>,
    pub num_executors: Option<u32>,
    pub executor_cores: Option<u32>,
    pub executor_memory: Option<String>,
}

/// PyTorch training parameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PyTorchParams {
    pub master_replicas: u32,
    pub worker_replicas: u32,
    /// Master footprint; falls back to the request envelope
    pub master_resources: Option<ResourceEnvelope>,
    /// Worker footprint; falls back to the request envelope
    pub worker_resources: Option<ResourceEnvelope>,
}

impl Default for PyTorchParams {
    fn default() -> Self {
        Self {
            master_replicas: 1,
            worker_replicas: 1,
            master_resources: None,
            worker_resources: None,
        }
    }
}

/// Kind discriminant plus the parameters only that kind uses
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkloadSpec {
    #[default]
    Plain,
    QueueAdmitted {
        /// Renders master/worker tasks instead of a single `main` task
        #[serde(default, skip_serializing_if = "Option::is_none")]
        replicas: Option<MasterWorker>,
    },
    FlinkOperator(FlinkParams),
    SparkOperator(SparkParams),
    PyTorchOperator(PyTorchParams),
}

impl WorkloadSpec {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Self::Plain => WorkloadKind::Plain,
            Self::QueueAdmitted { .. } => WorkloadKind::QueueAdmitted,
            Self::FlinkOperator(_) => WorkloadKind::FlinkOperator,
            Self::SparkOperator(_) => WorkloadKind::SparkOperator,
            Self::PyTorchOperator(_) => WorkloadKind::PyTorchOperator,
        }
    }

    fn master_url(&self) -> Option<&str> {
        let url = match self {
            Self::FlinkOperator(p) => p.master_url.as_deref(),
            Self::SparkOperator(p) => p.master_url.as_deref(),
            _ => None,
        };
        url.filter(|u| !u.trim().is_empty())
    }
}

/// CPU/memory minimums and optional GPU
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceEnvelope {
    /// CPU cores requested
    pub min_cpu: f64,
    /// Memory requested, in Mi
    pub min_memory: f64,
    /// GPU count; anything > 0 switches to GPU-only limits
    pub gpu: Option<f64>,
    /// GPU resource key, e.g. `nvidia.com/gpu`
    pub gpu_type: Option<String>,
}

impl Default for ResourceEnvelope {
    fn default() -> Self {
        Self {
            min_cpu: 1.0,
            min_memory: 1024.0,
            gpu: None,
            gpu_type: None,
        }
    }
}

impl ResourceEnvelope {
    /// Minimums must be finite and non-negative. GPU may be zero or negative
    /// (meaning no GPU) but not infinite.
    pub fn validate(&self) -> Result<()> {
        for (field, v) in [("minCpu", self.min_cpu), ("minMemory", self.min_memory)] {
            if !v.is_finite() || v < 0.0 {
                return Err(JobError::InvalidRequest(format!(
                    "{} must be a non-negative number, got {}",
                    field, v
                )));
            }
        }
        if let Some(gpu) = self.gpu.filter(|g| !g.is_finite()) {
            return Err(JobError::InvalidRequest(format!("gpu must be finite, got {}", gpu)));
        }
        Ok(())
    }

    /// GPU quantity when the GPU policy applies
    pub fn gpu_quantity(&self) -> Option<f64> {
        self.gpu.filter(|g| *g > 0.0)
    }
}

/// Host directories exposed to the task container
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VolumeWiring {
    /// Host input directory; no input mount when unset
    pub input_host_path: Option<String>,
    /// Host output directory root
    pub output_host_path: String,
    /// Mount point of the input directory
    pub pod_input_path: String,
    /// Mount point of the output directory
    pub pod_output_path: String,
}

impl Default for VolumeWiring {
    fn default() -> Self {
        Self {
            input_host_path: None,
            output_host_path: "/var/lib/kubetask/output".to_string(),
            pod_input_path: "/data/input".to_string(),
            pod_output_path: "/data/output".to_string(),
        }
    }
}

/// Remote data to pull before the task container starts
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FetchSpec {
    pub dir_id: Option<i64>,
    pub fetch_id: Option<i64>,
    /// Human name reported in batch results
    pub fetch_name: String,
    /// Source kind understood by the fetch image
    pub fetch_type: String,
    /// Host directory root receiving the data
    pub host_path: String,
    /// Flow-sequence argument list for the fetch image
    pub args: String,
}

/// Scheduler timeout strategy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutStrategy {
    #[default]
    None,
    Warn,
    Failed,
    #[serde(rename = "WARNFAILED")]
    WarnFailed,
}

/// How long the watcher may wait for a terminal status
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutPolicy {
    pub strategy: TimeoutStrategy,
    /// Timeout in seconds
    pub seconds: u64,
}

impl TimeoutPolicy {
    /// Bounded wait, only for strategies that fail on timeout
    pub fn bound(&self) -> Option<Duration> {
        match self.strategy {
            TimeoutStrategy::Failed | TimeoutStrategy::WarnFailed if self.seconds > 0 => {
                Some(Duration::from_secs(self.seconds))
            }
            _ => None,
        }
    }
}

/// One task attempt to run on a cluster
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub task_name: String,
    pub task_instance_id: i64,
    /// Stable task definition code
    #[serde(default)]
    pub task_code: i64,
    #[serde(default)]
    pub task_app_id: String,
    #[serde(default)]
    pub process_instance_id: i64,
    pub image: String,
    #[serde(default)]
    pub image_pull_policy: Option<String>,
    /// Flow-sequence string, e.g. `["python", "main.py"]`
    #[serde(default)]
    pub command: String,
    /// Flow-sequence string
    #[serde(default)]
    pub args: String,
    pub namespace: String,
    /// Opaque cluster identifier resolved to a kubeconfig
    pub cluster: String,
    #[serde(default)]
    pub resources: ResourceEnvelope,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub node_selectors: Vec<NodeSelectorRequirement>,
    #[serde(default)]
    pub volumes: VolumeWiring,
    #[serde(default)]
    pub fetches: Vec<FetchSpec>,
    /// Fan out one sub-job per fetch spec
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub workload: WorkloadSpec,
    #[serde(default)]
    pub timeout: TimeoutPolicy,
    /// Scheduler log file for this attempt
    #[serde(default)]
    pub log_path: Option<String>,
}

impl ExecutionRequest {
    pub fn kind(&self) -> WorkloadKind {
        self.workload.kind()
    }

    /// Endpoint this request runs against. Flink and Spark go to their
    /// master URL without credentials when one is given.
    pub fn cluster_target(&self) -> ClusterTarget {
        match self.workload.master_url() {
            Some(url) => ClusterTarget::MasterUrl(url.to_string()),
            None => ClusterTarget::cluster(self.cluster.clone()),
        }
    }

    /// Number of sub-jobs this request compiles to
    pub fn item_count(&self) -> usize {
        if self.multiple {
            self.fetches.len()
        } else {
            1
        }
    }

    /// Choose the workload shape for a scheduler task type.
    ///
    /// Operator task types must already carry their operator parameters;
    /// the others are derived from the queue flag.
    pub fn for_task_type(mut self, task_type: TaskType, queue_enabled: bool) -> Result<Self> {
        self.workload = match task_type {
            TaskType::K8s | TaskType::DataSetK8s => {
                if queue_enabled {
                    WorkloadSpec::QueueAdmitted { replicas: None }
                } else {
                    WorkloadSpec::Plain
                }
            }
            TaskType::PyTorchK8s => {
                let params = match self.workload {
                    WorkloadSpec::PyTorchOperator(p) => p,
                    _ => PyTorchParams::default(),
                };
                if queue_enabled {
                    WorkloadSpec::QueueAdmitted {
                        replicas: Some(MasterWorker {
                            master: params.master_replicas,
                            worker: params.worker_replicas,
                        }),
                    }
                } else {
                    WorkloadSpec::PyTorchOperator(params)
                }
            }
            TaskType::FlinkK8sOperator => match self.workload {
                w @ WorkloadSpec::FlinkOperator(_) => w,
                _ => WorkloadSpec::FlinkOperator(FlinkParams::default()),
            },
            TaskType::SparkK8sOperator => match self.workload {
                w @ WorkloadSpec::SparkOperator(_) => w,
                _ => WorkloadSpec::SparkOperator(SparkParams::default()),
            },
            TaskType::PyTorchK8sOperator => match self.workload {
                w @ WorkloadSpec::PyTorchOperator(_) => w,
                _ => WorkloadSpec::PyTorchOperator(PyTorchParams::default()),
            },
        };
        self.multiple = task_type == TaskType::DataSetK8s;
        self.validate()?;
        Ok(self)
    }

    /// Structural checks that do not need the compiler
    pub fn validate(&self) -> Result<()> {
        if self.task_name.trim().is_empty() {
            return Err(JobError::InvalidRequest("task name is empty".to_string()));
        }
        if self.image.trim().is_empty() && !matches!(self.workload, WorkloadSpec::SparkOperator(_))
        {
            return Err(JobError::InvalidRequest("image is empty".to_string()));
        }
        self.resources.validate()?;
        if self.multiple && self.fetches.is_empty() {
            return Err(JobError::InvalidRequest(
                "fan-out requires at least one fetch spec".to_string(),
            ));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::{fetch, request};
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::none(TimeoutStrategy::None, None)]
    #[case::warn(TimeoutStrategy::Warn, None)]
    #[case::failed(TimeoutStrategy::Failed, Some(Duration::from_secs(30)))]
    #[case::warn_failed(TimeoutStrategy::WarnFailed, Some(Duration::from_secs(30)))]
    fn timeout_bound(#[case] strategy: TimeoutStrategy, #[case] expected: Option<Duration>) {
        let policy = TimeoutPolicy {
            strategy,
            seconds: 30,
        };
        assert_eq!(policy.bound(), expected);
    }

    #[test]
    fn master_url_selects_unauthenticated_target() {
        let mut req = request();
        req.workload = WorkloadSpec::FlinkOperator(FlinkParams {
            master_url: Some("https://flink-master:6443".to_string()),
            ..Default::default()
        });
        assert_eq!(
            req.cluster_target(),
            ClusterTarget::MasterUrl("https://flink-master:6443".to_string())
        );

        req.workload = WorkloadSpec::Plain;
        assert_eq!(req.cluster_target(), ClusterTarget::cluster("prod"));
    }

    #[rstest]
    #[case::k8s_queue(TaskType::K8s, true, WorkloadKind::QueueAdmitted)]
    #[case::k8s_plain(TaskType::K8s, false, WorkloadKind::Plain)]
    #[case::pytorch_queue(TaskType::PyTorchK8s, true, WorkloadKind::QueueAdmitted)]
    #[case::pytorch_operator(TaskType::PyTorchK8s, false, WorkloadKind::PyTorchOperator)]
    #[case::flink(TaskType::FlinkK8sOperator, true, WorkloadKind::FlinkOperator)]
    #[case::spark(TaskType::SparkK8sOperator, false, WorkloadKind::SparkOperator)]
    fn task_type_selects_workload(
        #[case] task_type: TaskType,
        #[case] queue_enabled: bool,
        #[case] expected: WorkloadKind,
    ) {
        let req = request().for_task_type(task_type, queue_enabled).unwrap();
        assert_eq!(req.kind(), expected);
        assert!(!req.multiple);
    }

    #[test]
    fn dataset_type_fans_out() {
        let mut req = request();
        req.fetches = vec![fetch("a"), fetch("b")];
        let req = req.for_task_type(TaskType::DataSetK8s, true).unwrap();
        assert!(req.multiple);
        assert_eq!(req.item_count(), 2);
        assert_eq!(req.kind(), WorkloadKind::QueueAdmitted);
    }

    #[test]
    fn dataset_without_fetches_is_rejected() {
        let err = request()
            .for_task_type(TaskType::DataSetK8s, false)
            .unwrap_err();
        assert!(matches!(err, JobError::InvalidRequest(_)));
    }

    #[test]
    fn workload_spec_is_tagged_by_kind() {
        let spec: WorkloadSpec = serde_json::from_value(serde_json::json!({
            "kind": "sparkOperator",
            "mainClass": "org.example.Main",
            "numExecutors": 4
        }))
        .unwrap();
        match spec {
            WorkloadSpec::SparkOperator(p) => {
                assert_eq!(p.main_class.as_deref(), Some("org.example.Main"));
                assert_eq!(p.num_executors, Some(4));
            }
            other => panic!("unexpected spec {:?}", other),
        }
    }

    #[rstest]
    #[case::negative_cpu(-0.5, 512.0, None)]
    #[case::negative_memory(1.0, -1.0, None)]
    #[case::infinite_cpu(f64::INFINITY, 512.0, None)]
    #[case::nan_memory(1.0, f64::NAN, None)]
    #[case::infinite_gpu(1.0, 512.0, Some(f64::INFINITY))]
    fn unusable_resource_quantities_are_rejected(
        #[case] min_cpu: f64,
        #[case] min_memory: f64,
        #[case] gpu: Option<f64>,
    ) {
        let mut req = request();
        req.resources = ResourceEnvelope {
            min_cpu,
            min_memory,
            gpu,
            gpu_type: None,
        };
        assert!(matches!(req.validate(), Err(JobError::InvalidRequest(_))));
    }

    #[test]
    fn zero_gpu_is_not_a_gpu_request() {
        let mut req = request();
        req.resources.gpu = Some(0.0);
        assert!(req.validate().is_ok());
        assert!(req.resources.gpu_quantity().is_none());
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let req: ExecutionRequest = serde_json::from_value(serde_json::json!({
            "taskName": "etl",
            "taskInstanceId": 5,
            "image": "busybox",
            "namespace": "default",
            "cluster": "local"
        }))
        .unwrap();
        assert_eq!(req.kind(), WorkloadKind::Plain);
        assert_eq!(req.resources.min_cpu, 1.0);
        assert_eq!(req.volumes.pod_output_path, "/data/output");
        assert!(req.timeout.bound().is_none());
    }
}
