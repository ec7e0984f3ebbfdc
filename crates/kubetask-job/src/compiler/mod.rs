//! ManifestCompiler: ExecutionRequest → CompiledManifest
//!
//! Pure compilation with no cluster access. Plain jobs are built from typed
//! k8s-openapi values, queue-admitted jobs go through the Volcano builder and
//! operator kinds overlay a template copy from the injected registry.

mod operator;
mod pod;

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kubetask_common::{
    ClusterTarget, CrdKind, CrdRegistry, EngineConfig, LAYER_LABEL, LAYER_LABEL_VALUE, NAME_LABEL,
    TASK_APP_LABEL,
};
use kubetask_volcano::{compile_vcjob, TaskInput, VCJobInput};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{JobError, Result};
use crate::request::{ExecutionRequest, MasterWorker, WorkloadKind, WorkloadSpec};
use crate::template::{TemplateName, TemplateRegistry};

pub use operator::{FLINK_CONTAINER, PYTORCH_CONTAINER, SPARK_DRIVER_CONTAINER};
pub use pod::{
    env_vars, node_affinity, resource_requirements, FETCH_CONTAINER, FETCH_MOUNT_PATH,
    TASK_INSTANCE_ID_ENV,
};

use pod::PodBlueprint;

const RESTART_NEVER: &str = "Never";

/// Deterministic resource name: `lower(taskName)-taskInstanceId[-index]`.
/// Underscores are dropped since they are not valid in resource names.
pub fn derived_name(task_name: &str, task_instance_id: i64, index: Option<usize>) -> String {
    let base = task_name.to_lowercase().replace('_', "");
    match index {
        Some(i) => format!("{}-{}-{}", base, task_instance_id, i),
        None => format!("{}-{}", base, task_instance_id),
    }
}

/// A rendered workload, ready to submit
#[derive(Clone, Debug, PartialEq)]
pub struct CompiledManifest {
    pub kind: WorkloadKind,
    pub name: String,
    pub namespace: String,
    /// Container whose log is relayed
    pub container_name: String,
    pub target: ClusterTarget,
    pub task_instance_id: i64,
    /// Fan-out item index
    pub index: Option<usize>,
    pub object: Value,
}

impl CompiledManifest {
    pub fn crd_kind(&self) -> CrdKind {
        self.kind.crd_kind()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.object)
            .map_err(|e| JobError::Common(kubetask_common::Error::from(e)))
    }
}

/// Identity stamped on every compiled object
pub(crate) struct Identity {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub pod_labels: BTreeMap<String, String>,
}

impl Identity {
    fn new(req: &ExecutionRequest, name: &str) -> Self {
        let mut labels = req.labels.clone();
        labels.insert(LAYER_LABEL.to_string(), LAYER_LABEL_VALUE.to_string());
        labels.insert(NAME_LABEL.to_string(), name.to_string());

        let mut pod_labels = labels.clone();
        if !req.task_app_id.is_empty() {
            pod_labels.insert(TASK_APP_LABEL.to_string(), req.task_app_id.clone());
        }
        Self {
            name: name.to_string(),
            namespace: req.namespace.clone(),
            labels,
            pod_labels,
        }
    }
}

/// Compiles requests using a shared, read-only template registry
#[derive(Clone)]
pub struct ManifestCompiler {
    templates: Arc<TemplateRegistry>,
    crds: Arc<CrdRegistry>,
    fetch_image: String,
    image_pull_secret: String,
    default_gpu_type: String,
}

impl ManifestCompiler {
    pub fn new(
        templates: Arc<TemplateRegistry>,
        crds: Arc<CrdRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            templates,
            crds,
            fetch_image: config.fetch_image.clone(),
            image_pull_secret: config.image_pull_secret.clone(),
            default_gpu_type: config.default_gpu_type.clone(),
        }
    }

    /// Compile one manifest. `index` selects a fan-out item.
    pub fn compile(&self, req: &ExecutionRequest, index: Option<usize>) -> Result<CompiledManifest> {
        req.resources.validate()?;
        let name = derived_name(&req.task_name, req.task_instance_id, index);
        let id = Identity::new(req, &name);
        let kind = req.kind();

        let container_name = match kind {
            WorkloadKind::Plain | WorkloadKind::QueueAdmitted => name.clone(),
            WorkloadKind::FlinkOperator => FLINK_CONTAINER.to_string(),
            WorkloadKind::SparkOperator => SPARK_DRIVER_CONTAINER.to_string(),
            WorkloadKind::PyTorchOperator => PYTORCH_CONTAINER.to_string(),
        };
        let bp = PodBlueprint {
            req,
            index,
            container_name: &container_name,
            fetch_image: &self.fetch_image,
            default_gpu_type: &self.default_gpu_type,
        };

        let mut object = match &req.workload {
            WorkloadSpec::Plain => self.plain_job(&bp, &id)?,
            WorkloadSpec::QueueAdmitted { replicas } => self.queue_job(&bp, &id, *replicas)?,
            WorkloadSpec::FlinkOperator(params) => operator::render_flink(
                &bp,
                &id,
                params,
                self.templates.instantiate(TemplateName::FlinkDeployment)?,
            )?,
            WorkloadSpec::SparkOperator(params) => operator::render_spark(
                &bp,
                &id,
                params,
                self.templates.instantiate(TemplateName::SparkApplication)?,
            )?,
            WorkloadSpec::PyTorchOperator(params) => operator::render_pytorch(
                &bp,
                &id,
                params,
                self.templates.instantiate(TemplateName::PyTorchJob)?,
            )?,
        };

        let ar = self.crds.resolve(kind.crd_kind());
        object["apiVersion"] = json!(ar.api_version);
        object["kind"] = json!(ar.kind);

        debug!(job = %name, kind = ?kind, "Compiled manifest");
        Ok(CompiledManifest {
            kind,
            name,
            namespace: req.namespace.clone(),
            container_name,
            target: req.cluster_target(),
            task_instance_id: req.task_instance_id,
            index,
            object,
        })
    }

    /// Every manifest a request needs: one per fetch spec in fan-out mode
    pub fn compile_all(&self, req: &ExecutionRequest) -> Result<Vec<CompiledManifest>> {
        if req.multiple {
            (0..req.fetches.len())
                .map(|i| self.compile(req, Some(i)))
                .collect()
        } else {
            Ok(vec![self.compile(req, None)?])
        }
    }

    fn plain_job(&self, bp: &PodBlueprint<'_>, id: &Identity) -> Result<Value> {
        let spec = PodSpec {
            restart_policy: Some(RESTART_NEVER.to_string()),
            ..bp.pod_spec()?
        };
        let job = Job {
            metadata: ObjectMeta {
                name: Some(id.name.clone()),
                namespace: Some(id.namespace.clone()),
                labels: Some(id.labels.clone()),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(id.pod_labels.clone()),
                        ..Default::default()
                    }),
                    spec: Some(spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        Ok(serde_json::to_value(&job)?)
    }

    fn queue_job(
        &self,
        bp: &PodBlueprint<'_>,
        id: &Identity,
        replicas: Option<MasterWorker>,
    ) -> Result<Value> {
        let spec = PodSpec {
            restart_policy: Some(RESTART_NEVER.to_string()),
            ..bp.pod_spec()?
        };
        let mut spec = serde_json::to_value(&spec)?;
        spec["imagePullSecrets"] = json!([{ "name": self.image_pull_secret }]);
        let template = json!({
            "metadata": { "labels": id.pod_labels },
            "spec": spec,
        });

        let (template_name, tasks) = match replicas {
            Some(mw) => (
                TemplateName::PyTorchQueueJob,
                vec![
                    task_input("master", mw.master, template.clone()),
                    task_input("worker", mw.worker, template),
                ],
            ),
            None => (TemplateName::QueueJob, vec![task_input("main", 1, template)]),
        };

        let vcjob = compile_vcjob(
            self.templates.vcjob(template_name)?,
            VCJobInput {
                name: id.name.clone(),
                namespace: id.namespace.clone(),
                labels: id.labels.clone(),
                queue: bp.req.queue.clone(),
                tasks,
            },
        );
        Ok(serde_json::to_value(&vcjob)?)
    }
}

fn task_input(name: &str, replicas: u32, template: Value) -> TaskInput {
    TaskInput {
        name: name.to_string(),
        replicas,
        template,
    }
}
