//! Overlays for operator-managed workloads
//!
//! Each renderer starts from a template copy and writes only identity,
//! image, environment, replica counts and resource footprints. Everything
//! else stays as authored.

use serde_json::{json, Map, Value};

use super::pod::{env_vars, parse_list, PodBlueprint, DEFAULT_PULL_POLICY};
use super::Identity;
use crate::error::{JobError, Result};
use crate::request::{FlinkParams, PyTorchParams, SparkParams};
use crate::template::TemplateName;

pub const FLINK_CONTAINER: &str = "flink-main-container";
pub const SPARK_DRIVER_CONTAINER: &str = "spark-kubernetes-driver";
pub const PYTORCH_CONTAINER: &str = "pytorch";

pub(crate) fn render_flink(
    bp: &PodBlueprint<'_>,
    id: &Identity,
    params: &FlinkParams,
    mut obj: Value,
) -> Result<Value> {
    apply_identity(&mut obj, id);
    let spec = at_mut(&mut obj, &["spec"]);
    spec["image"] = json!(bp.req.image);
    spec["imagePullPolicy"] = json!(pull_policy(bp));

    *at_mut(spec, &["podTemplate", "metadata", "labels"]) = json!(id.pod_labels);
    let container = first_container_mut(
        spec,
        &["podTemplate", "spec", "containers"],
        TemplateName::FlinkDeployment,
    )?;
    container.insert("env".to_string(), serde_json::to_value(env_vars(bp.req))?);

    if let Some(parallelism) = params.parallelism {
        *at_mut(spec, &["job", "parallelism"]) = json!(parallelism);
    }
    if let Some(slots) = params.slots {
        *at_mut(spec, &["flinkConfiguration", "taskmanager.numberOfTaskSlots"]) =
            json!(slots.to_string());
    }
    if let Some(class) = &params.main_class {
        *at_mut(spec, &["job", "entryClass"]) = json!(class);
    }
    if let Some(memory) = &params.job_manager_memory {
        *at_mut(spec, &["jobManager", "resource", "memory"]) = json!(memory);
    }
    if let Some(memory) = &params.task_manager_memory {
        *at_mut(spec, &["taskManager", "resource", "memory"]) = json!(memory);
    }
    Ok(obj)
}

pub(crate) fn render_spark(
    bp: &PodBlueprint<'_>,
    id: &Identity,
    params: &SparkParams,
    mut obj: Value,
) -> Result<Value> {
    apply_identity(&mut obj, id);
    let arguments = parse_list("args", &bp.req.args)?;
    let env = serde_json::to_value(env_vars(bp.req))?;

    let spec = at_mut(&mut obj, &["spec"]);
    if !bp.req.image.trim().is_empty() {
        spec["image"] = json!(bp.req.image);
    }
    spec["imagePullPolicy"] = json!(pull_policy(bp));
    set_opt(spec, &["type"], &params.program_type);
    set_opt(spec, &["mainClass"], &params.main_class);
    set_opt(spec, &["mainApplicationFile"], &params.main_application_file);
    set_opt(spec, &["sparkVersion"], &params.spark_version);
    if !arguments.is_empty() {
        spec["arguments"] = json!(arguments);
    }

    for role in ["driver", "executor"] {
        let labels = at_mut(spec, &[role, "labels"]);
        merge_labels(labels, id);
        spec[role]["env"] = env.clone();
    }
    set_opt(spec, &["driver", "cores"], &params.driver_cores);
    set_opt(spec, &["driver", "memory"], &params.driver_memory);
    set_opt(spec, &["driver", "serviceAccount"], &params.service_account);
    set_opt(spec, &["executor", "instances"], &params.num_executors);
    set_opt(spec, &["executor", "cores"], &params.executor_cores);
    set_opt(spec, &["executor", "memory"], &params.executor_memory);
    Ok(obj)
}

pub(crate) fn render_pytorch(
    bp: &PodBlueprint<'_>,
    id: &Identity,
    params: &PyTorchParams,
    mut obj: Value,
) -> Result<Value> {
    apply_identity(&mut obj, id);
    let roles = [
        ("Master", params.master_replicas, &params.master_resources),
        ("Worker", params.worker_replicas, &params.worker_resources),
    ];

    for (role, replicas, resources) in roles {
        let replica_specs = at_mut(&mut obj, &["spec", "pytorchReplicaSpecs"]);
        if replicas == 0 {
            if let Some(specs) = replica_specs.as_object_mut() {
                specs.remove(role);
            }
            continue;
        }
        let role_spec = at_mut(replica_specs, &[role]);
        role_spec["replicas"] = json!(replicas);
        *at_mut(role_spec, &["template", "metadata", "labels"]) = json!(id.pod_labels);

        let envelope = resources.as_ref().unwrap_or(&bp.req.resources);
        let overlay = serde_json::to_value(bp.main_container(PYTORCH_CONTAINER, envelope)?)?;
        let container = first_container_mut(
            role_spec,
            &["template", "spec", "containers"],
            TemplateName::PyTorchJob,
        )?;
        if let Value::Object(fields) = overlay {
            container.extend(fields);
        }
    }
    Ok(obj)
}

fn apply_identity(obj: &mut Value, id: &Identity) {
    let metadata = at_mut(obj, &["metadata"]);
    metadata["name"] = json!(id.name);
    metadata["namespace"] = json!(id.namespace);
    merge_labels(at_mut(metadata, &["labels"]), id);
}

fn merge_labels(labels: &mut Value, id: &Identity) {
    if !labels.is_object() {
        *labels = Value::Object(Map::new());
    }
    for (k, v) in &id.labels {
        labels[k.as_str()] = json!(v);
    }
}

fn pull_policy<'a>(bp: &'a PodBlueprint<'_>) -> &'a str {
    bp.req
        .image_pull_policy
        .as_deref()
        .unwrap_or(DEFAULT_PULL_POLICY)
}

fn set_opt<T: serde::Serialize>(spec: &mut Value, path: &[&str], value: &Option<T>) {
    if let Some(v) = value {
        *at_mut(spec, path) = json!(v);
    }
}

/// Walk `path`, turning anything that is not an object into one
fn at_mut<'a>(value: &'a mut Value, path: &[&str]) -> &'a mut Value {
    let mut cur = value;
    for key in path {
        if !cur.is_object() {
            *cur = Value::Object(Map::new());
        }
        cur = &mut cur[*key];
    }
    cur
}

fn first_container_mut<'a>(
    value: &'a mut Value,
    path: &[&str],
    template: TemplateName,
) -> Result<&'a mut Map<String, Value>> {
    at_mut(value, path)
        .as_array_mut()
        .and_then(|containers| containers.first_mut())
        .and_then(Value::as_object_mut)
        .ok_or_else(|| JobError::Template {
            name: template.to_string(),
            message: format!("no container at {}", path.join(".")),
        })
}
