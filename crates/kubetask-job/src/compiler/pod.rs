//! Pod-level building blocks shared by every workload kind
//!
//! Resources, environment, volumes, the data-fetch init container and node
//! affinity are produced as typed k8s-openapi values and only turned into
//! JSON by the kind-specific renderers.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, EnvVar, HostPathVolumeSource, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PodSpec, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kubetask_common::yaml::parse_flow_list;

use crate::error::{JobError, Result};
use crate::request::{ExecutionRequest, FetchSpec, ResourceEnvelope};

/// Environment variable carrying the task instance id
pub const TASK_INSTANCE_ID_ENV: &str = "TASK_INSTANCE_ID";

pub const INPUT_VOLUME: &str = "input-data";
pub const OUTPUT_VOLUME: &str = "output-data";
pub const FETCH_VOLUME: &str = "fetch-data";
pub const FETCH_CONTAINER: &str = "fetch-init";
pub const FETCH_MOUNT_PATH: &str = "/app/downloads";
pub const DEFAULT_PULL_POLICY: &str = "IfNotPresent";

const HOST_PATH_TYPE: &str = "DirectoryOrCreate";
const PARSE_FAILED: &str = "Parse yaml-like commands and args failed";

/// Inputs for one compiled pod
pub(crate) struct PodBlueprint<'a> {
    pub req: &'a ExecutionRequest,
    pub index: Option<usize>,
    pub container_name: &'a str,
    pub fetch_image: &'a str,
    pub default_gpu_type: &'a str,
}

impl PodBlueprint<'_> {
    /// `<taskInstanceId>` or `<taskInstanceId>/<index>`
    fn instance_suffix(&self) -> String {
        match self.index {
            Some(i) => format!("{}/{}", self.req.task_instance_id, i),
            None => self.req.task_instance_id.to_string(),
        }
    }

    /// Fetch spec for this pod: the item's own in fan-out, else the first
    pub fn fetch(&self) -> Result<Option<&FetchSpec>> {
        match (self.req.multiple, self.index) {
            (true, Some(i)) => self
                .req
                .fetches
                .get(i)
                .map(Some)
                .ok_or(JobError::MissingFetchSpec { index: i }),
            _ => Ok(self.req.fetches.first()),
        }
    }

    pub fn input_host_path(&self) -> Option<String> {
        let base = self.req.volumes.input_host_path.as_deref()?;
        if self.req.fetches.is_empty() {
            Some(base.to_string())
        } else {
            Some(join_host_path(base, &self.instance_suffix()))
        }
    }

    pub fn output_host_path(&self) -> String {
        join_host_path(&self.req.volumes.output_host_path, &self.instance_suffix())
    }

    /// Pod spec with the main container, fetch init container, volumes and
    /// node affinity. Kind-specific fields are left to the caller.
    pub fn pod_spec(&self) -> Result<PodSpec> {
        let mut volumes = Vec::new();
        let mut mounts = Vec::new();

        if let Some(path) = self.input_host_path() {
            volumes.push(host_path_volume(INPUT_VOLUME, path));
            mounts.push(mount(INPUT_VOLUME, &self.req.volumes.pod_input_path));
        }
        volumes.push(host_path_volume(OUTPUT_VOLUME, self.output_host_path()));
        mounts.push(mount(OUTPUT_VOLUME, &self.req.volumes.pod_output_path));

        let init_containers = match self.fetch()? {
            Some(fetch) => {
                let host = join_host_path(&fetch.host_path, &self.instance_suffix());
                volumes.push(host_path_volume(FETCH_VOLUME, host));
                Some(vec![fetch_init_container(self.fetch_image, fetch)?])
            }
            None => None,
        };

        let container = Container {
            volume_mounts: Some(mounts),
            ..self.main_container(self.container_name, &self.req.resources)?
        };

        Ok(PodSpec {
            containers: vec![container],
            init_containers,
            volumes: Some(volumes),
            affinity: node_affinity(&self.req.node_selectors),
            ..Default::default()
        })
    }

    /// Task container without volume mounts
    pub fn main_container(&self, name: &str, resources: &ResourceEnvelope) -> Result<Container> {
        let command = parse_list("command", &self.req.command)?;
        let args = parse_list("args", &self.req.args)?;
        Ok(Container {
            name: name.to_string(),
            image: Some(self.req.image.clone()),
            image_pull_policy: Some(
                self.req
                    .image_pull_policy
                    .clone()
                    .unwrap_or_else(|| DEFAULT_PULL_POLICY.to_string()),
            ),
            command: non_empty(command),
            args: non_empty(args),
            env: Some(env_vars(self.req)),
            resources: Some(resource_requirements(resources, self.default_gpu_type)),
            ..Default::default()
        })
    }
}

/// Apply the resource policy: GPU-only limits, or cpu/memory requests with
/// limits at twice the request.
pub fn resource_requirements(env: &ResourceEnvelope, default_gpu_type: &str) -> ResourceRequirements {
    if let Some(gpu) = env.gpu_quantity() {
        let key = env
            .gpu_type
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(default_gpu_type);
        return ResourceRequirements {
            limits: Some(BTreeMap::from([(key.to_string(), Quantity(quantity(gpu)))])),
            ..Default::default()
        };
    }

    let cpu_memory = |factor: f64| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(quantity(env.min_cpu * factor))),
            (
                "memory".to_string(),
                Quantity(format!("{}Mi", quantity(env.min_memory * factor))),
            ),
        ])
    };
    ResourceRequirements {
        requests: Some(cpu_memory(1.0)),
        limits: Some(cpu_memory(2.0)),
        ..Default::default()
    }
}

/// `TASK_INSTANCE_ID` first, then the request's environment in key order
pub fn env_vars(req: &ExecutionRequest) -> Vec<EnvVar> {
    std::iter::once(env_var(TASK_INSTANCE_ID_ENV, &req.task_instance_id.to_string()))
        .chain(req.env.iter().map(|(k, v)| env_var(k, v)))
        .collect()
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Required node affinity with one term, or nothing when no expressions
pub fn node_affinity(expressions: &[NodeSelectorRequirement]) -> Option<Affinity> {
    if expressions.is_empty() {
        return None;
    }
    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(expressions.to_vec()),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn fetch_init_container(image: &str, fetch: &FetchSpec) -> Result<Container> {
    let args = parse_list("fetch args", &fetch.args)?;
    let footprint = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    Ok(Container {
        name: FETCH_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some(DEFAULT_PULL_POLICY.to_string()),
        args: non_empty(args),
        resources: Some(ResourceRequirements {
            requests: Some(footprint("1", "1024Mi")),
            limits: Some(footprint("2", "2048Mi")),
            ..Default::default()
        }),
        volume_mounts: Some(vec![mount(FETCH_VOLUME, FETCH_MOUNT_PATH)]),
        ..Default::default()
    })
}

fn host_path_volume(name: &str, path: String) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path,
            type_: Some(HOST_PATH_TYPE.to_string()),
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub(crate) fn parse_list(field: &str, raw: &str) -> Result<Vec<String>> {
    parse_flow_list(raw).map_err(|e| JobError::parse(field, format!("{}: {}", PARSE_FAILED, e)))
}

fn non_empty(items: Vec<String>) -> Option<Vec<String>> {
    (!items.is_empty()).then_some(items)
}

fn join_host_path(base: &str, suffix: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), suffix)
}

/// Render a quantity without a trailing `.0`
pub(crate) fn quantity(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::fixtures::{fetch, request};
    use rstest::rstest;

    fn blueprint(req: &ExecutionRequest, index: Option<usize>) -> PodBlueprint<'_> {
        PodBlueprint {
            req,
            index,
            container_name: "train-42",
            fetch_image: "fetch:1",
            default_gpu_type: "nvidia.com/gpu",
        }
    }

    fn parse_cpu(q: &Quantity) -> f64 {
        q.0.parse().unwrap()
    }

    fn parse_mi(q: &Quantity) -> f64 {
        q.0.trim_end_matches("Mi").parse().unwrap()
    }

    #[rstest]
    #[case::fractional(0.5, 512.0)]
    #[case::whole(2.0, 4096.0)]
    #[case::odd(1.25, 100.0)]
    fn cpu_memory_limits_are_double(#[case] cpu: f64, #[case] memory: f64) {
        let env = ResourceEnvelope {
            min_cpu: cpu,
            min_memory: memory,
            gpu: Some(0.0),
            gpu_type: None,
        };
        let res = resource_requirements(&env, "nvidia.com/gpu");
        let requests = res.requests.unwrap();
        let limits = res.limits.unwrap();

        assert_eq!(parse_cpu(&requests["cpu"]), cpu);
        assert_eq!(parse_mi(&requests["memory"]), memory);
        assert_eq!(parse_cpu(&limits["cpu"]), 2.0 * parse_cpu(&requests["cpu"]));
        assert_eq!(parse_mi(&limits["memory"]), 2.0 * parse_mi(&requests["memory"]));
    }

    #[rstest]
    #[case::explicit_type(Some("amd.com/gpu"), "amd.com/gpu")]
    #[case::default_type(None, "nvidia.com/gpu")]
    #[case::blank_type(Some(" "), "nvidia.com/gpu")]
    fn gpu_sets_only_gpu_limit(#[case] gpu_type: Option<&str>, #[case] key: &str) {
        let env = ResourceEnvelope {
            min_cpu: 4.0,
            min_memory: 8192.0,
            gpu: Some(2.0),
            gpu_type: gpu_type.map(str::to_string),
        };
        let res = resource_requirements(&env, "nvidia.com/gpu");
        let limits = res.limits.unwrap();
        assert_eq!(limits.len(), 1);
        assert_eq!(limits[key].0, "2");
        assert!(res.requests.map_or(true, |r| r.is_empty()));
    }

    #[test]
    fn task_instance_id_env_comes_first() {
        let env = env_vars(&request());
        assert_eq!(env[0].name, TASK_INSTANCE_ID_ENV);
        assert_eq!(env[0].value.as_deref(), Some("42"));
        assert_eq!(env[1].name, "MODE");
    }

    #[test]
    fn affinity_omitted_without_expressions() {
        assert!(node_affinity(&[]).is_none());

        let expr = NodeSelectorRequirement {
            key: "gpu".to_string(),
            operator: "In".to_string(),
            values: Some(vec!["a100".to_string()]),
        };
        let affinity = node_affinity(&[expr.clone()]).unwrap();
        let terms = affinity
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].match_expressions.as_ref().unwrap()[0], expr);
    }

    #[test]
    fn without_fetches_input_path_is_used_as_is() {
        let req = request();
        let spec = blueprint(&req, None).pod_spec().unwrap();
        let volumes = spec.volumes.unwrap();
        let input = volumes.iter().find(|v| v.name == INPUT_VOLUME).unwrap();
        let output = volumes.iter().find(|v| v.name == OUTPUT_VOLUME).unwrap();
        assert_eq!(input.host_path.as_ref().unwrap().path, "/mnt/input");
        assert_eq!(output.host_path.as_ref().unwrap().path, "/mnt/output/42");
        assert_eq!(
            output.host_path.as_ref().unwrap().type_.as_deref(),
            Some("DirectoryOrCreate")
        );
        assert!(spec.init_containers.is_none());
    }

    #[test]
    fn no_input_mount_without_input_path() {
        let mut req = request();
        req.volumes.input_host_path = None;
        let spec = blueprint(&req, None).pod_spec().unwrap();
        let mounts = spec.containers[0].volume_mounts.clone().unwrap();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].mount_path, "/data/output");
    }

    #[test]
    fn fetch_adds_one_init_container() {
        let mut req = request();
        req.fetches = vec![fetch("first"), fetch("second")];
        let spec = blueprint(&req, None).pod_spec().unwrap();

        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, FETCH_CONTAINER);
        assert_eq!(init[0].image.as_deref(), Some("fetch:1"));
        assert_eq!(init[0].args.as_ref().unwrap()[1], "s3://bucket/first");
        let res = init[0].resources.as_ref().unwrap();
        assert_eq!(res.requests.as_ref().unwrap()["memory"].0, "1024Mi");
        assert_eq!(res.limits.as_ref().unwrap()["cpu"].0, "2");

        let volumes = spec.volumes.unwrap();
        let input = volumes.iter().find(|v| v.name == INPUT_VOLUME).unwrap();
        assert_eq!(input.host_path.as_ref().unwrap().path, "/mnt/input/42");
        let fetched = volumes.iter().find(|v| v.name == FETCH_VOLUME).unwrap();
        assert_eq!(fetched.host_path.as_ref().unwrap().path, "/mnt/fetch/42");
    }

    #[test]
    fn fan_out_item_uses_its_own_fetch_and_suffix() {
        let mut req = request();
        req.multiple = true;
        req.fetches = vec![fetch("a"), fetch("b")];
        let spec = blueprint(&req, Some(1)).pod_spec().unwrap();

        let init = spec.init_containers.unwrap();
        assert_eq!(init[0].args.as_ref().unwrap()[1], "s3://bucket/b");
        let volumes = spec.volumes.unwrap();
        let output = volumes.iter().find(|v| v.name == OUTPUT_VOLUME).unwrap();
        assert_eq!(output.host_path.as_ref().unwrap().path, "/mnt/output/42/1");
    }

    #[test]
    fn fan_out_index_past_fetches_is_an_error() {
        let mut req = request();
        req.multiple = true;
        req.fetches = vec![fetch("a")];
        let err = blueprint(&req, Some(3)).pod_spec().unwrap_err();
        assert!(matches!(err, JobError::MissingFetchSpec { index: 3 }));
    }

    #[rstest]
    #[case::command("python train.py", "")]
    #[case::args("", "[unterminated")]
    fn malformed_lists_fail_to_parse(#[case] command: &str, #[case] args: &str) {
        let mut req = request();
        req.command = command.to_string();
        req.args = args.to_string();
        let err = blueprint(&req, None).pod_spec().unwrap_err();
        match err {
            JobError::ManifestParse { message, .. } => {
                assert!(message.starts_with(PARSE_FAILED))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn empty_command_is_omitted() {
        let mut req = request();
        req.command = String::new();
        let spec = blueprint(&req, None).pod_spec().unwrap();
        assert!(spec.containers[0].command.is_none());
        assert_eq!(spec.containers[0].image_pull_policy.as_deref(), Some("IfNotPresent"));
    }
}
