//! Resource coordinates for every workload kind the engine submits
//!
//! Each workload kind is a generic resource parameterized by group, version,
//! plural and scope. The registry hands out `ApiResource` values so the rest
//! of the engine can build `Api<DynamicObject>` handles without knowing which
//! operator backs a kind. Versions can be overridden per deployment when a
//! cluster runs a different operator release.

use std::collections::BTreeMap;

use dashmap::DashMap;
use kube::discovery::ApiResource;
use tracing::{info, warn};

use crate::kube_utils::build_api_resource;

/// Resource types the engine creates, deletes and watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrdKind {
    /// Plain batch Job (batch/v1)
    BatchJob,
    /// Volcano Job (batch.volcano.sh), the queue-admitted job shape
    VolcanoJob,
    /// Volcano Queue (scheduling.volcano.sh)
    VolcanoQueue,
    /// FlinkDeployment (flink.apache.org)
    FlinkDeployment,
    /// SparkApplication (sparkoperator.k8s.io)
    SparkApplication,
    /// PyTorchJob (kubeflow.org)
    PyTorchJob,
}

/// All CrdKind variants for iteration.
pub const ALL_CRD_KINDS: &[CrdKind] = &[
    CrdKind::BatchJob,
    CrdKind::VolcanoJob,
    CrdKind::VolcanoQueue,
    CrdKind::FlinkDeployment,
    CrdKind::SparkApplication,
    CrdKind::PyTorchJob,
];

impl CrdKind {
    /// API group
    pub fn group(&self) -> &'static str {
        match self {
            Self::BatchJob => "batch",
            Self::VolcanoJob => "batch.volcano.sh",
            Self::VolcanoQueue => "scheduling.volcano.sh",
            Self::FlinkDeployment => "flink.apache.org",
            Self::SparkApplication => "sparkoperator.k8s.io",
            Self::PyTorchJob => "kubeflow.org",
        }
    }

    /// Kubernetes Kind string
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::BatchJob | Self::VolcanoJob => "Job",
            Self::VolcanoQueue => "Queue",
            Self::FlinkDeployment => "FlinkDeployment",
            Self::SparkApplication => "SparkApplication",
            Self::PyTorchJob => "PyTorchJob",
        }
    }

    /// API version used unless overridden
    pub fn default_api_version(&self) -> &'static str {
        match self {
            Self::BatchJob => "batch/v1",
            Self::VolcanoJob => "batch.volcano.sh/v1alpha1",
            Self::VolcanoQueue => "scheduling.volcano.sh/v1beta1",
            Self::FlinkDeployment => "flink.apache.org/v1beta1",
            Self::SparkApplication => "sparkoperator.k8s.io/v1beta2",
            Self::PyTorchJob => "kubeflow.org/v1",
        }
    }

    /// Whether objects of this kind live in a namespace
    pub fn namespaced(&self) -> bool {
        !matches!(self, Self::VolcanoQueue)
    }

    /// Parse the short names used in configuration overrides
    pub fn from_config_key(key: &str) -> Option<Self> {
        match key {
            "batchJob" => Some(Self::BatchJob),
            "volcanoJob" => Some(Self::VolcanoJob),
            "volcanoQueue" => Some(Self::VolcanoQueue),
            "flinkDeployment" => Some(Self::FlinkDeployment),
            "sparkApplication" => Some(Self::SparkApplication),
            "pytorchJob" => Some(Self::PyTorchJob),
            _ => None,
        }
    }
}

/// Read-only table of resource coordinates, built once at startup and shared
/// via `Arc<CrdRegistry>`.
pub struct CrdRegistry {
    entries: DashMap<CrdKind, ApiResource>,
}

impl CrdRegistry {
    /// Registry with the default API version for every kind
    pub fn standard() -> Self {
        let entries = DashMap::new();
        for kind in ALL_CRD_KINDS {
            entries.insert(
                *kind,
                build_api_resource(kind.default_api_version(), kind.kind_str()),
            );
        }
        Self { entries }
    }

    /// Registry with per-kind API version overrides keyed by config name
    /// (`volcanoJob`, `flinkDeployment`, ...). Unknown keys are ignored with a
    /// warning so a typo never blocks startup.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Self {
        let registry = Self::standard();
        for (key, api_version) in overrides {
            match CrdKind::from_config_key(key) {
                Some(kind) => {
                    info!(kind = key.as_str(), api_version = %api_version, "overriding API version");
                    registry
                        .entries
                        .insert(kind, build_api_resource(api_version, kind.kind_str()));
                }
                None => warn!(key = key.as_str(), "ignoring unknown API version override"),
            }
        }
        registry
    }

    /// Coordinates for a kind
    pub fn resolve(&self, kind: CrdKind) -> ApiResource {
        match self.entries.get(&kind) {
            Some(ar) => ar.clone(),
            None => build_api_resource(kind.default_api_version(), kind.kind_str()),
        }
    }
}

impl Default for CrdRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crd_kind_group_and_version_are_consistent() {
        for kind in ALL_CRD_KINDS {
            assert!(
                kind.default_api_version().starts_with(kind.group()),
                "{:?}: api_version '{}' doesn't start with group '{}'",
                kind,
                kind.default_api_version(),
                kind.group()
            );
        }
    }

    #[test]
    fn standard_plurals() {
        let registry = CrdRegistry::standard();
        assert_eq!(registry.resolve(CrdKind::BatchJob).plural, "jobs");
        assert_eq!(registry.resolve(CrdKind::VolcanoJob).plural, "jobs");
        assert_eq!(registry.resolve(CrdKind::VolcanoQueue).plural, "queues");
        assert_eq!(
            registry.resolve(CrdKind::FlinkDeployment).plural,
            "flinkdeployments"
        );
        assert_eq!(
            registry.resolve(CrdKind::SparkApplication).plural,
            "sparkapplications"
        );
        assert_eq!(registry.resolve(CrdKind::PyTorchJob).plural, "pytorchjobs");
    }

    #[test]
    fn only_queues_are_cluster_scoped() {
        for kind in ALL_CRD_KINDS {
            assert_eq!(kind.namespaced(), *kind != CrdKind::VolcanoQueue);
        }
    }

    #[test]
    fn overrides_replace_version() {
        let overrides = BTreeMap::from([
            (
                "sparkApplication".to_string(),
                "sparkoperator.k8s.io/v1beta3".to_string(),
            ),
            ("bogus".to_string(), "x/v1".to_string()),
        ]);
        let registry = CrdRegistry::with_overrides(&overrides);
        let ar = registry.resolve(CrdKind::SparkApplication);
        assert_eq!(ar.version, "v1beta3");
        assert_eq!(ar.group, "sparkoperator.k8s.io");
        assert_eq!(
            registry.resolve(CrdKind::PyTorchJob).api_version,
            "kubeflow.org/v1"
        );
    }
}
