//! Read-only registry of workload templates
//!
//! Templates are parsed once at startup and shared behind an `Arc`. The
//! compiler clones a template and overlays request fields; it never mutates
//! the registry.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use kubetask_common::yaml::parse_yaml;
use kubetask_volcano::VCJob;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{JobError, Result};

/// Templates the compiler knows about
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TemplateName {
    QueueJob,
    PyTorchQueueJob,
    FlinkDeployment,
    SparkApplication,
    PyTorchJob,
}

pub const ALL_TEMPLATES: &[TemplateName] = &[
    TemplateName::QueueJob,
    TemplateName::PyTorchQueueJob,
    TemplateName::FlinkDeployment,
    TemplateName::SparkApplication,
    TemplateName::PyTorchJob,
];

impl TemplateName {
    pub fn file_stem(&self) -> &'static str {
        match self {
            Self::QueueJob => "queue-job",
            Self::PyTorchQueueJob => "pytorch-queue-job",
            Self::FlinkDeployment => "flink-deployment",
            Self::SparkApplication => "spark-application",
            Self::PyTorchJob => "pytorch-job",
        }
    }

    fn builtin_source(&self) -> &'static str {
        match self {
            Self::QueueJob => include_str!("../templates/queue-job.yaml"),
            Self::PyTorchQueueJob => include_str!("../templates/pytorch-queue-job.yaml"),
            Self::FlinkDeployment => include_str!("../templates/flink-deployment.yaml"),
            Self::SparkApplication => include_str!("../templates/spark-application.yaml"),
            Self::PyTorchJob => include_str!("../templates/pytorch-job.yaml"),
        }
    }
}

impl fmt::Display for TemplateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_stem())
    }
}

/// Parsed templates keyed by name
#[derive(Clone, Debug)]
pub struct TemplateRegistry {
    templates: BTreeMap<TemplateName, Value>,
}

impl TemplateRegistry {
    /// Registry of the templates compiled into the binary
    pub fn builtin() -> Result<Self> {
        let mut templates = BTreeMap::new();
        for name in ALL_TEMPLATES {
            templates.insert(*name, parse_template(*name, name.builtin_source())?);
        }
        Ok(Self { templates })
    }

    /// Built-in templates, with any `<name>.yaml` found in `dir` taking precedence
    pub fn with_overrides(dir: &Path) -> Result<Self> {
        let mut registry = Self::builtin()?;
        for name in ALL_TEMPLATES {
            let path = dir.join(format!("{}.yaml", name.file_stem()));
            if !path.is_file() {
                continue;
            }
            let raw = std::fs::read_to_string(&path).map_err(|e| JobError::Template {
                name: name.to_string(),
                message: format!("failed to read {}: {}", path.display(), e),
            })?;
            registry.templates.insert(*name, parse_template(*name, &raw)?);
            info!(template = %name, path = %path.display(), "Loaded template override");
        }
        Ok(registry)
    }

    /// Deep copy of a template, ready to overlay
    pub fn instantiate(&self, name: TemplateName) -> Result<Value> {
        self.templates
            .get(&name)
            .cloned()
            .ok_or_else(|| JobError::Template {
                name: name.to_string(),
                message: "not registered".to_string(),
            })
    }

    /// Typed copy of a queue-admitted job template
    pub fn vcjob(&self, name: TemplateName) -> Result<VCJob> {
        let value = self.instantiate(name)?;
        serde_json::from_value(value).map_err(|e| JobError::Template {
            name: name.to_string(),
            message: e.to_string(),
        })
    }
}

fn parse_template(name: TemplateName, raw: &str) -> Result<Value> {
    let value = parse_yaml(raw).map_err(|e| JobError::Template {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    if !value.is_object() {
        return Err(JobError::Template {
            name: name.to_string(),
            message: "template must be a YAML mapping".to_string(),
        });
    }
    debug!(template = %name, "Parsed template");
    Ok(value)
}
