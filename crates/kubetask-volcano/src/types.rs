//! Volcano serialization types
//!
//! Field names follow the Volcano CRDs so values serialize straight into
//! `DynamicObject` payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Volcano VCJob resource (`batch.volcano.sh/v1alpha1` Kind: Job)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCJob {
    pub api_version: String,
    pub kind: String,
    pub metadata: VCJobMetadata,
    pub spec: VCJobSpec,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCJobMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// VCJob spec
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCJobSpec {
    #[serde(default = "default_scheduler")]
    pub scheduler_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_available: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retry: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,

    #[serde(default)]
    pub tasks: Vec<VCJobTask>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<VCJobTaskPolicy>,

    /// Volcano job plugins (`pytorch`, `svc`, `env`) with their arguments
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub plugins: BTreeMap<String, Vec<String>>,
}

fn default_scheduler() -> String {
    crate::VOLCANO_SCHEDULER.to_string()
}

/// A single task within a VCJob
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCJobTask {
    pub name: String,
    #[serde(default = "one")]
    pub replicas: u32,
    /// Pod template, kept as JSON so authored fields pass through untouched
    #[serde(default)]
    pub template: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policies: Vec<VCJobTaskPolicy>,
}

fn one() -> u32 {
    1
}

/// Volcano lifecycle policy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VCJobTaskPolicy {
    pub event: String,
    pub action: String,
}

/// Volcano Queue resource (`scheduling.volcano.sh/v1beta1` Kind: Queue)
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolcanoQueue {
    pub api_version: String,
    pub kind: String,
    pub metadata: QueueMetadata,
    pub spec: VolcanoQueueSpec,
}

/// Queues are cluster scoped; only the name matters
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueMetadata {
    pub name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolcanoQueueSpec {
    pub weight: u32,
    pub reclaimable: bool,
    /// Hard ceiling (`cpu`, `memory`, GPU resource keys)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capability: BTreeMap<String, String>,
    /// Share the queue is entitled to under contention; mirrors capability
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deserved: BTreeMap<String, String>,
}

/// Lifecycle state Volcano reports in `status.state`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueueState {
    Open,
    Closed,
    Closing,
    #[default]
    Unknown,
}

impl QueueState {
    /// Read `status.state` from a queue object
    pub fn from_object(obj: &serde_json::Value) -> Self {
        match obj
            .get("status")
            .and_then(|s| s.get("state"))
            .and_then(|s| s.as_str())
        {
            Some("Open") => Self::Open,
            Some("Closed") => Self::Closed,
            Some("Closing") => Self::Closing,
            _ => Self::Unknown,
        }
    }

    /// Name as written by Volcano
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Closed => "Closed",
            Self::Closing => "Closing",
            Self::Unknown => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn vcjob_omits_empty_fields() {
        let vcjob = VCJob {
            api_version: "batch.volcano.sh/v1alpha1".to_string(),
            kind: "Job".to_string(),
            metadata: VCJobMetadata {
                name: "train-7".to_string(),
                namespace: "ml".to_string(),
                labels: BTreeMap::new(),
            },
            spec: VCJobSpec {
                scheduler_name: "volcano".to_string(),
                min_available: Some(1),
                max_retry: None,
                queue: Some("default".to_string()),
                priority_class_name: None,
                tasks: vec![],
                policies: vec![],
                plugins: BTreeMap::new(),
            },
        };

        let json = serde_json::to_value(&vcjob).unwrap();
        assert_eq!(json["spec"]["schedulerName"], "volcano");
        assert_eq!(json["spec"]["minAvailable"], 1);
        assert!(json["spec"].get("maxRetry").is_none());
        assert!(json["metadata"].get("labels").is_none());
    }

    #[test]
    fn authored_template_defaults() {
        let vcjob: VCJob = serde_json::from_value(serde_json::json!({
            "apiVersion": "batch.volcano.sh/v1alpha1",
            "kind": "Job",
            "metadata": {},
            "spec": { "tasks": [{ "name": "main" }] }
        }))
        .unwrap();
        assert_eq!(vcjob.spec.scheduler_name, "volcano");
        assert_eq!(vcjob.spec.tasks[0].replicas, 1);
    }

    #[rstest]
    #[case::open("Open", QueueState::Open)]
    #[case::closed("Closed", QueueState::Closed)]
    #[case::closing("Closing", QueueState::Closing)]
    #[case::other("Weird", QueueState::Unknown)]
    fn queue_state_from_status(#[case] raw: &str, #[case] expected: QueueState) {
        let obj = serde_json::json!({ "status": { "state": raw } });
        assert_eq!(QueueState::from_object(&obj), expected);
    }

    #[test]
    fn queue_without_status_is_unknown() {
        assert_eq!(
            QueueState::from_object(&serde_json::json!({})),
            QueueState::Unknown
        );
    }
}
