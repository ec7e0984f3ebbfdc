//! Task types the scheduler hands to this engine

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Declared type of a scheduler task that runs on Kubernetes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    /// Single-container job
    K8s,
    /// Distributed PyTorch training, queue-admitted when queues are enabled
    #[serde(rename = "PYTORCH_K8S")]
    PyTorchK8s,
    /// Data-parallel fan-out over fetch specs
    #[serde(rename = "DATA_SET_K8S")]
    DataSetK8s,
    /// FlinkDeployment through the Flink operator
    FlinkK8sOperator,
    /// SparkApplication through the Spark operator
    SparkK8sOperator,
    /// PyTorchJob through the training operator
    #[serde(rename = "PYTORCH_K8S_OPERATOR")]
    PyTorchK8sOperator,
}

impl TaskType {
    /// Scheduler wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::K8s => "K8S",
            Self::PyTorchK8s => "PYTORCH_K8S",
            Self::DataSetK8s => "DATA_SET_K8S",
            Self::FlinkK8sOperator => "FLINK_K8S_OPERATOR",
            Self::SparkK8sOperator => "SPARK_K8S_OPERATOR",
            Self::PyTorchK8sOperator => "PYTORCH_K8S_OPERATOR",
        }
    }

    /// Types whose start moves a queued task to `Running`
    pub fn tracks_running(&self) -> bool {
        matches!(self, Self::K8s | Self::PyTorchK8s)
    }

    /// Types whose completion moves a queued task to `PendingRerun`
    pub fn tracks_finished(&self) -> bool {
        matches!(self, Self::K8s | Self::PyTorchK8s | Self::DataSetK8s)
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "K8S" => Ok(Self::K8s),
            "PYTORCH_K8S" => Ok(Self::PyTorchK8s),
            "DATA_SET_K8S" => Ok(Self::DataSetK8s),
            "FLINK_K8S_OPERATOR" => Ok(Self::FlinkK8sOperator),
            "SPARK_K8S_OPERATOR" => Ok(Self::SparkK8sOperator),
            "PYTORCH_K8S_OPERATOR" => Ok(Self::PyTorchK8sOperator),
            other => Err(Error::validation(format!("unknown task type '{}'", other))),
        }
    }
}
