//! Status normalization
//!
//! Every workload kind reports progress at a different JSON path with its own
//! vocabulary. [`WorkloadKind::extract_phase`] folds them into [`Phase`].

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::request::WorkloadKind;

/// Normalized status of one observed resource
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Running,
    Succeeded,
    Failed,
}

impl WorkloadKind {
    /// Read the kind-specific status field from a resource object
    pub fn extract_phase(&self, object: &Value) -> Phase {
        match self {
            Self::Plain => plain_job_phase(object),
            Self::QueueAdmitted => match str_at(object, &["status", "state", "phase"]) {
                Some("Completed") => Phase::Succeeded,
                Some("Failed" | "Terminated" | "Aborted") => Phase::Failed,
                _ => Phase::Running,
            },
            // Streaming jobs never finish, so a running Flink job counts
            Self::FlinkOperator => match str_at(object, &["status", "jobStatus", "state"]) {
                Some("FINISHED" | "RUNNING") => Phase::Succeeded,
                Some("FAILED") => Phase::Failed,
                _ => Phase::Running,
            },
            Self::SparkOperator => match str_at(object, &["status", "applicationState", "state"])
            {
                Some("COMPLETED") => Phase::Succeeded,
                Some("FAILED" | "SUBMISSION_FAILED") => Phase::Failed,
                _ => Phase::Running,
            },
            Self::PyTorchOperator => match str_at(object, &["status", "jobStatus", "state"]) {
                Some("FINISHED") => Phase::Succeeded,
                Some("FAILED") => Phase::Failed,
                _ => Phase::Running,
            },
        }
    }
}

fn plain_job_phase(object: &Value) -> Phase {
    let count = |field: &str| {
        object
            .get("status")
            .and_then(|s| s.get(field))
            .and_then(Value::as_i64)
            .unwrap_or(0)
    };
    if count("succeeded") >= 1 {
        Phase::Succeeded
    } else if count("failed") >= 1 {
        Phase::Failed
    } else {
        Phase::Running
    }
}

fn str_at<'a>(object: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(object, |v, key| v.get(*key))
        .and_then(Value::as_str)
}

/// Terminal result of one watched submission
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchOutcome {
    Success,
    Failure,
    Killed,
}

impl WatchOutcome {
    /// Process-style exit code reported to the scheduler
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure => -1,
            Self::Killed => 137,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Killed => "KILLED",
        }
    }
}

impl fmt::Display for WatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome returned from `run`, with an optional log excerpt or reason
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: WatchOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TaskOutcome {
    pub fn success() -> Self {
        Self {
            status: WatchOutcome::Success,
            message: None,
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: WatchOutcome::Failure,
            message: Some(message.into()),
        }
    }

    pub fn killed() -> Self {
        Self {
            status: WatchOutcome::Killed,
            message: None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn is_success(&self) -> bool {
        self.status == WatchOutcome::Success
    }
}
