//! Engine configuration
//!
//! Loaded from an optional YAML file, then overridden by `KUBETASK_*`
//! environment variables. Environment access goes through [`EnvSource`] so
//! tests never touch process-global state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "KUBETASK_";

/// What the batch orchestrator reports when some sub-jobs fail
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FanOutPolicy {
    /// Succeed whenever every sub-job was launched; per-item results only
    /// reach the batch callback
    #[default]
    AlwaysSucceed,
    /// Fail the orchestration if any sub-job ends in FAILURE or KILLED
    FailOnAnyFailure,
}

impl FromStr for FanOutPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "alwaysSucceed" | "always-succeed" => Ok(Self::AlwaysSucceed),
            "failOnAnyFailure" | "fail-on-any-failure" => Ok(Self::FailOnAnyFailure),
            other => Err(Error::config(format!("unknown fan-out policy '{}'", other))),
        }
    }
}

/// Where batch results are posted
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BatchCallbackConfig {
    /// HTTP endpoint receiving the JSON array of per-item results
    pub address: Option<String>,
    /// Value of the `token` header
    pub token: Option<String>,
}

/// Settings for the execution engine and queue manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Enables queue-admitted execution and queued-task bookkeeping
    pub queue_enabled: bool,
    /// Cluster identifier that never receives queue resources
    pub local_test_cluster_code: String,
    /// Image of the data-fetch init container
    pub fetch_image: String,
    /// Pull secret referenced by queue-admitted jobs
    pub image_pull_secret: String,
    /// GPU resource key used when a request does not name one
    pub default_gpu_type: String,
    /// Comma-separated GPU resource keys offered to queue capabilities
    pub gpu_types: String,
    /// Lines of pod log attached to a failed outcome
    pub log_tail_lines: i64,
    /// Concurrent sub-jobs in a fan-out
    pub fan_out_concurrency: usize,
    /// Outcome policy for fan-out orchestration
    pub fan_out_policy: FanOutPolicy,
    /// Batch result delivery
    pub batch_callback: BatchCallbackConfig,
    /// Cluster identifier to kubeconfig file
    pub kubeconfigs: BTreeMap<String, PathBuf>,
    /// Directory of `<template>.yaml` files replacing the built-in templates
    pub template_dir: Option<PathBuf>,
    /// Per-kind API version overrides (`volcanoJob`, `sparkApplication`, ...)
    pub api_version_overrides: BTreeMap<String, String>,
    /// Kube client connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Kube client read timeout in seconds
    pub read_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_enabled: false,
            local_test_cluster_code: "local-test".to_string(),
            fetch_image: "kubetask/fetch:latest".to_string(),
            image_pull_secret: "registry-harbor".to_string(),
            default_gpu_type: "nvidia.com/gpu".to_string(),
            gpu_types: "nvidia.com/gpu".to_string(),
            log_tail_lines: 500,
            fan_out_concurrency: 5,
            fan_out_policy: FanOutPolicy::AlwaysSucceed,
            batch_callback: BatchCallbackConfig::default(),
            kubeconfigs: BTreeMap::new(),
            template_dir: None,
            api_version_overrides: BTreeMap::new(),
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
        }
    }
}

/// Source of environment variables
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Look up a variable by its full name
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the real process environment
#[derive(Clone, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EngineConfig {
    /// Load from an optional YAML file and apply environment overrides
    pub fn load(path: Option<&Path>, env: &dyn EnvSource) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("failed to read {}: {}", path.display(), e))
                })?;
                Self::from_yaml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| Error::config(format!("invalid config: {}", e)))
    }

    fn apply_env(&mut self, env: &dyn EnvSource) -> Result<()> {
        let get = |name: &str| env.var(&format!("{}{}", ENV_PREFIX, name));

        if let Some(v) = get("QUEUE_ENABLED") {
            self.queue_enabled = parse_env("QUEUE_ENABLED", &v)?;
        }
        if let Some(v) = get("LOCAL_TEST_CLUSTER_CODE") {
            self.local_test_cluster_code = v;
        }
        if let Some(v) = get("FETCH_IMAGE") {
            self.fetch_image = v;
        }
        if let Some(v) = get("IMAGE_PULL_SECRET") {
            self.image_pull_secret = v;
        }
        if let Some(v) = get("DEFAULT_GPU_TYPE") {
            self.default_gpu_type = v;
        }
        if let Some(v) = get("GPU_TYPES") {
            self.gpu_types = v;
        }
        if let Some(v) = get("LOG_TAIL_LINES") {
            self.log_tail_lines = parse_env("LOG_TAIL_LINES", &v)?;
        }
        if let Some(v) = get("FAN_OUT_CONCURRENCY") {
            self.fan_out_concurrency = parse_env("FAN_OUT_CONCURRENCY", &v)?;
        }
        if let Some(v) = get("FAN_OUT_POLICY") {
            self.fan_out_policy = v.parse()?;
        }
        if let Some(v) = get("BATCH_CALLBACK_ADDRESS") {
            self.batch_callback.address = Some(v);
        }
        if let Some(v) = get("BATCH_CALLBACK_TOKEN") {
            self.batch_callback.token = Some(v);
        }
        if let Some(v) = get("TEMPLATE_DIR") {
            self.template_dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.fan_out_concurrency == 0 {
            return Err(Error::config("fanOutConcurrency must be at least 1"));
        }
        if self.log_tail_lines <= 0 {
            return Err(Error::config("logTailLines must be positive"));
        }
        Ok(())
    }

    /// Configured GPU resource keys, trimmed and without empties
    pub fn gpu_type_list(&self) -> Vec<String> {
        self.gpu_types
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Kube client connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Kube client read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::config(format!(
            "invalid value '{}' for {}{}",
            value, ENV_PREFIX, name
        ))
    })
}
