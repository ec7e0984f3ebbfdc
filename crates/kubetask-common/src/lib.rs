//! Shared plumbing for kubetask: errors, configuration, telemetry, resource
//! coordinates and the cached cluster client provider

#![deny(missing_docs)]

pub mod client;
pub mod config;
pub mod crd_registry;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod task_type;
pub mod telemetry;
pub mod yaml;

pub use client::{CachedClientProvider, ClusterClientProvider, ClusterTarget, KubeconfigResolver};
pub use config::{EngineConfig, FanOutPolicy};
pub use crd_registry::{CrdKind, CrdRegistry};
pub use error::Error;
pub use task_type::TaskType;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "kubetask";

/// Label key marking the layer of resources created by the engine
pub const LAYER_LABEL: &str = "layer";

/// Value of [`LAYER_LABEL`] on every compiled workload
pub const LAYER_LABEL_VALUE: &str = "kubetask";

/// Label key carrying the derived job name
pub const NAME_LABEL: &str = "name";

/// Pod label carrying the scheduler's task application id
pub const TASK_APP_LABEL: &str = "task-app-id";
