//! Task execution for kubetask
//!
//! Compiles execution requests into workload manifests and drives them
//! through submission, lifecycle watching and log relay:
//! - `ManifestCompiler` renders plain Jobs, Volcano Jobs and operator CRDs
//! - `submit`/`stop` keep at most one live object per derived name
//! - `watch` resolves an object to SUCCESS, FAILURE or KILLED
//! - `BatchOrchestrator` fans a data-parallel task out over a bounded pool

pub mod cluster;
pub mod compiler;
pub mod engine;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod log_relay;
pub mod request;
pub mod status;
pub mod submit;
pub mod template;
pub mod watcher;

pub use compiler::{derived_name, CompiledManifest, ManifestCompiler};
pub use engine::Engine;
pub use error::{JobError, Result};
pub use request::{ExecutionRequest, WorkloadKind, WorkloadSpec};
pub use status::{TaskOutcome, WatchOutcome};
pub use watcher::{LiveInstanceSet, LiveInstances};
