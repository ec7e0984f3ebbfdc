//! Single-job execution: submit, then watch and relay logs concurrently

use std::sync::Arc;
use std::time::Duration;

use kubetask_common::retry::RetryConfig;
use tracing::{info, warn};

use crate::cluster::{WorkloadApi, WorkloadBackend};
use crate::compiler::CompiledManifest;
use crate::error::{JobError, Result};
use crate::log_relay::{LogRelay, LogSink};
use crate::status::TaskOutcome;
use crate::submit::{stop, submit};
use crate::watcher::{watch, CancellationContext, WatchSettings};

/// Tuning for [`TaskExecutor`]
#[derive(Clone, Debug)]
pub struct ExecutorSettings {
    pub log_tail_lines: i64,
    /// How long the log relay may keep draining after the outcome is known
    pub log_drain_grace: Duration,
    /// Backoff for opening the log stream while the container starts
    pub log_open_retry: RetryConfig,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            log_tail_lines: 500,
            log_drain_grace: Duration::from_secs(5),
            log_open_retry: RetryConfig::default(),
        }
    }
}

/// Runs compiled manifests against their clusters
pub struct TaskExecutor {
    backend: Arc<dyn WorkloadBackend>,
    sink: Arc<dyn LogSink>,
    settings: ExecutorSettings,
}

impl TaskExecutor {
    pub fn new(
        backend: Arc<dyn WorkloadBackend>,
        sink: Arc<dyn LogSink>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            backend,
            sink,
            settings,
        }
    }

    /// Submit one manifest and block until it is terminal.
    ///
    /// Compilation already happened; only submission errors are returned.
    /// Everything after submission ends up in the outcome.
    pub async fn run_item(
        &self,
        manifest: &CompiledManifest,
        timeout: Option<Duration>,
        ctx: &CancellationContext,
    ) -> Result<TaskOutcome> {
        if ctx.is_cancelled() {
            info!(job = %manifest.name, "Task instance already gone, not submitting");
            return Ok(TaskOutcome::killed());
        }

        let api = self.api_for(manifest).await?;
        if let Err(e) = submit(api.as_ref(), manifest).await {
            if e.is_cluster_failure() {
                self.backend.invalidate(&manifest.target);
            }
            if let Err(cleanup) = stop(api.as_ref(), manifest).await {
                warn!(job = %manifest.name, error = %cleanup, "Cleanup after failed submission failed");
            }
            return Err(e);
        }

        let relay = LogRelay::spawn(
            api.clone(),
            manifest,
            self.sink.clone(),
            self.settings.log_open_retry.clone(),
        );
        let settings = WatchSettings {
            timeout,
            log_tail_lines: self.settings.log_tail_lines,
        };
        let outcome = watch(api.as_ref(), manifest, settings, ctx).await;
        let lines = relay.finish(self.settings.log_drain_grace).await;

        info!(
            job = %manifest.name,
            outcome = %outcome.status,
            exit_code = outcome.exit_code(),
            log_lines = lines,
            "Task finished"
        );
        Ok(outcome)
    }

    /// Delete the manifest's object if it exists
    pub async fn cancel(&self, manifest: &CompiledManifest) -> Result<()> {
        let api = self.api_for(manifest).await?;
        stop(api.as_ref(), manifest).await
    }

    async fn api_for(&self, manifest: &CompiledManifest) -> Result<Arc<dyn WorkloadApi>> {
        self.backend
            .api(&manifest.target, manifest.crd_kind())
            .await
            .map_err(|e| {
                if e.is_cluster_failure() {
                    self.backend.invalidate(&manifest.target);
                }
                JobError::cluster(manifest.target.to_string(), e)
            })
    }
}
