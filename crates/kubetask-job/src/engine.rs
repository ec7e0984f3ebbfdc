//! Scheduler-facing entry points: `run` and `cancel`
//!
//! The [`Engine`] owns the compiler, the single-job executor and the batch
//! orchestrator. Every `run` executes inside a `task` span so relayed log
//! lines and engine events correlate with the scheduler's task instance.

use std::sync::Arc;

use kubetask_common::{ClusterClientProvider, CrdRegistry, EngineConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::cluster::KubeBackend;
use crate::compiler::{CompiledManifest, ManifestCompiler};
use crate::error::Result;
use crate::executor::{ExecutorSettings, TaskExecutor};
use crate::fanout::{batch_sink, BatchOrchestrator, BatchRun};
use crate::log_relay::TracingLogSink;
use crate::request::ExecutionRequest;
use crate::status::TaskOutcome;
use crate::template::TemplateRegistry;
use crate::watcher::{CancellationContext, LiveInstances};

/// Compiles, runs and cancels execution requests
pub struct Engine {
    compiler: ManifestCompiler,
    executor: Arc<TaskExecutor>,
    batch: BatchOrchestrator,
    live: Arc<dyn LiveInstances>,
}

impl Engine {
    pub fn new(
        compiler: ManifestCompiler,
        executor: Arc<TaskExecutor>,
        batch: BatchOrchestrator,
        live: Arc<dyn LiveInstances>,
    ) -> Self {
        Self {
            compiler,
            executor,
            batch,
            live,
        }
    }

    /// Wire an engine against real clusters
    pub fn from_config(
        config: &EngineConfig,
        provider: Arc<dyn ClusterClientProvider>,
        live: Arc<dyn LiveInstances>,
    ) -> Result<Self> {
        let templates = match &config.template_dir {
            Some(dir) => TemplateRegistry::with_overrides(dir)?,
            None => TemplateRegistry::builtin()?,
        };
        let crds = Arc::new(CrdRegistry::with_overrides(&config.api_version_overrides));
        let compiler = ManifestCompiler::new(Arc::new(templates), crds.clone(), config);

        let settings = ExecutorSettings {
            log_tail_lines: config.log_tail_lines,
            ..Default::default()
        };
        let executor = Arc::new(TaskExecutor::new(
            Arc::new(KubeBackend::new(provider, crds)),
            Arc::new(TracingLogSink),
            settings,
        ));
        let sink = batch_sink(&config.batch_callback, config.read_timeout())?;
        let batch = BatchOrchestrator::new(
            executor.clone(),
            sink,
            config.fan_out_concurrency,
            config.fan_out_policy,
        );
        Ok(Self::new(compiler, executor, batch, live))
    }

    /// Render every manifest `req` would submit
    pub fn compile(&self, req: &ExecutionRequest) -> Result<Vec<CompiledManifest>> {
        self.compiler.compile_all(req)
    }

    /// Run a request to its terminal outcome.
    ///
    /// Compilation and submission failures are errors. Firing `token` stops
    /// the watch and resolves the run as KILLED.
    pub async fn run(&self, req: &ExecutionRequest, token: CancellationToken) -> Result<TaskOutcome> {
        let span = info_span!(
            "task",
            task_instance_id = req.task_instance_id,
            task_name = %req.task_name,
            log_path = req.log_path.as_deref().unwrap_or_default(),
        );
        async move {
            let ctx = CancellationContext::new(req.task_instance_id, self.live.clone(), token);
            let timeout = req.timeout.bound();

            let outcome = if req.multiple {
                let batch = BatchRun {
                    manifests: self.compiler.compile_all(req)?,
                    fetches: &req.fetches,
                    process_instance_id: req.process_instance_id,
                    timeout,
                };
                self.batch.run(batch, &ctx).await?
            } else {
                let manifest = self.compiler.compile(req, None)?;
                self.executor.run_item(&manifest, timeout, &ctx).await?
            };

            info!(outcome = %outcome.status, exit_code = outcome.exit_code(), "Run finished");
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Delete every object `req` may have created.
    ///
    /// All items are attempted; the first failure is returned.
    pub async fn cancel(&self, req: &ExecutionRequest) -> Result<()> {
        let mut first_error = None;
        for manifest in self.compiler.compile_all(req)? {
            if let Err(e) = self.executor.cancel(&manifest).await {
                warn!(job = %manifest.name, error = %e, "Failed to cancel workload");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
