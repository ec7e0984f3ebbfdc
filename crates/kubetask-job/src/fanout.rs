//! Batch fan-out
//!
//! Runs one sub-job per fetch spec on a bounded pool and reports the per-item
//! results to a [`BatchResultSink`] once every item has finished.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use kubetask_common::config::BatchCallbackConfig;
use kubetask_common::FanOutPolicy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::compiler::CompiledManifest;
use crate::error::{JobError, Result};
use crate::executor::TaskExecutor;
use crate::request::FetchSpec;
use crate::status::{TaskOutcome, WatchOutcome};
use crate::watcher::CancellationContext;

/// Header carrying the callback token
pub const TOKEN_HEADER: &str = "token";

/// Result of one fan-out item as reported to the callback
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub name: String,
    pub task_instance_id: i64,
    pub status: WatchOutcome,
    pub process_instance_id: i64,
}

/// Receives consolidated fan-out results
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BatchResultSink: Send + Sync {
    async fn publish(&self, results: &[BatchItemResult]) -> Result<()>;
}

/// POSTs results as a JSON array
pub struct HttpBatchCallback {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
}

impl HttpBatchCallback {
    pub fn new(address: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JobError::Callback(e.to_string()))?;
        Ok(Self {
            client,
            address: address.into(),
            token,
        })
    }
}

#[async_trait]
impl BatchResultSink for HttpBatchCallback {
    async fn publish(&self, results: &[BatchItemResult]) -> Result<()> {
        let mut request = self.client.post(&self.address).json(results);
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| JobError::Callback(e.to_string()))?;
        if !response.status().is_success() {
            return Err(JobError::Callback(format!(
                "{} answered {}",
                self.address,
                response.status()
            )));
        }
        Ok(())
    }
}

/// Sink used when no callback address is configured
#[derive(Clone, Copy, Debug, Default)]
pub struct LogOnlyBatchSink;

#[async_trait]
impl BatchResultSink for LogOnlyBatchSink {
    async fn publish(&self, results: &[BatchItemResult]) -> Result<()> {
        for r in results {
            info!(item = %r.name, task_instance_id = r.task_instance_id, status = %r.status, "Batch item result");
        }
        Ok(())
    }
}

/// Pick the sink for a callback configuration
pub fn batch_sink(config: &BatchCallbackConfig, timeout: Duration) -> Result<Arc<dyn BatchResultSink>> {
    match config.address.as_deref().filter(|a| !a.trim().is_empty()) {
        Some(address) => Ok(Arc::new(HttpBatchCallback::new(
            address,
            config.token.clone(),
            timeout,
        )?)),
        None => Ok(Arc::new(LogOnlyBatchSink)),
    }
}

/// Identity of the fan-out being run
pub struct BatchRun<'a> {
    pub manifests: Vec<CompiledManifest>,
    pub fetches: &'a [FetchSpec],
    pub process_instance_id: i64,
    pub timeout: Option<Duration>,
}

/// Runs fan-out items on a bounded pool
pub struct BatchOrchestrator {
    executor: Arc<TaskExecutor>,
    sink: Arc<dyn BatchResultSink>,
    concurrency: usize,
    policy: FanOutPolicy,
}

impl BatchOrchestrator {
    pub fn new(
        executor: Arc<TaskExecutor>,
        sink: Arc<dyn BatchResultSink>,
        concurrency: usize,
        policy: FanOutPolicy,
    ) -> Self {
        Self {
            executor,
            sink,
            concurrency: concurrency.max(1),
            policy,
        }
    }

    /// Run every item and resolve the orchestration outcome.
    ///
    /// Items not yet started when the context is cancelled are skipped and
    /// recorded as KILLED. A submission error from any item is returned after
    /// the results are published.
    pub async fn run(&self, batch: BatchRun<'_>, ctx: &CancellationContext) -> Result<TaskOutcome> {
        let total = batch.manifests.len();
        info!(items = total, concurrency = self.concurrency, policy = ?self.policy, "Starting fan-out");

        let mut finished: Vec<(usize, CompiledManifest, Result<TaskOutcome>)> =
            stream::iter(batch.manifests.into_iter().enumerate().map(|(i, manifest)| {
                let item_ctx = ctx.child();
                let timeout = batch.timeout;
                async move {
                    let outcome = if item_ctx.token().is_cancelled() {
                        Ok(TaskOutcome::killed())
                    } else {
                        self.executor.run_item(&manifest, timeout, &item_ctx).await
                    };
                    (i, manifest, outcome)
                }
            }))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        finished.sort_by_key(|(i, _, _)| *i);

        let mut results = Vec::with_capacity(total);
        let mut first_error = None;
        for (i, manifest, outcome) in finished {
            let status = match outcome {
                Ok(o) => o.status,
                Err(e) => {
                    warn!(job = %manifest.name, error = %e, "Fan-out item failed to run");
                    first_error.get_or_insert(e);
                    WatchOutcome::Failure
                }
            };
            let name = batch
                .fetches
                .get(i)
                .map(|f| f.fetch_name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| manifest.name.clone());
            results.push(BatchItemResult {
                name,
                task_instance_id: manifest.task_instance_id,
                status,
                process_instance_id: batch.process_instance_id,
            });
        }

        if let Err(e) = self.sink.publish(&results).await {
            warn!(error = %e, "Failed to deliver batch results");
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if ctx.token().is_cancelled() {
            info!("Fan-out cancelled");
            return Ok(TaskOutcome::killed());
        }
        Ok(self.resolve(&results))
    }

    fn resolve(&self, results: &[BatchItemResult]) -> TaskOutcome {
        let failed: Vec<&str> = results
            .iter()
            .filter(|r| r.status != WatchOutcome::Success)
            .map(|r| r.name.as_str())
            .collect();
        match self.policy {
            FanOutPolicy::FailOnAnyFailure if !failed.is_empty() => {
                TaskOutcome::failure(format!("fan-out items did not succeed: {}", failed.join(", ")))
            }
            _ => {
                if !failed.is_empty() {
                    info!(failed = failed.len(), "Fan-out finished with failed items");
                }
                TaskOutcome::success()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{MockWorkloadApi, MockWorkloadBackend, ResourceEvent, WorkloadApi};
    use crate::executor::tests::{ctx, quiet_sink, settings};
    use crate::request::fixtures::fetch;
    use crate::submit::tests::manifest;
    use futures::stream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn manifests(n: usize) -> Vec<CompiledManifest> {
        (0..n)
            .map(|i| CompiledManifest {
                name: format!("etl-7-{}", i),
                index: Some(i),
                ..manifest()
            })
            .collect()
    }

    fn fetches(n: usize) -> Vec<FetchSpec> {
        (0..n).map(|i| fetch(&format!("source-{}", i))).collect()
    }

    /// Backend whose jobs fail when their name is in `failing`
    fn backend(failing: &'static [&'static str]) -> MockWorkloadBackend {
        let mut api = MockWorkloadApi::new();
        api.expect_exists().returning(|_, _| Ok(false));
        api.expect_create().returning(|_, _| Ok(()));
        api.expect_watch().returning(move |_, name| {
            let phase = if failing.contains(&name) { "Failed" } else { "Completed" };
            let event = ResourceEvent::Applied(json!({ "status": { "state": { "phase": phase } } }));
            Ok(stream::iter(vec![event]).boxed())
        });
        api.expect_log_lines()
            .returning(|_, _, _| Ok(stream::empty().boxed()));
        api.expect_tail_log().returning(|_, _, _, _| Ok(String::new()));

        let api: Arc<dyn WorkloadApi> = Arc::new(api);
        let mut backend = MockWorkloadBackend::new();
        backend.expect_api().returning(move |_, _| Ok(api.clone()));
        backend
    }

    fn capture() -> (Arc<Mutex<Vec<BatchItemResult>>>, MockBatchResultSink) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let mut sink = MockBatchResultSink::new();
        sink.expect_publish().times(1).returning(move |results| {
            s.lock().unwrap().extend_from_slice(results);
            Ok(())
        });
        (seen, sink)
    }

    fn orchestrator(
        backend: MockWorkloadBackend,
        sink: MockBatchResultSink,
        policy: FanOutPolicy,
    ) -> BatchOrchestrator {
        let executor = Arc::new(TaskExecutor::new(Arc::new(backend), quiet_sink(), settings()));
        BatchOrchestrator::new(executor, Arc::new(sink), 5, policy)
    }

    fn batch(fetches: &[FetchSpec]) -> BatchRun<'_> {
        BatchRun {
            manifests: manifests(fetches.len()),
            fetches,
            process_instance_id: 99,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn always_succeed_reports_failures_out_of_band() {
        let (seen, sink) = capture();
        let orch = orchestrator(backend(&["etl-7-1"]), sink, FanOutPolicy::AlwaysSucceed);
        let fetches = fetches(3);

        let outcome = orch.run(batch(&fetches), &ctx(true)).await.unwrap();
        assert!(outcome.is_success());

        let seen = seen.lock().unwrap();
        let statuses: Vec<_> = seen.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![WatchOutcome::Success, WatchOutcome::Failure, WatchOutcome::Success]
        );
        assert_eq!(seen[1].name, "source-1");
        assert_eq!(seen[1].process_instance_id, 99);
    }

    #[tokio::test]
    async fn fail_on_any_failure_surfaces_failed_items() {
        let (_, sink) = capture();
        let orch = orchestrator(backend(&["etl-7-2"]), sink, FanOutPolicy::FailOnAnyFailure);
        let fetches = fetches(3);

        let outcome = orch.run(batch(&fetches), &ctx(true)).await.unwrap();
        assert_eq!(outcome.status, WatchOutcome::Failure);
        assert!(outcome.message.unwrap().contains("source-2"));
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut api = MockWorkloadApi::new();
        api.expect_exists().returning(|_, _| Ok(false));
        let (r, p) = (running.clone(), peak.clone());
        api.expect_create().returning(move |_, _| {
            let now = r.fetch_add(1, Ordering::SeqCst) + 1;
            p.fetch_max(now, Ordering::SeqCst);
            Ok(())
        });
        let r = running.clone();
        api.expect_watch().returning(move |_, _| {
            let r = r.clone();
            let done = stream::once(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                ResourceEvent::Applied(json!({ "status": { "state": { "phase": "Completed" } } }))
            });
            Ok(done.boxed())
        });
        api.expect_log_lines()
            .returning(|_, _, _| Ok(stream::empty().boxed()));

        let api: Arc<dyn WorkloadApi> = Arc::new(api);
        let mut backend = MockWorkloadBackend::new();
        backend.expect_api().returning(move |_, _| Ok(api.clone()));
        let mut sink = MockBatchResultSink::new();
        sink.expect_publish().returning(|_| Ok(()));

        let executor = Arc::new(TaskExecutor::new(Arc::new(backend), quiet_sink(), settings()));
        let orch = BatchOrchestrator::new(executor, Arc::new(sink), 2, FanOutPolicy::AlwaysSucceed);
        let fetches = fetches(6);

        let outcome = orch.run(batch(&fetches), &ctx(true)).await.unwrap();
        assert!(outcome.is_success());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_context_skips_pending_items() {
        let mut backend = MockWorkloadBackend::new();
        backend.expect_api().never();
        let (seen, sink) = capture();
        let orch = orchestrator(backend, sink, FanOutPolicy::AlwaysSucceed);
        let fetches = fetches(4);

        let ctx = ctx(true);
        ctx.token().cancel();
        let outcome = orch.run(batch(&fetches), &ctx).await.unwrap();
        assert_eq!(outcome.status, WatchOutcome::Killed);
        assert!(seen
            .lock()
            .unwrap()
            .iter()
            .all(|r| r.status == WatchOutcome::Killed));
    }

    #[tokio::test]
    async fn callback_failure_does_not_change_outcome() {
        let mut sink = MockBatchResultSink::new();
        sink.expect_publish()
            .returning(|_| Err(JobError::Callback("503".to_string())));
        let orch = orchestrator(backend(&[]), sink, FanOutPolicy::AlwaysSucceed);
        let fetches = fetches(2);

        let outcome = orch.run(batch(&fetches), &ctx(true)).await.unwrap();
        assert!(outcome.is_success());
    }

    #[test]
    fn results_serialize_camel_case() {
        let item = BatchItemResult {
            name: "source-0".to_string(),
            task_instance_id: 7,
            status: WatchOutcome::Success,
            process_instance_id: 3,
        };
        assert_eq!(
            serde_json::to_value(&item).unwrap(),
            json!({ "name": "source-0", "taskInstanceId": 7, "status": "SUCCESS", "processInstanceId": 3 })
        );
    }

    #[test]
    fn sink_selection() {
        let none = BatchCallbackConfig::default();
        assert!(batch_sink(&none, Duration::from_secs(1)).is_ok());
        let http = BatchCallbackConfig {
            address: Some("http://127.0.0.1:9/results".to_string()),
            token: Some("secret".to_string()),
        };
        assert!(batch_sink(&http, Duration::from_secs(1)).is_ok());
    }
}
