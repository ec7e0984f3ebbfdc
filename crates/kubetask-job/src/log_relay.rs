//! Log relay
//!
//! Streams the task container's log into a [`LogSink`] while the watcher
//! runs. The relay is joined before `run` returns so every line it saw is
//! delivered ahead of the outcome.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kubetask_common::retry::{retry_until_cancelled, RetryConfig, RetryOutcome};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument, Span};

use crate::cluster::WorkloadApi;
use crate::compiler::CompiledManifest;

/// Destination for relayed log lines
#[cfg_attr(test, mockall::automock)]
pub trait LogSink: Send + Sync {
    fn line(&self, job: &str, line: &str);
}

/// Emits each line as a `tracing` event on target `task_log`
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn line(&self, job: &str, line: &str) {
        info!(target: "task_log", job = %job, "{}", line);
    }
}

/// Handle to a running relay
pub struct LogRelay {
    job: String,
    close: CancellationToken,
    handle: JoinHandle<usize>,
}

impl LogRelay {
    /// Start relaying. Opening the stream is retried until the container
    /// starts or the relay is closed.
    pub fn spawn(
        api: Arc<dyn WorkloadApi>,
        manifest: &CompiledManifest,
        sink: Arc<dyn LogSink>,
        retry: RetryConfig,
    ) -> Self {
        let close = CancellationToken::new();
        let token = close.clone();
        let namespace = manifest.namespace.clone();
        let job = manifest.name.clone();
        let container = manifest.container_name.clone();

        let task_job = job.clone();
        let handle = tokio::spawn(
            async move {
                let opened = retry_until_cancelled(&retry, &token, "open log stream", || {
                    api.log_lines(&namespace, &task_job, &container)
                })
                .await;
                let mut lines = match opened {
                    RetryOutcome::Done(lines) => lines,
                    RetryOutcome::Exhausted(e) => {
                        warn!(job = %task_job, error = %e, "Giving up on log stream");
                        return 0;
                    }
                    RetryOutcome::Cancelled => return 0,
                };

                let mut relayed = 0usize;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        next = lines.next() => match next {
                            Some(Ok(line)) => {
                                sink.line(&task_job, &line);
                                relayed += 1;
                            }
                            Some(Err(e)) => {
                                warn!(job = %task_job, error = %e, "Log stream broke");
                                break;
                            }
                            None => break,
                        },
                    }
                }
                debug!(job = %task_job, lines = relayed, "Log relay finished");
                relayed
            }
            .instrument(Span::current()),
        );

        Self { job, close, handle }
    }

    /// Let the stream drain for up to `grace`, then close it and join.
    /// Returns the number of relayed lines.
    pub async fn finish(mut self, grace: Duration) -> usize {
        let joined = match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(joined) => joined,
            Err(_) => {
                self.close.cancel();
                (&mut self.handle).await
            }
        };
        match joined {
            Ok(count) => count,
            Err(e) => {
                warn!(job = %self.job, error = %e, "Log relay task failed");
                0
            }
        }
    }
}
