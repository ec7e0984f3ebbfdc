//! Lifecycle watcher
//!
//! Follows one submitted object until its status is terminal, the object
//! disappears, the channel fails or the timeout expires. Right before the
//! outcome is finalized the cancellation context is consulted, and a task
//! the scheduler already discarded is reported as KILLED.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ResourceEvent, WorkloadApi};
use crate::compiler::CompiledManifest;
use crate::status::{Phase, TaskOutcome, WatchOutcome};

/// The scheduler's view of which task instances are still alive
#[cfg_attr(test, mockall::automock)]
pub trait LiveInstances: Send + Sync {
    fn contains(&self, task_instance_id: i64) -> bool;
}

/// Concurrent set of live task instance ids
#[derive(Debug, Default)]
pub struct LiveInstanceSet {
    ids: DashSet<i64>,
}

impl LiveInstanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_instance_id: i64) {
        self.ids.insert(task_instance_id);
    }

    pub fn remove(&self, task_instance_id: i64) {
        self.ids.remove(&task_instance_id);
    }
}

impl LiveInstances for LiveInstanceSet {
    fn contains(&self, task_instance_id: i64) -> bool {
        self.ids.contains(&task_instance_id)
    }
}

/// Cancellation state threaded through one `run`
#[derive(Clone)]
pub struct CancellationContext {
    task_instance_id: i64,
    live: Arc<dyn LiveInstances>,
    token: CancellationToken,
}

impl CancellationContext {
    pub fn new(task_instance_id: i64, live: Arc<dyn LiveInstances>, token: CancellationToken) -> Self {
        Self {
            task_instance_id,
            live,
            token,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Context sharing the instance id whose token is cancelled with ours
    pub fn child(&self) -> Self {
        Self {
            task_instance_id: self.task_instance_id,
            live: self.live.clone(),
            token: self.token.child_token(),
        }
    }

    /// Token fired, or the instance left the live cache
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || !self.live.contains(self.task_instance_id)
    }
}

/// Knobs for one watch
#[derive(Clone, Copy, Debug)]
pub struct WatchSettings {
    /// Upper bound on the wait; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Lines of pod log attached to a failure
    pub log_tail_lines: i64,
}

/// Block until `manifest` reaches a terminal outcome
pub async fn watch(
    api: &dyn WorkloadApi,
    manifest: &CompiledManifest,
    settings: WatchSettings,
    ctx: &CancellationContext,
) -> TaskOutcome {
    let observed = async {
        tokio::select! {
            outcome = wait_for_terminal(api, manifest) => outcome,
            _ = ctx.token().cancelled() => Observed::Failed("cancelled".to_string()),
        }
    };

    let observed = match settings.timeout {
        Some(limit) => match tokio::time::timeout(limit, observed).await {
            Ok(o) => o,
            Err(_) => {
                warn!(job = %manifest.name, timeout_secs = limit.as_secs(), "Watch timed out");
                Observed::Failed(format!("timed out after {}s", limit.as_secs()))
            }
        },
        None => observed.await,
    };

    if ctx.is_cancelled() {
        info!(job = %manifest.name, "Task instance no longer live, reporting KILLED");
        return TaskOutcome::killed();
    }

    match observed {
        Observed::Succeeded => {
            info!(job = %manifest.name, "Workload succeeded");
            TaskOutcome::success()
        }
        Observed::Failed(reason) => {
            warn!(job = %manifest.name, reason = %reason, "Workload failed");
            let message = match failure_log(api, manifest, settings.log_tail_lines).await {
                Some(tail) => format!("{}\n{}", reason, tail),
                None => reason,
            };
            TaskOutcome {
                status: WatchOutcome::Failure,
                message: Some(message),
            }
        }
    }
}

enum Observed {
    Succeeded,
    Failed(String),
}

async fn wait_for_terminal(api: &dyn WorkloadApi, manifest: &CompiledManifest) -> Observed {
    let mut events = match api.watch(&manifest.namespace, &manifest.name).await {
        Ok(events) => events,
        Err(e) => return Observed::Failed(format!("failed to start watch: {}", e)),
    };

    while let Some(event) = events.next().await {
        match event {
            ResourceEvent::Applied(object) => match manifest.kind.extract_phase(&object) {
                Phase::Succeeded => return Observed::Succeeded,
                Phase::Failed => return Observed::Failed(format!("job {} failed", manifest.name)),
                Phase::Running => debug!(job = %manifest.name, "Workload still running"),
            },
            ResourceEvent::Deleted => {
                return Observed::Failed(format!("job {} was deleted", manifest.name))
            }
            ResourceEvent::Error(e) => return Observed::Failed(format!("watch failed: {}", e)),
        }
    }
    Observed::Failed("watch stream closed".to_string())
}

/// Best effort; a missing pod or log never changes the outcome
async fn failure_log(api: &dyn WorkloadApi, manifest: &CompiledManifest, lines: i64) -> Option<String> {
    match api
        .tail_log(&manifest.namespace, &manifest.name, &manifest.container_name, lines)
        .await
    {
        Ok(tail) if !tail.trim().is_empty() => Some(tail),
        Ok(_) => None,
        Err(e) => {
            debug!(job = %manifest.name, error = %e, "Could not fetch failure log");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockWorkloadApi;
    use crate::submit::tests::manifest;
    use futures::stream;
    use kubetask_common::Error;
    use rstest::rstest;
    use serde_json::json;

    fn live(present: bool) -> Arc<dyn LiveInstances> {
        let mut live = MockLiveInstances::new();
        live.expect_contains().returning(move |_| present);
        Arc::new(live)
    }

    fn ctx(present: bool) -> CancellationContext {
        CancellationContext::new(7, live(present), CancellationToken::new())
    }

    fn settings() -> WatchSettings {
        WatchSettings {
            timeout: None,
            log_tail_lines: 100,
        }
    }

    fn phase(raw: &str) -> ResourceEvent {
        ResourceEvent::Applied(json!({ "status": { "state": { "phase": raw } } }))
    }

    fn api_with(events: Vec<ResourceEvent>) -> MockWorkloadApi {
        let mut api = MockWorkloadApi::new();
        api.expect_watch()
            .return_once(move |_, _| Ok(stream::iter(events).boxed()));
        api.expect_tail_log()
            .returning(|_, _, _, _| Ok("Traceback: boom".to_string()));
        api
    }

    #[rstest]
    #[case::completed(vec![phase("Pending"), phase("Running"), phase("Completed")], WatchOutcome::Success)]
    #[case::already_finished(vec![phase("Completed")], WatchOutcome::Success)]
    #[case::failed(vec![phase("Running"), phase("Failed")], WatchOutcome::Failure)]
    #[case::deleted(vec![phase("Running"), ResourceEvent::Deleted], WatchOutcome::Failure)]
    #[case::channel_error(vec![ResourceEvent::Error("410 Gone".to_string())], WatchOutcome::Failure)]
    #[case::closed(vec![phase("Running")], WatchOutcome::Failure)]
    #[tokio::test]
    async fn terminal_outcomes(#[case] events: Vec<ResourceEvent>, #[case] expected: WatchOutcome) {
        let api = api_with(events);
        let outcome = watch(&api, &manifest(), settings(), &ctx(true)).await;
        assert_eq!(outcome.status, expected);
    }

    #[rstest]
    #[case::after_success(phase("Completed"))]
    #[case::after_failure(phase("Failed"))]
    #[tokio::test]
    async fn absent_instance_overrides_to_killed(#[case] terminal: ResourceEvent) {
        let api = api_with(vec![terminal]);
        let outcome = watch(&api, &manifest(), settings(), &ctx(false)).await;
        assert_eq!(outcome.status, WatchOutcome::Killed);
        assert_eq!(outcome.exit_code(), 137);
    }

    #[tokio::test]
    async fn failure_attaches_log_tail() {
        let api = api_with(vec![phase("Failed")]);
        let outcome = watch(&api, &manifest(), settings(), &ctx(true)).await;
        let message = outcome.message.unwrap();
        assert!(message.contains("etl-7 failed"));
        assert!(message.contains("Traceback: boom"));
    }

    #[tokio::test]
    async fn log_fetch_failure_keeps_outcome() {
        let mut api = MockWorkloadApi::new();
        api.expect_watch()
            .return_once(|_, _| Ok(stream::iter(vec![phase("Failed")]).boxed()));
        api.expect_tail_log()
            .returning(|_, _, _, _| Err(Error::validation("no pod found for etl-7")));

        let outcome = watch(&api, &manifest(), settings(), &ctx(true)).await;
        assert_eq!(outcome.status, WatchOutcome::Failure);
        assert_eq!(outcome.message.as_deref(), Some("job etl-7 failed"));
    }

    #[tokio::test]
    async fn success_does_not_fetch_logs() {
        let mut api = MockWorkloadApi::new();
        api.expect_watch()
            .return_once(|_, _| Ok(stream::iter(vec![phase("Completed")]).boxed()));
        api.expect_tail_log().never();

        let outcome = watch(&api, &manifest(), settings(), &ctx(true)).await;
        assert!(outcome.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_wait_times_out_as_failure() {
        let mut api = MockWorkloadApi::new();
        api.expect_watch()
            .return_once(|_, _| Ok(stream::pending().boxed()));
        api.expect_tail_log().returning(|_, _, _, _| Ok(String::new()));

        let settings = WatchSettings {
            timeout: Some(Duration::from_secs(60)),
            log_tail_lines: 10,
        };
        let outcome = watch(&api, &manifest(), settings, &ctx(true)).await;
        assert_eq!(outcome.status, WatchOutcome::Failure);
        assert_eq!(outcome.message.as_deref(), Some("timed out after 60s"));
    }

    #[tokio::test]
    async fn cancelled_token_resolves_as_killed() {
        let mut api = MockWorkloadApi::new();
        api.expect_watch()
            .return_once(|_, _| Ok(stream::pending().boxed()));
        api.expect_tail_log().never();

        let ctx = ctx(true);
        ctx.token().cancel();
        let outcome = watch(&api, &manifest(), settings(), &ctx).await;
        assert_eq!(outcome.status, WatchOutcome::Killed);
    }

    #[tokio::test]
    async fn watch_start_failure_is_a_failure_outcome() {
        let mut api = MockWorkloadApi::new();
        api.expect_watch()
            .return_once(|_, _| Err(Error::cluster("prod", "forbidden")));
        api.expect_tail_log().returning(|_, _, _, _| Ok(String::new()));

        let outcome = watch(&api, &manifest(), settings(), &ctx(true)).await;
        assert_eq!(outcome.status, WatchOutcome::Failure);
    }

    #[test]
    fn live_instance_set() {
        let set = LiveInstanceSet::new();
        set.insert(3);
        assert!(set.contains(3));
        set.remove(3);
        assert!(!set.contains(3));
    }

    #[test]
    fn child_context_follows_parent_token() {
        let parent = ctx(true);
        let child = parent.child();
        assert!(!child.is_cancelled());
        parent.token().cancel();
        assert!(child.is_cancelled());
    }
}
