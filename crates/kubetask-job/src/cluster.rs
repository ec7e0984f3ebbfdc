//! Cluster-facing seam for workloads
//!
//! [`WorkloadApi`] is the handful of calls the engine makes against one
//! resource kind in one cluster. [`WorkloadBackend`] hands out those APIs per
//! target, backed by the cached client provider. Both are traits so the
//! submission, watch and fan-out logic can be tested without a cluster.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, PostParams};
use kube::core::ApiResource;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use kubetask_common::error::is_not_found;
use kubetask_common::{
    ClusterClientProvider, ClusterTarget, CrdKind, CrdRegistry, Error, Result, NAME_LABEL,
};
use serde_json::Value;
use tracing::{debug, warn};

/// Change observed on a watched resource
#[derive(Clone, Debug, PartialEq)]
pub enum ResourceEvent {
    /// Created or modified; carries the full object
    Applied(Value),
    Deleted,
    /// The watch channel reported an error
    Error(String),
}

/// Stream of log lines from a container
pub type LogLines = BoxStream<'static, std::io::Result<String>>;

/// Operations against one resource kind in one cluster
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool>;

    async fn create(&self, namespace: &str, object: &Value) -> Result<()>;

    /// Delete by name; a missing object is not an error
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Events for the single object called `name`
    async fn watch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, ResourceEvent>>;

    /// Follow the log of `container` in the first pod labelled `name=<job_name>`
    async fn log_lines(&self, namespace: &str, job_name: &str, container: &str)
        -> Result<LogLines>;

    /// Last `lines` lines of that same container
    async fn tail_log(
        &self,
        namespace: &str,
        job_name: &str,
        container: &str,
        lines: i64,
    ) -> Result<String>;
}

/// Source of [`WorkloadApi`]s per cluster target
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkloadBackend: Send + Sync {
    async fn api(&self, target: &ClusterTarget, kind: CrdKind) -> Result<Arc<dyn WorkloadApi>>;

    /// Drop any cached connection for `target`
    fn invalidate(&self, target: &ClusterTarget);
}

/// Backend over real clusters
pub struct KubeBackend {
    provider: Arc<dyn ClusterClientProvider>,
    crds: Arc<CrdRegistry>,
}

impl KubeBackend {
    pub fn new(provider: Arc<dyn ClusterClientProvider>, crds: Arc<CrdRegistry>) -> Self {
        Self { provider, crds }
    }
}

#[async_trait]
impl WorkloadBackend for KubeBackend {
    async fn api(&self, target: &ClusterTarget, kind: CrdKind) -> Result<Arc<dyn WorkloadApi>> {
        let client = self.provider.client(target).await?;
        Ok(Arc::new(KubeWorkloadApi::new(client, self.crds.resolve(kind))))
    }

    fn invalidate(&self, target: &ClusterTarget) {
        self.provider.invalidate(target);
    }
}

/// [`WorkloadApi`] over `Api<DynamicObject>`
pub struct KubeWorkloadApi {
    client: Client,
    resource: ApiResource,
}

impl KubeWorkloadApi {
    pub fn new(client: Client, resource: ApiResource) -> Self {
        Self { client, resource }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }

    async fn pod_for(&self, namespace: &str, job_name: &str) -> Result<String> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods.list(&ListParams::default().labels(&pod_selector(job_name))).await?;
        select_pod(list.items, job_name)
            .ok_or_else(|| Error::validation(format!("no pod found for {}", job_name)))
    }
}

/// The initial list counts like an update: a job that finished before the
/// watch opened only ever shows its terminal status there.
fn resource_event(event: Event<DynamicObject>) -> Option<ResourceEvent> {
    match event {
        Event::Apply(obj) | Event::InitApply(obj) => match serde_json::to_value(&obj) {
            Ok(value) => Some(ResourceEvent::Applied(value)),
            Err(e) => Some(ResourceEvent::Error(e.to_string())),
        },
        Event::Delete(_) => Some(ResourceEvent::Deleted),
        Event::Init | Event::InitDone => None,
    }
}

/// Label selector matching the pods of one compiled workload. Name prefixes
/// are ambiguous: job `a-1` would also match pods of job `a-1-5`.
fn pod_selector(job_name: &str) -> String {
    format!("{}={}", NAME_LABEL, job_name)
}

/// First pod labelled as belonging to `job_name`
fn select_pod(pods: Vec<Pod>, job_name: &str) -> Option<String> {
    pods.into_iter()
        .filter(|p| {
            p.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(NAME_LABEL))
                .is_some_and(|v| v == job_name)
        })
        .find_map(|p| p.metadata.name)
}

#[async_trait]
impl WorkloadApi for KubeWorkloadApi {
    async fn exists(&self, namespace: &str, name: &str) -> Result<bool> {
        Ok(self.api(namespace).get_opt(name).await?.is_some())
    }

    async fn create(&self, namespace: &str, object: &Value) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(object.clone())?;
        self.api(namespace)
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .api(namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(name = %name, "Resource already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, ResourceEvent>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let stream = watcher::watcher(self.api(namespace), config).filter_map(|event| async move {
            match event {
                Ok(event) => resource_event(event),
                Err(e) => {
                    warn!(error = %e, "Watch stream error");
                    Some(ResourceEvent::Error(e.to_string()))
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn log_lines(
        &self,
        namespace: &str,
        job_name: &str,
        container: &str,
    ) -> Result<LogLines> {
        let pod = self.pod_for(namespace, job_name).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            follow: true,
            ..Default::default()
        };
        let reader = pods.log_stream(&pod, &params).await?;
        Ok(reader.lines().boxed())
    }

    async fn tail_log(
        &self,
        namespace: &str,
        job_name: &str,
        container: &str,
        lines: i64,
    ) -> Result<String> {
        let pod = self.pod_for(namespace, job_name).await?;
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(lines),
            ..Default::default()
        };
        Ok(pods.logs(&pod, &params).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mockall::mock! {
        ClusterClientProvider {}

        #[async_trait]
        impl ClusterClientProvider for ClusterClientProvider {
            async fn client(&self, target: &ClusterTarget) -> Result<Client>;
            fn invalidate(&self, target: &ClusterTarget);
        }
    }

    #[tokio::test]
    async fn backend_surfaces_client_errors() {
        let mut provider = MockClusterClientProvider::new();
        provider
            .expect_client()
            .returning(|target| Err(Error::cluster(target.to_string(), "unreachable")));
        let backend = KubeBackend::new(Arc::new(provider), Arc::new(CrdRegistry::standard()));

        let err = match backend
            .api(&ClusterTarget::cluster("prod"), CrdKind::VolcanoJob)
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(err.is_cluster_failure());
    }

    fn pod(name: &str, job: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(name.to_string());
        pod.metadata.labels = Some(std::collections::BTreeMap::from([(
            NAME_LABEL.to_string(),
            job.to_string(),
        )]));
        pod
    }

    #[test]
    fn pod_selection_ignores_jobs_sharing_a_name_prefix() {
        let pods = vec![pod("a-1-5-xyz12", "a-1-5"), pod("a-1-k8d2p", "a-1")];
        assert_eq!(select_pod(pods, "a-1").as_deref(), Some("a-1-k8d2p"));
        assert_eq!(pod_selector("a-1"), "name=a-1");
    }

    #[test]
    fn pod_selection_finds_nothing_for_foreign_pods() {
        let pods = vec![pod("a-1-5-xyz12", "a-1-5"), Pod::default()];
        assert!(select_pod(pods, "a-1").is_none());
    }

    fn job_object(phase: &str) -> DynamicObject {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "batch.volcano.sh/v1alpha1",
            "kind": "Job",
            "metadata": { "name": "etl-7", "namespace": "jobs" },
            "status": { "state": { "phase": phase } }
        }))
        .unwrap()
    }

    #[test]
    fn initial_list_carries_status_of_finished_jobs() {
        let event = resource_event(Event::InitApply(job_object("Completed"))).unwrap();
        let ResourceEvent::Applied(value) = event else {
            panic!("expected applied event, got {:?}", event);
        };
        assert_eq!(value["status"]["state"]["phase"], "Completed");
    }

    #[test]
    fn list_markers_and_deletes() {
        assert_eq!(resource_event(Event::Init), None);
        assert_eq!(resource_event(Event::InitDone), None);
        assert_eq!(
            resource_event(Event::Delete(job_object("Running"))),
            Some(ResourceEvent::Deleted)
        );
    }

    #[test]
    fn backend_invalidate_delegates() {
        let mut provider = MockClusterClientProvider::new();
        provider
            .expect_invalidate()
            .withf(|t| t == &ClusterTarget::cluster("prod"))
            .times(1)
            .return_const(());
        let backend = KubeBackend::new(Arc::new(provider), Arc::new(CrdRegistry::standard()));
        backend.invalidate(&ClusterTarget::cluster("prod"));
    }
}
