//! Cluster client provider
//!
//! Resolves a cluster identifier to a `kube::Client`. Most kinds authenticate
//! with a stored kubeconfig; operator kinds that talk to a bare master URL get
//! an unauthenticated client. Clients are cached per target and dropped on
//! demand when a call against them fails.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::{debug, info};

use crate::{Error, Result};

/// Which cluster endpoint a client should talk to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClusterTarget {
    /// Authenticated access through the kubeconfig stored for this identifier
    Kubeconfig {
        /// Opaque cluster identifier
        cluster: String,
    },
    /// Unauthenticated access to an API server URL
    MasterUrl(String),
}

impl ClusterTarget {
    /// Target for a stored kubeconfig
    pub fn cluster(cluster: impl Into<String>) -> Self {
        Self::Kubeconfig {
            cluster: cluster.into(),
        }
    }

    fn cache_key(&self) -> String {
        match self {
            Self::Kubeconfig { cluster } => format!("kubeconfig:{}", cluster),
            Self::MasterUrl(url) => format!("url:{}", url),
        }
    }
}

impl fmt::Display for ClusterTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kubeconfig { cluster } => write!(f, "{}", cluster),
            Self::MasterUrl(url) => write!(f, "{}", url),
        }
    }
}

/// Looks up the kubeconfig YAML stored for a cluster identifier
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait KubeconfigResolver: Send + Sync {
    /// Raw kubeconfig document for `cluster`
    async fn kubeconfig(&self, cluster: &str) -> Result<String>;
}

/// Resolver backed by a map of identifier to kubeconfig file
#[derive(Clone, Debug, Default)]
pub struct FileKubeconfigResolver {
    paths: BTreeMap<String, PathBuf>,
}

impl FileKubeconfigResolver {
    /// Create a resolver over the given files
    pub fn new(paths: BTreeMap<String, PathBuf>) -> Self {
        Self { paths }
    }
}

#[async_trait::async_trait]
impl KubeconfigResolver for FileKubeconfigResolver {
    async fn kubeconfig(&self, cluster: &str) -> Result<String> {
        let path = self
            .paths
            .get(cluster)
            .ok_or_else(|| Error::cluster(cluster, "no kubeconfig registered"))?;
        tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::cluster(
                cluster,
                format!("failed to read kubeconfig {}: {}", path.display(), e),
            )
        })
    }
}

/// Trait for obtaining Kubernetes clients per cluster
///
/// Abstracts client construction so callers can be tested without a cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ClusterClientProvider: Send + Sync {
    /// Client bound to `target`
    async fn client(&self, target: &ClusterTarget) -> Result<Client>;

    /// Forget any cached client for `target`
    fn invalidate(&self, target: &ClusterTarget);
}

/// Client provider with a keyed cache
///
/// `kube::Client` is cheap to clone and shares its connection pool, so one
/// instance per target is kept until [`ClusterClientProvider::invalidate`].
pub struct CachedClientProvider {
    resolver: Arc<dyn KubeconfigResolver>,
    clients: DashMap<String, Client>,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl CachedClientProvider {
    /// Create a provider with the given timeouts
    pub fn new(
        resolver: Arc<dyn KubeconfigResolver>,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Self {
        Self {
            resolver,
            clients: DashMap::new(),
            connect_timeout,
            read_timeout,
        }
    }

    /// Number of cached clients
    pub fn cached(&self) -> usize {
        self.clients.len()
    }

    async fn build(&self, target: &ClusterTarget) -> Result<Client> {
        let mut config = match target {
            ClusterTarget::Kubeconfig { cluster } => {
                let raw = self.resolver.kubeconfig(cluster).await?;
                config_from_kubeconfig(cluster, &raw).await?
            }
            ClusterTarget::MasterUrl(url) => {
                let uri: http::Uri = url
                    .parse()
                    .map_err(|e| Error::cluster(url, format!("invalid master URL: {}", e)))?;
                Config::new(uri)
            }
        };
        config.connect_timeout = Some(self.connect_timeout);
        config.read_timeout = Some(self.read_timeout);
        Client::try_from(config)
            .map_err(|e| Error::cluster(target.to_string(), format!("failed to create client: {}", e)))
    }
}

#[async_trait::async_trait]
impl ClusterClientProvider for CachedClientProvider {
    async fn client(&self, target: &ClusterTarget) -> Result<Client> {
        let key = target.cache_key();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let client = self.build(target).await?;
        // Concurrent misses may both build; the first insert wins and the
        // loser's client is dropped.
        let client = self.clients.entry(key).or_insert(client).clone();
        info!(cluster = %target, "created cluster client");
        Ok(client)
    }

    fn invalidate(&self, target: &ClusterTarget) {
        if self.clients.remove(&target.cache_key()).is_some() {
            debug!(cluster = %target, "dropped cached cluster client");
        }
    }
}

/// Parse a kubeconfig document into a client config
pub async fn config_from_kubeconfig(cluster: &str, raw: &str) -> Result<Config> {
    let kubeconfig = Kubeconfig::from_yaml(raw)
        .map_err(|e| Error::cluster(cluster, format!("failed to parse kubeconfig: {}", e)))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::cluster(cluster, format!("failed to load kubeconfig: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
  - name: test
    cluster:
      server: https://127.0.0.1:6443
      insecure-skip-tls-verify: true
contexts:
  - name: test
    context:
      cluster: test
      user: test
current-context: test
users:
  - name: test
    user:
      token: abc123
"#;

    fn provider(resolver: MockKubeconfigResolver) -> CachedClientProvider {
        CachedClientProvider::new(
            Arc::new(resolver),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn kubeconfig_clients_are_cached_per_cluster() {
        let mut resolver = MockKubeconfigResolver::new();
        resolver
            .expect_kubeconfig()
            .with(eq("prod"))
            .times(1)
            .returning(|_| Ok(KUBECONFIG.to_string()));

        let provider = provider(resolver);
        let target = ClusterTarget::cluster("prod");
        provider.client(&target).await.unwrap();
        provider.client(&target).await.unwrap();
        assert_eq!(provider.cached(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_rebuild() {
        let mut resolver = MockKubeconfigResolver::new();
        resolver
            .expect_kubeconfig()
            .times(2)
            .returning(|_| Ok(KUBECONFIG.to_string()));

        let provider = provider(resolver);
        let target = ClusterTarget::cluster("prod");
        provider.client(&target).await.unwrap();
        provider.invalidate(&target);
        assert_eq!(provider.cached(), 0);
        provider.client(&target).await.unwrap();
        assert_eq!(provider.cached(), 1);
    }

    #[tokio::test]
    async fn master_url_needs_no_kubeconfig() {
        let resolver = MockKubeconfigResolver::new();
        let provider = provider(resolver);
        provider
            .client(&ClusterTarget::MasterUrl("https://10.0.0.1:6443".to_string()))
            .await
            .unwrap();
        assert_eq!(provider.cached(), 1);
    }

    #[tokio::test]
    async fn garbage_kubeconfig_is_a_communication_error() {
        let mut resolver = MockKubeconfigResolver::new();
        resolver
            .expect_kubeconfig()
            .returning(|_| Ok("not: [a, kubeconfig".to_string()));

        let err = provider(resolver)
            .client(&ClusterTarget::cluster("broken"))
            .await
            .err()
            .expect("expected an error");
        assert!(matches!(err, Error::ClusterCommunication { ref cluster, .. } if cluster == "broken"));
    }

    #[tokio::test]
    async fn unknown_cluster_in_file_resolver() {
        let resolver = FileKubeconfigResolver::default();
        let err = resolver.kubeconfig("missing").await.unwrap_err();
        assert!(err.is_cluster_failure());
    }
}
