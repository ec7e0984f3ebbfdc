//! Job-specific error types
//!
//! Only compilation and submission failures are errors. Anything that goes
//! wrong while watching ends up inside the returned outcome instead.

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// A request field could not be turned into manifest content
    #[error("failed to parse {field}: {message}")]
    ManifestParse {
        /// Request field that was rejected, e.g. `command`
        field: String,
        /// Parser message
        message: String,
    },

    /// A workload template failed to load or has the wrong shape
    #[error("template '{name}' is unusable: {message}")]
    Template {
        /// Template name, e.g. `queue-job`
        name: String,
        /// What was wrong with it
        message: String,
    },

    /// A call against the target cluster failed
    #[error("cluster communication failed for {cluster}: {source}")]
    ClusterCommunication {
        /// Cluster identifier or master URL
        cluster: String,
        /// The underlying client error
        #[source]
        source: kubetask_common::Error,
    },

    /// A fan-out item has no fetch spec at its index
    #[error("no fetch spec for fan-out item {index}")]
    MissingFetchSpec {
        /// Zero-based item index
        index: usize,
    },

    /// The request is inconsistent before anything is compiled
    #[error("invalid execution request: {0}")]
    InvalidRequest(String),

    /// JSON conversion of a manifest failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Error from the shared common crate
    #[error("{0}")]
    Common(#[from] kubetask_common::Error),

    /// The batch-result endpoint rejected or missed the post
    #[error("batch callback failed: {0}")]
    Callback(String),
}

impl JobError {
    pub fn parse(field: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::ManifestParse {
            field: field.into(),
            message: message.to_string(),
        }
    }

    pub fn cluster(cluster: impl Into<String>, source: kubetask_common::Error) -> Self {
        Self::ClusterCommunication {
            cluster: cluster.into(),
            source,
        }
    }

    /// Whether a cached client for the cluster should be dropped
    pub fn is_cluster_failure(&self) -> bool {
        match self {
            Self::ClusterCommunication { .. } => true,
            Self::Common(e) => e.is_cluster_failure(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, JobError>;
