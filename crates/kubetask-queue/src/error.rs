//! Queue-specific error types

/// Errors from queue admission and queued-task bookkeeping
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue '{name}' already exists")]
    QueueExists { name: String },

    #[error("invalid capability: {message}")]
    InvalidCapability { message: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("queue {id} not found")]
    NotFound { id: i64 },

    #[error("cluster operation on {cluster} failed: {source}")]
    Cluster {
        cluster: String,
        #[source]
        source: kubetask_common::Error,
    },

    #[error("repository error: {message}")]
    Repository { message: String },
}

impl QueueError {
    pub fn cluster(cluster: impl Into<String>, source: kubetask_common::Error) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            source,
        }
    }

    pub fn repository(message: impl Into<String>) -> Self {
        Self::Repository {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
