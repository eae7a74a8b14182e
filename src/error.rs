//! Error types shared across the synthesizer

use thiserror::Error;

/// Errors reported by an orchestrator client
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The requested object does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// A client for the cluster could not be constructed
    #[error("failed to build client for cluster {cluster}: {message}")]
    Client { cluster: String, message: String },

    /// Any other API failure
    #[error("orchestrator API error: {0}")]
    Api(String),
}

impl OrchestratorError {
    pub fn not_found(kind: &'static str, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

/// Errors returned across the public run boundary
#[derive(Debug, Error)]
pub enum SyncError {
    /// The config map an incremental update targets has never been published
    #[error("config map {namespace}/{name} does not exist on cluster {cluster}")]
    ConfigObjectMissing {
        cluster: String,
        namespace: String,
        name: String,
    },

    /// No load-balancer binding matches the requested cluster and domain
    #[error("no load balancer service for domain {domain} on cluster {cluster}")]
    ServiceNotFound { cluster: String, domain: String },

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}
