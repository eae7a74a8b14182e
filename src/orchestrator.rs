//! Orchestrator capability used to read topology and write config maps
//!
//! The synthesizer never talks to a "current" cluster. Every client is
//! obtained by name from a [`ClientFactory`], and a [`ClientCache`] memoizes
//! those clients for the duration of one run.

use crate::error::OrchestratorError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// One subset of a service's endpoints: every address serves every port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndpointSubset {
    pub addresses: Vec<String>,
    pub ports: Vec<u16>,
}

/// A port exposed by a service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePort {
    pub port: u16,
    pub node_port: Option<u16>,
}

/// Port information for a service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceInfo {
    pub name: String,
    pub ports: Vec<ServicePort>,
}

/// A node condition as reported by the node itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCondition {
    pub kind: String,
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeInfo {
    pub name: String,
    pub conditions: Vec<NodeCondition>,
}

impl NodeInfo {
    /// Whether the node reports `Ready=True`
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }
}

/// A named key/value config object to be written to a cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigObject {
    pub name: String,
    pub data: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Read and write access to one cluster
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Endpoint subsets of a service
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<EndpointSubset>, OrchestratorError>;

    /// Ports of a service
    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceInfo, OrchestratorError>;

    /// Nodes matching a label selector, or all nodes when `None`
    async fn list_nodes(
        &self,
        label_selector: Option<&str>,
    ) -> Result<Vec<NodeInfo>, OrchestratorError>;

    /// Entries of a config object, `None` if it does not exist
    async fn get_config_object(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, OrchestratorError>;

    /// Create or update a batch of config objects in one call
    async fn update_config_objects(
        &self,
        namespace: &str,
        objects: &[ConfigObject],
    ) -> Result<(), OrchestratorError>;
}

/// Builds orchestrator clients by cluster name
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn Orchestrator>, OrchestratorError>;
}

/// Memoizes clients per cluster for one run
pub struct ClientCache {
    factory: Arc<dyn ClientFactory>,
    clients: Mutex<HashMap<String, Arc<dyn Orchestrator>>>,
}

impl ClientCache {
    pub fn new(factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            factory,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Get the client for a cluster, connecting on first use.
    ///
    /// The lock is not held while connecting, so one slow cluster does not
    /// hold up the others. If two callers race on the same cluster, the
    /// first client stored wins. Failed connections are not cached.
    pub async fn get_client(
        &self,
        cluster: &str,
    ) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        if let Some(client) = self.clients.lock().await.get(cluster) {
            return Ok(Arc::clone(client));
        }

        debug!(cluster, "Connecting to cluster");
        let client = self.factory.connect(cluster).await?;

        let mut clients = self.clients.lock().await;
        let stored = clients.entry(cluster.to_string()).or_insert(client);
        Ok(Arc::clone(stored))
    }
}
