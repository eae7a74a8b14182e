//! Kubernetes implementation of the orchestrator capability

use crate::config::KubernetesConfig;
use crate::error::OrchestratorError;
use crate::orchestrator::{
    ClientFactory, ConfigObject, EndpointSubset, NodeCondition, NodeInfo, Orchestrator, ServiceInfo,
    ServicePort,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

fn map_err(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> OrchestratorError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => {
            OrchestratorError::not_found(kind, namespace, name)
        }
        other => OrchestratorError::Api(format!("{} {}/{}: {}", kind, namespace, name, other)),
    }
}

fn to_port(value: i32) -> Option<u16> {
    u16::try_from(value).ok().filter(|p| *p > 0)
}

/// Flatten an Endpoints object into address/port subsets
pub fn endpoint_subsets(endpoints: &Endpoints) -> Vec<EndpointSubset> {
    endpoints
        .subsets
        .iter()
        .flatten()
        .map(|subset| EndpointSubset {
            addresses: subset
                .addresses
                .iter()
                .flatten()
                .map(|a| a.ip.clone())
                .collect(),
            ports: subset
                .ports
                .iter()
                .flatten()
                .filter_map(|p| to_port(p.port))
                .collect(),
        })
        .collect()
}

/// Extract port information from a Service
pub fn service_info(service: &Service) -> ServiceInfo {
    let ports = service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .filter_map(|p| {
                    to_port(p.port).map(|port| ServicePort {
                        port,
                        node_port: p.node_port.and_then(to_port),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    ServiceInfo {
        name: service.metadata.name.clone().unwrap_or_default(),
        ports,
    }
}

/// Extract name and conditions from a Node
pub fn node_info(node: &Node) -> NodeInfo {
    NodeInfo {
        name: node.metadata.name.clone().unwrap_or_default(),
        conditions: node
            .status
            .as_ref()
            .and_then(|s| s.conditions.as_ref())
            .map(|conditions| {
                conditions
                    .iter()
                    .map(|c| NodeCondition {
                        kind: c.type_.clone(),
                        status: c.status.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// Orchestrator backed by one Kubernetes cluster
pub struct KubeOrchestrator {
    client: Client,
    field_manager: String,
}

impl KubeOrchestrator {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    async fn write_config_map(
        &self,
        api: &Api<ConfigMap>,
        namespace: &str,
        object: &ConfigObject,
    ) -> Result<(), OrchestratorError> {
        // Merge patch: entries absent from `data` stay as they were
        let patch = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": object.name,
                "annotations": object.annotations,
            },
            "data": object.data,
        });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..PatchParams::default()
        };

        match api.patch(&object.name, &params, &Patch::Merge(&patch)).await {
            Ok(_) => {
                debug!(
                    namespace,
                    name = %object.name,
                    entries = object.data.len(),
                    "Config map updated"
                );
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(object.name.clone()),
                        namespace: Some(namespace.to_string()),
                        annotations: Some(object.annotations.clone()),
                        ..ObjectMeta::default()
                    },
                    data: Some(object.data.clone()),
                    ..ConfigMap::default()
                };
                let params = PostParams {
                    field_manager: Some(self.field_manager.clone()),
                    ..PostParams::default()
                };
                api.create(&params, &config_map)
                    .await
                    .map_err(|e| map_err("ConfigMap", namespace, &object.name, e))?;
                info!(
                    namespace,
                    name = %object.name,
                    entries = object.data.len(),
                    "Config map created"
                );
                Ok(())
            }
            Err(e) => Err(map_err("ConfigMap", namespace, &object.name, e)),
        }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn get_endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<EndpointSubset>, OrchestratorError> {
        let api = Api::<Endpoints>::namespaced(self.client.clone(), namespace);
        let endpoints = api
            .get(name)
            .await
            .map_err(|e| map_err("Endpoints", namespace, name, e))?;
        Ok(endpoint_subsets(&endpoints))
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ServiceInfo, OrchestratorError> {
        let api = Api::<Service>::namespaced(self.client.clone(), namespace);
        let service = api
            .get(name)
            .await
            .map_err(|e| map_err("Service", namespace, name, e))?;
        Ok(service_info(&service))
    }

    async fn list_nodes(
        &self,
        label_selector: Option<&str>,
    ) -> Result<Vec<NodeInfo>, OrchestratorError> {
        let api = Api::<Node>::all(self.client.clone());
        let params = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        let nodes = api
            .list(&params)
            .await
            .map_err(|e| OrchestratorError::Api(format!("listing nodes: {}", e)))?;
        Ok(nodes.items.iter().map(node_info).collect())
    }

    async fn get_config_object(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, String>>, OrchestratorError> {
        let api = Api::<ConfigMap>::namespaced(self.client.clone(), namespace);
        let config_map = api
            .get_opt(name)
            .await
            .map_err(|e| map_err("ConfigMap", namespace, name, e))?;
        Ok(config_map.map(|cm| cm.data.unwrap_or_default()))
    }

    async fn update_config_objects(
        &self,
        namespace: &str,
        objects: &[ConfigObject],
    ) -> Result<(), OrchestratorError> {
        let api = Api::<ConfigMap>::namespaced(self.client.clone(), namespace);
        for object in objects {
            self.write_config_map(&api, namespace, object).await?;
        }
        Ok(())
    }
}

/// Connects to clusters through kubeconfig contexts
pub struct KubeClientFactory {
    kubernetes: KubernetesConfig,
    field_manager: String,
}

impl KubeClientFactory {
    pub fn new(kubernetes: KubernetesConfig, field_manager: &str) -> Self {
        Self {
            kubernetes,
            field_manager: field_manager.to_string(),
        }
    }

    fn read_kubeconfig(&self) -> Result<Kubeconfig, kube::config::KubeconfigError> {
        match &self.kubernetes.kubeconfig {
            Some(path) => Kubeconfig::read_from(path),
            None => Kubeconfig::read(),
        }
    }
}

#[async_trait]
impl ClientFactory for KubeClientFactory {
    async fn connect(&self, cluster: &str) -> Result<Arc<dyn Orchestrator>, OrchestratorError> {
        let client_err = |message: String| OrchestratorError::Client {
            cluster: cluster.to_string(),
            message,
        };

        let context = self.kubernetes.context_for(cluster);
        let kubeconfig = self.read_kubeconfig().map_err(|e| client_err(e.to_string()))?;
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..KubeConfigOptions::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| client_err(e.to_string()))?;
        let client = Client::try_from(config).map_err(|e| client_err(e.to_string()))?;

        debug!(cluster, context, "Kubernetes client ready");
        Ok(Arc::new(KubeOrchestrator::new(client, &self.field_manager)))
    }
}
