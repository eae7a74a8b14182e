//! Backend discovery for load-balancer bindings
//!
//! Pod-mode bindings target endpoint addresses directly. Node-mode bindings
//! target the service's node port on every ready load-balancer node. Lookup
//! failures are never fatal: they are logged and yield no backends.

use crate::canary::select_canary;
use crate::config::NginxConfig;
use crate::db::{LbMethod, LbServiceRecord};
use crate::orchestrator::Orchestrator;
use tracing::{debug, info, warn};

/// Resolves upstream server lines from live cluster state
#[derive(Debug, Clone)]
pub struct TopologyResolver {
    node_selector: String,
    max_fails: u32,
    fail_timeout_secs: u64,
    default_version: String,
}

impl TopologyResolver {
    pub fn new(nginx: &NginxConfig) -> Self {
        Self {
            node_selector: nginx.node_selector.clone(),
            max_fails: nginx.max_fails,
            fail_timeout_secs: nginx.fail_timeout().as_secs(),
            default_version: nginx.default_version.clone(),
        }
    }

    /// Full backend list for a binding.
    ///
    /// Node-mode bindings get the canary prefix ahead of the main topology.
    /// Pod-mode upstreams address pods directly and never carry canary lines.
    pub async fn backends(
        &self,
        client: &dyn Orchestrator,
        service: &LbServiceRecord,
    ) -> Vec<String> {
        let mut servers = match service.lb_method {
            LbMethod::Node => self.canary_servers(client, service).await,
            LbMethod::Pod => Vec::new(),
        };
        servers.extend(self.resolve(client, service).await);
        servers
    }

    /// Main topology for a binding, by its balancing method
    pub async fn resolve(
        &self,
        client: &dyn Orchestrator,
        service: &LbServiceRecord,
    ) -> Vec<String> {
        let namespace = service.namespace();
        let name = service.versioned_service_name(&self.default_version);

        match service.lb_method {
            LbMethod::Pod => self.pod_servers(client, &namespace, &name).await,
            LbMethod::Node => self.node_servers(client, &namespace, &name).await,
        }
    }

    /// Canary prefix of the flow service's node-mode backends
    pub async fn canary_servers(
        &self,
        client: &dyn Orchestrator,
        service: &LbServiceRecord,
    ) -> Vec<String> {
        if service.percent <= 0 {
            return Vec::new();
        }

        let namespace = service.namespace();
        let candidates = self
            .node_servers(client, &namespace, &service.flow_service_name)
            .await;
        let selected = select_canary(&candidates, service.percent).to_vec();

        info!(
            domain = %service.domain,
            flow_service = %service.flow_service_name,
            percent = service.percent,
            candidates = candidates.len(),
            selected = selected.len(),
            "Selected canary backends"
        );
        selected
    }

    /// One server line per endpoint address, on the subset's first port
    pub async fn pod_servers(
        &self,
        client: &dyn Orchestrator,
        namespace: &str,
        name: &str,
    ) -> Vec<String> {
        let subsets = match client.get_endpoints(namespace, name).await {
            Ok(subsets) => subsets,
            Err(e) => {
                warn!(namespace, service = name, error = %e, "Failed to get endpoints");
                return Vec::new();
            }
        };

        let mut servers = Vec::new();
        for subset in &subsets {
            let Some(port) = subset.ports.first() else {
                continue;
            };
            for address in &subset.addresses {
                servers.push(format!(
                    "    server {}:{} max_fails={} fail_timeout={}s;",
                    address, port, self.max_fails, self.fail_timeout_secs
                ));
            }
        }
        servers
    }

    /// One server line per ready node, on the service's node port
    pub async fn node_servers(
        &self,
        client: &dyn Orchestrator,
        namespace: &str,
        name: &str,
    ) -> Vec<String> {
        let service = match client.get_service(namespace, name).await {
            Ok(service) => service,
            Err(e) => {
                warn!(namespace, service = name, error = %e, "Failed to get service");
                return Vec::new();
            }
        };

        let Some(first) = service.ports.first() else {
            debug!(namespace, service = name, "Service exposes no ports");
            return Vec::new();
        };
        let Some(node_port) = first.node_port else {
            warn!(namespace, service = name, port = first.port, "Service port has no node port");
            return Vec::new();
        };

        self.ready_node_servers(client, node_port).await
    }

    /// Server lines for every ready node, preferring nodes labeled for load balancing
    pub async fn ready_node_servers(
        &self,
        client: &dyn Orchestrator,
        node_port: u16,
    ) -> Vec<String> {
        let mut nodes = match client.list_nodes(Some(&self.node_selector)).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(
                    selector = %self.node_selector,
                    error = %e,
                    "Failed to list load balancer nodes"
                );
                Vec::new()
            }
        };

        if nodes.is_empty() {
            debug!(selector = %self.node_selector, "No labeled nodes, using all nodes");
            nodes = match client.list_nodes(None).await {
                Ok(nodes) => nodes,
                Err(e) => {
                    warn!(error = %e, "Failed to list nodes");
                    return Vec::new();
                }
            };
        }

        nodes
            .iter()
            .filter(|node| node.is_ready())
            .map(|node| format!("    server {}:{};", node.name, node_port))
            .collect()
    }
}
