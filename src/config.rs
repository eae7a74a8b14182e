use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the synthesizer
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Relational store settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Generated nginx configuration settings
    #[serde(default)]
    pub nginx: NginxConfig,

    /// Kubernetes client settings
    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    /// Run scheduling settings
    #[serde(default)]
    pub run: RunConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file (default: lbsync.db)
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NginxConfig {
    /// Namespace holding the proxy's own config maps (default: lb--nginx)
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Label selector for nodes dedicated to load balancing (default: lb=nginx)
    #[serde(default = "default_node_selector")]
    pub node_selector: String,

    /// `max_fails` emitted on pod-mode upstream servers (default: 8)
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// `fail_timeout` in seconds emitted on pod-mode upstream servers (default: 3)
    #[serde(default = "default_fail_timeout")]
    pub fail_timeout_secs: u64,

    /// Service version assumed when a binding leaves it empty (default: "1")
    #[serde(default = "default_version")]
    pub default_version: String,

    /// Field manager recorded on config map writes (default: lbsync)
    #[serde(default = "default_field_manager")]
    pub field_manager: String,
}

impl NginxConfig {
    pub fn fail_timeout(&self) -> Duration {
        Duration::from_secs(self.fail_timeout_secs)
    }
}

impl Default for NginxConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            node_selector: default_node_selector(),
            max_fails: default_max_fails(),
            fail_timeout_secs: default_fail_timeout(),
            default_version: default_version(),
            field_manager: default_field_manager(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct KubernetesConfig {
    /// Path to a kubeconfig file (default: KUBECONFIG or ~/.kube/config)
    pub kubeconfig: Option<String>,

    /// Cluster name -> kubeconfig context. Clusters not listed use a context
    /// with the same name as the cluster.
    #[serde(default)]
    pub contexts: HashMap<String, String>,
}

impl KubernetesConfig {
    /// Kubeconfig context used to reach the named cluster
    pub fn context_for<'a>(&'a self, cluster: &'a str) -> &'a str {
        self.contexts
            .get(cluster)
            .map(String::as_str)
            .unwrap_or(cluster)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunConfig {
    /// Number of clusters processed at once (default: 1, sequential)
    #[serde(default = "default_cluster_concurrency")]
    pub cluster_concurrency: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            cluster_concurrency: default_cluster_concurrency(),
        }
    }
}

// Default value functions
fn default_store_path() -> String {
    "lbsync.db".to_string()
}

fn default_namespace() -> String {
    "lb--nginx".to_string()
}

fn default_node_selector() -> String {
    "lb=nginx".to_string()
}

fn default_max_fails() -> u32 {
    8
}

fn default_fail_timeout() -> u64 {
    3
}

fn default_version() -> String {
    "1".to_string()
}

fn default_field_manager() -> String {
    "lbsync".to_string()
}

fn default_cluster_concurrency() -> usize {
    1
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.store.path.trim().is_empty() {
            errors.push("store.path must not be empty".to_string());
        }
        if self.nginx.namespace.trim().is_empty() {
            errors.push("nginx.namespace must not be empty".to_string());
        }
        if self.nginx.default_version.trim().is_empty() {
            errors.push("nginx.default_version must not be empty".to_string());
        }
        if self.nginx.field_manager.trim().is_empty() {
            errors.push("nginx.field_manager must not be empty".to_string());
        }
        if self.run.cluster_concurrency == 0 {
            errors.push("run.cluster_concurrency must be greater than 0".to_string());
        }
        for (cluster, context) in &self.kubernetes.contexts {
            if context.trim().is_empty() {
                errors.push(format!("kubernetes.contexts.{}: context must not be empty", cluster));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
