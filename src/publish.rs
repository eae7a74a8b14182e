//! Publication of rendered artifacts into per-cluster config maps
//!
//! Each cluster receives three config maps in the proxy's namespace: vhosts,
//! upstreams and SSL material. A variant suffix (for example `-test`) selects
//! a parallel set of objects. All maps for a cluster go out in one
//! orchestrator call; the call is not transactional, so a failure may leave
//! some maps written.

use crate::error::{OrchestratorError, SyncError};
use crate::orchestrator::{ConfigObject, Orchestrator};
use crate::render::RenderedService;
use crate::template;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{error, info};

/// Suffix used for test-environment objects
pub const TEST_VARIANT: &str = "-test";

/// Annotation carrying the path the proxy mounts an object at
pub const MOUNT_PATH_ANNOTATION: &str = "lbsync.io/mount-path";

/// Annotation carrying a digest of the entries written by the last publish.
///
/// Writes are merge patches, so keys dropped from a later render stay in the
/// live object and are not covered by this digest.
pub const CHECKSUM_ANNOTATION: &str = "lbsync.io/rendered-checksum";

/// Logical category of a config map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArtifactKind {
    /// `<domain>.conf` virtual hosts
    Config,
    /// `<domain>.upstream` upstream blocks
    Upstream,
    /// `<cert>.key` / `<cert>.pem` material
    Ssl,
}

impl ArtifactKind {
    pub fn object_name(&self) -> &'static str {
        match self {
            ArtifactKind::Config => "lb-nginx-config",
            ArtifactKind::Upstream => "lb-nginx-upstream",
            ArtifactKind::Ssl => "lb-nginx-ssl",
        }
    }

    pub fn mount_path(&self) -> &'static str {
        match self {
            ArtifactKind::Config => "conf/vhosts",
            ArtifactKind::Upstream => "conf/upstream",
            ArtifactKind::Ssl => "conf/vhosts/ssl",
        }
    }
}

/// Named entries bound for one config map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub kind: ArtifactKind,
    pub entries: BTreeMap<String, String>,
    pub variant: String,
}

impl ConfigArtifact {
    pub fn new(kind: ArtifactKind, variant: &str) -> Self {
        Self {
            kind,
            entries: BTreeMap::new(),
            variant: variant.to_string(),
        }
    }

    pub fn with_entries(
        kind: ArtifactKind,
        variant: &str,
        entries: BTreeMap<String, String>,
    ) -> Self {
        Self {
            kind,
            entries,
            variant: variant.to_string(),
        }
    }

    /// Config map name including the variant suffix
    pub fn object_name(&self) -> String {
        format!("{}{}", self.kind.object_name(), self.variant)
    }

    /// Hex SHA-256 over this artifact's entries in key order
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.entries {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn to_config_object(&self) -> ConfigObject {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            MOUNT_PATH_ANNOTATION.to_string(),
            self.kind.mount_path().to_string(),
        );
        annotations.insert(CHECKSUM_ANNOTATION.to_string(), self.checksum());

        ConfigObject {
            name: self.object_name(),
            data: self.entries.clone(),
            annotations,
        }
    }
}

/// Accumulates rendered domains for one cluster
#[derive(Debug, Clone)]
pub struct ClusterArtifacts {
    pub config: ConfigArtifact,
    pub upstream: ConfigArtifact,
    pub ssl: ConfigArtifact,
}

impl ClusterArtifacts {
    pub fn new(variant: &str) -> Self {
        Self {
            config: ConfigArtifact::new(ArtifactKind::Config, variant),
            upstream: ConfigArtifact::new(ArtifactKind::Upstream, variant),
            ssl: ConfigArtifact::new(ArtifactKind::Ssl, variant),
        }
    }

    pub fn add(&mut self, rendered: &RenderedService) {
        self.upstream
            .entries
            .insert(rendered.upstream_entry(), rendered.upstream.clone());
        self.config
            .entries
            .insert(rendered.vhost_entry(), rendered.vhost.clone());
        if let Some(cert) = &rendered.cert {
            self.ssl.entries.insert(cert.key_entry(), cert.key.clone());
            self.ssl.entries.insert(cert.pem_entry(), cert.pem.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.config.entries.is_empty()
            && self.upstream.entries.is_empty()
            && self.ssl.entries.is_empty()
    }

    pub fn into_artifacts(self) -> Vec<ConfigArtifact> {
        vec![self.config, self.upstream, self.ssl]
    }
}

/// Writes artifacts into the proxy's namespace
#[derive(Debug, Clone)]
pub struct Publisher {
    namespace: String,
}

impl Publisher {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
        }
    }

    /// Write all artifacts for a cluster in a single call
    pub async fn publish(
        &self,
        client: &dyn Orchestrator,
        cluster: &str,
        artifacts: &[ConfigArtifact],
    ) -> Result<(), OrchestratorError> {
        let objects: Vec<ConfigObject> = artifacts
            .iter()
            .map(ConfigArtifact::to_config_object)
            .collect();
        let names: Vec<&str> = objects.iter().map(|o| o.name.as_str()).collect();

        match client.update_config_objects(&self.namespace, &objects).await {
            Ok(()) => {
                info!(
                    cluster,
                    namespace = %self.namespace,
                    objects = ?names,
                    "Published nginx config"
                );
                Ok(())
            }
            Err(e) => {
                error!(
                    cluster,
                    namespace = %self.namespace,
                    objects = ?names,
                    error = %e,
                    "Failed to publish nginx config"
                );
                Err(e)
            }
        }
    }

    /// Publish prepared vhost and SSL entries to a cluster's test objects
    pub async fn publish_test(
        &self,
        client: &dyn Orchestrator,
        cluster: &str,
        vhosts: BTreeMap<String, String>,
        ssl: BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        let artifacts = [
            ConfigArtifact::with_entries(ArtifactKind::Config, TEST_VARIANT, vhosts),
            ConfigArtifact::with_entries(ArtifactKind::Ssl, TEST_VARIANT, ssl),
        ];
        self.publish(client, cluster, &artifacts).await
    }

    /// Entries of a cluster's published upstream map.
    ///
    /// The map must already exist from a previous full run.
    pub async fn fetch_upstream(
        &self,
        client: &dyn Orchestrator,
        cluster: &str,
        variant: &str,
    ) -> Result<BTreeMap<String, String>, SyncError> {
        let name = format!("{}{}", ArtifactKind::Upstream.object_name(), variant);
        let entries = client.get_config_object(&self.namespace, &name).await?;
        entries.ok_or_else(|| SyncError::ConfigObjectMissing {
            cluster: cluster.to_string(),
            namespace: self.namespace.clone(),
            name: name.clone(),
        })
    }

    /// Replace one domain's entry in a fetched upstream map and republish
    /// the whole map.
    pub async fn update_upstream_entry(
        &self,
        client: &dyn Orchestrator,
        cluster: &str,
        mut entries: BTreeMap<String, String>,
        domain: &str,
        servers: &[String],
        variant: &str,
    ) -> Result<(), OrchestratorError> {
        entries.insert(format!("{}.upstream", domain), template::upstream(domain, servers));

        let artifact = ConfigArtifact::with_entries(ArtifactKind::Upstream, variant, entries);
        self.publish(client, cluster, &[artifact]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::CertMaterial;

    fn rendered(domain: &str, cert: Option<&str>) -> RenderedService {
        RenderedService {
            domain: domain.to_string(),
            upstream: template::upstream(domain, &["    server n1:30080;".to_string()]),
            vhost: template::http_vhost(domain),
            overridden: false,
            cert: cert.map(|id| CertMaterial {
                cert_id: id.to_string(),
                key: "KEY".to_string(),
                pem: "PEM".to_string(),
            }),
        }
    }

    #[test]
    fn test_object_names_with_variant() {
        assert_eq!(ConfigArtifact::new(ArtifactKind::Config, "").object_name(), "lb-nginx-config");
        assert_eq!(
            ConfigArtifact::new(ArtifactKind::Upstream, TEST_VARIANT).object_name(),
            "lb-nginx-upstream-test"
        );
        assert_eq!(ConfigArtifact::new(ArtifactKind::Ssl, "").object_name(), "lb-nginx-ssl");
    }

    #[test]
    fn test_cluster_artifacts_collect_entries() {
        let mut artifacts = ClusterArtifacts::new("");
        assert!(artifacts.is_empty());

        artifacts.add(&rendered("a.example.com", Some("site")));
        artifacts.add(&rendered("b.example.com", None));

        assert_eq!(
            artifacts.config.entries.keys().collect::<Vec<_>>(),
            vec!["a.example.com.conf", "b.example.com.conf"]
        );
        assert_eq!(
            artifacts.upstream.entries.keys().collect::<Vec<_>>(),
            vec!["a.example.com.upstream", "b.example.com.upstream"]
        );
        assert_eq!(artifacts.ssl.entries.get("site.key").map(String::as_str), Some("KEY"));
        assert_eq!(artifacts.ssl.entries.get("site.pem").map(String::as_str), Some("PEM"));
        assert_eq!(artifacts.into_artifacts().len(), 3);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let mut a = ConfigArtifact::new(ArtifactKind::Upstream, "");
        a.entries.insert("a.upstream".to_string(), "x".to_string());
        let mut b = a.clone();
        assert_eq!(a.checksum(), b.checksum());

        b.entries.insert("a.upstream".to_string(), "y".to_string());
        assert_ne!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
    }

    #[test]
    fn test_config_object_annotations() {
        let artifact = ConfigArtifact::new(ArtifactKind::Ssl, "");
        let object = artifact.to_config_object();
        assert_eq!(object.name, "lb-nginx-ssl");
        assert_eq!(
            object.annotations.get(MOUNT_PATH_ANNOTATION).map(String::as_str),
            Some("conf/vhosts/ssl")
        );
        assert_eq!(object.annotations.get(CHECKSUM_ANNOTATION), Some(&artifact.checksum()));
    }
}
