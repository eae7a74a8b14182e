//! Multi-cluster configuration synthesis
//!
//! A run reads every load-balancer binding once, groups them by cluster and
//! renders each cluster independently with its own certificate and override
//! state. Each cluster gets exactly one publish call. Generated vhosts are
//! stored as overrides only after that publish succeeds.

use crate::certs::CertResolver;
use crate::config::Config;
use crate::db::{LbServiceRecord, Repository};
use crate::error::SyncError;
use crate::orchestrator::{ClientCache, ClientFactory};
use crate::overrides::{persist_if_absent, OverrideCache};
use crate::publish::{ClusterArtifacts, Publisher};
use crate::render::{render, RenderedService};
use crate::topology::TopologyResolver;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Outcome of one cluster within a run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterReport {
    pub cluster: String,
    /// Domains rendered into this cluster's artifacts
    pub rendered: Vec<String>,
    /// Domains skipped for lack of backends
    pub skipped: Vec<String>,
    /// Certificates whose material was emitted
    pub certificates: Vec<String>,
    /// Generated vhosts stored as new overrides
    pub stored_overrides: usize,
    pub published: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ClusterReport {
    fn new(cluster: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            ..Default::default()
        }
    }
}

/// Outcome of a full regeneration
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub variant: String,
    pub started_at: String,
    pub duration_ms: u64,
    pub clusters: Vec<ClusterReport>,
}

impl RunReport {
    pub fn cluster(&self, name: &str) -> Option<&ClusterReport> {
        self.clusters.iter().find(|c| c.cluster == name)
    }

    pub fn failed_clusters(&self) -> usize {
        self.clusters.iter().filter(|c| c.error.is_some()).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_clusters() == 0
    }
}

/// Result of an incremental upstream update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpstreamUpdate {
    Updated { backends: usize },
    /// Nothing resolved; the published entry was left as it was
    Skipped,
}

/// Group bindings by cluster, keeping the first-seen order of clusters
pub fn group_by_cluster(services: Vec<LbServiceRecord>) -> Vec<(String, Vec<LbServiceRecord>)> {
    let mut groups: Vec<(String, Vec<LbServiceRecord>)> = Vec::new();
    for service in services {
        match groups.iter_mut().find(|(cluster, _)| *cluster == service.cluster_name) {
            Some((_, members)) => members.push(service),
            None => groups.push((service.cluster_name.clone(), vec![service])),
        }
    }
    groups
}

/// Drives topology resolution, rendering and publication across clusters
pub struct Synthesizer {
    repo: Arc<dyn Repository>,
    clients: ClientCache,
    resolver: TopologyResolver,
    publisher: Publisher,
    cluster_concurrency: usize,
}

impl Synthesizer {
    pub fn new(
        repo: Arc<dyn Repository>,
        factory: Arc<dyn ClientFactory>,
        config: &Config,
    ) -> Self {
        Self {
            repo,
            clients: ClientCache::new(factory),
            resolver: TopologyResolver::new(&config.nginx),
            publisher: Publisher::new(&config.nginx.namespace),
            cluster_concurrency: config.run.cluster_concurrency.max(1),
        }
    }

    /// Regenerate and publish configuration for every cluster.
    ///
    /// Store and orchestrator failures never abort the run: they are
    /// recorded against the affected cluster and the run moves on.
    pub async fn run(&self, variant: &str) -> RunReport {
        let started = Instant::now();
        let started_at = chrono::Utc::now().to_rfc3339();

        let services = match self.repo.list_lb_services() {
            Ok(services) => services,
            Err(e) => {
                error!(error = %e, "Failed to list load balancer services");
                Vec::new()
            }
        };
        let overrides = OverrideCache::load(self.repo.as_ref());
        let groups = group_by_cluster(services);

        info!(
            clusters = groups.len(),
            overrides = overrides.len(),
            variant,
            "Starting nginx config generation"
        );

        let clusters: Vec<ClusterReport> = if self.cluster_concurrency > 1 {
            stream::iter(groups.iter())
                .map(|(cluster, services)| {
                    let overrides = overrides.for_cluster(cluster);
                    async move { self.sync_cluster(cluster, services, overrides, variant).await }
                })
                .buffered(self.cluster_concurrency)
                .collect()
                .await
        } else {
            let mut reports = Vec::with_capacity(groups.len());
            for (cluster, services) in &groups {
                let overrides = overrides.for_cluster(cluster);
                reports.push(self.sync_cluster(cluster, services, overrides, variant).await);
            }
            reports
        };

        let report = RunReport {
            variant: variant.to_string(),
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            clusters,
        };

        info!(
            clusters = report.clusters.len(),
            failed = report.failed_clusters(),
            duration_ms = report.duration_ms,
            "Finished nginx config generation"
        );
        report
    }

    async fn sync_cluster(
        &self,
        cluster: &str,
        services: &[LbServiceRecord],
        overrides: OverrideCache,
        variant: &str,
    ) -> ClusterReport {
        let mut report = ClusterReport::new(cluster);

        let client = match self.clients.get_client(cluster).await {
            Ok(client) => client,
            Err(e) => {
                error!(cluster, error = %e, "Failed to get cluster client, skipping cluster");
                report.error = Some(e.to_string());
                return report;
            }
        };

        let mut certs = CertResolver::new();
        let mut artifacts = ClusterArtifacts::new(variant);
        let mut generated: Vec<(&LbServiceRecord, RenderedService)> = Vec::new();

        for service in services {
            let backends = self.resolver.backends(client.as_ref(), service).await;
            let rendered = render(service, &backends, &overrides, &mut certs, self.repo.as_ref());
            let Some(rendered) = rendered else {
                report.skipped.push(service.domain.clone());
                continue;
            };

            artifacts.add(&rendered);
            report.rendered.push(rendered.domain.clone());
            if let Some(cert) = &rendered.cert {
                report.certificates.push(cert.cert_id.clone());
            }
            if !rendered.overridden {
                generated.push((service, rendered));
            }
        }

        if artifacts.is_empty() {
            warn!(cluster, services = services.len(), "Nothing rendered, not publishing");
            return report;
        }

        if let Err(e) = self
            .publisher
            .publish(client.as_ref(), cluster, &artifacts.into_artifacts())
            .await
        {
            report.error = Some(e.to_string());
            return report;
        }
        report.published = true;

        for (service, rendered) in &generated {
            if persist_if_absent(self.repo.as_ref(), &overrides, service, &rendered.vhost) {
                report.stored_overrides += 1;
            }
        }

        info!(
            cluster,
            rendered = report.rendered.len(),
            skipped = report.skipped.len(),
            certificates = report.certificates.len(),
            stored_overrides = report.stored_overrides,
            "Cluster synced"
        );
        report
    }

    /// Recompute one domain's upstream and republish the cluster's upstream map.
    ///
    /// The map must already exist from a previous full run; its absence is
    /// reported before any topology is resolved.
    pub async fn update_upstream(
        &self,
        cluster: &str,
        domain: &str,
        variant: &str,
    ) -> Result<UpstreamUpdate, SyncError> {
        let service = self
            .repo
            .list_lb_services()?
            .into_iter()
            .find(|s| s.cluster_name == cluster && s.domain == domain)
            .ok_or_else(|| SyncError::ServiceNotFound {
                cluster: cluster.to_string(),
                domain: domain.to_string(),
            })?;

        let client = self.clients.get_client(cluster).await?;
        let entries = self
            .publisher
            .fetch_upstream(client.as_ref(), cluster, variant)
            .await?;

        let backends = self.resolver.backends(client.as_ref(), &service).await;
        if backends.is_empty() {
            warn!(cluster, domain, "No backends resolved, leaving published upstream unchanged");
            return Ok(UpstreamUpdate::Skipped);
        }

        self.publisher
            .update_upstream_entry(client.as_ref(), cluster, entries, domain, &backends, variant)
            .await?;

        info!(cluster, domain, backends = backends.len(), "Updated upstream");
        Ok(UpstreamUpdate::Updated {
            backends: backends.len(),
        })
    }

    /// Publish prepared vhost and SSL entries to a cluster's test objects
    pub async fn publish_test(
        &self,
        cluster: &str,
        vhosts: BTreeMap<String, String>,
        ssl: BTreeMap<String, String>,
    ) -> Result<(), SyncError> {
        let client = self.clients.get_client(cluster).await?;
        self.publisher
            .publish_test(client.as_ref(), cluster, vhosts, ssl)
            .await?;
        Ok(())
    }
}
