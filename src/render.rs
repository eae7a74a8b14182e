//! Rendering of upstream and virtual host blocks for one binding

use crate::certs::{CertMaterial, CertResolver};
use crate::db::{LbServiceRecord, Repository};
use crate::overrides::OverrideCache;
use crate::template;
use tracing::{debug, warn};

/// Rendered configuration for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedService {
    pub domain: String,
    pub upstream: String,
    pub vhost: String,
    /// The vhost came from a stored override
    pub overridden: bool,
    /// Certificate material emitted for the first time in this run
    pub cert: Option<CertMaterial>,
}

impl RenderedService {
    pub fn upstream_entry(&self) -> String {
        format!("{}.upstream", self.domain)
    }

    pub fn vhost_entry(&self) -> String {
        format!("{}.conf", self.domain)
    }
}

/// Render a binding against its resolved backends.
///
/// Returns `None` when there are no backends: an empty upstream is never
/// emitted, and the binding's certificate is left unprocessed.
///
/// The TLS vhost is only produced for the first binding in the run that
/// reaches a certificate, and only if that binding has no stored override.
/// Later bindings sharing the certificate render the plain vhost.
pub fn render(
    service: &LbServiceRecord,
    backends: &[String],
    overrides: &OverrideCache,
    certs: &mut CertResolver,
    repo: &dyn Repository,
) -> Option<RenderedService> {
    if backends.is_empty() {
        warn!(
            cluster = %service.cluster_name,
            domain = %service.domain,
            service = %service.service_name,
            namespace = %service.namespace(),
            "No backends resolved, skipping domain"
        );
        return None;
    }

    let upstream = template::upstream(&service.domain, backends);

    let stored = overrides.get(&service.override_key());
    let mut vhost = match stored {
        Some(text) => text.to_string(),
        None => template::http_vhost(&service.domain),
    };

    let cert = service
        .cert_id()
        .and_then(|cert_id| certs.resolve_once(repo, cert_id));
    if let Some(material) = &cert {
        if stored.is_none() {
            vhost = template::tls_vhost(&service.domain, &material.cert_id);
        }
    }

    debug!(
        cluster = %service.cluster_name,
        domain = %service.domain,
        backends = backends.len(),
        overridden = stored.is_some(),
        tls = cert.is_some() && stored.is_none(),
        "Rendered domain"
    );

    Some(RenderedService {
        domain: service.domain.clone(),
        upstream,
        vhost,
        overridden: stored.is_some(),
        cert,
    })
}
