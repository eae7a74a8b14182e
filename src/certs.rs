//! Run-scoped certificate resolution
//!
//! A certificate shared by several domains is fetched and emitted once per
//! run. Only the first binding that reaches a given certificate gets its
//! material back; later ones see `None`.

use crate::db::Repository;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Key pair ready to be written into the SSL config map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertMaterial {
    pub cert_id: String,
    /// Private key
    pub key: String,
    /// Certificate chain
    pub pem: String,
}

impl CertMaterial {
    pub fn key_entry(&self) -> String {
        format!("{}.key", self.cert_id)
    }

    pub fn pem_entry(&self) -> String {
        format!("{}.pem", self.cert_id)
    }
}

/// Tracks which certificates have already been handled in this run
#[derive(Debug, Default)]
pub struct CertResolver {
    processed: HashSet<String>,
}

impl CertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_processed(&self, cert_id: &str) -> bool {
        self.processed.contains(cert_id)
    }

    /// Fetch a certificate the first time it is seen in this run.
    ///
    /// The identifier is marked processed before the fetch, so a missing or
    /// unreadable certificate is not retried for later domains either.
    pub fn resolve_once(&mut self, repo: &dyn Repository, cert_id: &str) -> Option<CertMaterial> {
        if self.is_processed(cert_id) {
            debug!(cert = cert_id, "Certificate already emitted in this run");
            return None;
        }
        self.processed.insert(cert_id.to_string());

        let record = match repo.get_cert(cert_id) {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(cert = cert_id, "Certificate not found");
                return None;
            }
            Err(e) => {
                warn!(cert = cert_id, error = %e, "Failed to fetch certificate");
                return None;
            }
        };

        check_material(cert_id, &record.cert_value, &record.pem_value);

        Some(CertMaterial {
            cert_id: cert_id.to_string(),
            key: record.cert_value,
            pem: record.pem_value,
        })
    }
}

/// Warn about material nginx will not be able to load. Content is published as-is.
fn check_material(cert_id: &str, key: &str, pem: &str) {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .filter(|c| c.is_ok())
        .count();
    if certs == 0 {
        warn!(cert = cert_id, "Certificate PEM contains no certificates");
    }

    let mut reader = key.as_bytes();
    match rustls_pemfile::private_key(&mut reader) {
        Ok(Some(_)) => {}
        Ok(None) => warn!(cert = cert_id, "Certificate key contains no private key"),
        Err(e) => warn!(cert = cert_id, error = %e, "Certificate key is not valid PEM"),
    }
}
