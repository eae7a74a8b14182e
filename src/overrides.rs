//! Administrator-controlled vhost overrides
//!
//! Presence of a stored row for `(cluster, domain)` means the vhost text is
//! owned by an operator and is reused verbatim. Absence means the generated
//! text is stored once, and never touched again by this engine.

use crate::db::{LbNginxConfRecord, LbServiceRecord, OverrideKey, Repository};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Run-scoped lookup of stored vhost text
#[derive(Debug, Clone, Default)]
pub struct OverrideCache {
    vhosts: HashMap<OverrideKey, String>,
}

impl OverrideCache {
    pub fn from_records(records: impl IntoIterator<Item = LbNginxConfRecord>) -> Self {
        let vhosts = records
            .into_iter()
            .map(|record| (record.key(), record.vhost))
            .collect();
        Self { vhosts }
    }

    /// Load every stored override. A store failure yields an empty cache.
    pub fn load(repo: &dyn Repository) -> Self {
        match repo.list_nginx_confs() {
            Ok(records) => {
                let cache = Self::from_records(records);
                debug!(overrides = cache.len(), "Loaded vhost overrides");
                cache
            }
            Err(e) => {
                warn!(error = %e, "Failed to load vhost overrides, generating all vhosts");
                Self::default()
            }
        }
    }

    /// Copy of the overrides that belong to one cluster
    pub fn for_cluster(&self, cluster: &str) -> Self {
        let vhosts = self
            .vhosts
            .iter()
            .filter(|(key, _)| key.cluster_name == cluster)
            .map(|(key, vhost)| (key.clone(), vhost.clone()))
            .collect();
        Self { vhosts }
    }

    pub fn get(&self, key: &OverrideKey) -> Option<&str> {
        self.vhosts.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &OverrideKey) -> bool {
        self.vhosts.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vhosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vhosts.is_empty()
    }
}

/// Store `vhost` as the override for the binding's `(cluster, domain)` unless
/// one already exists. Returns whether a row was created. Store failures are
/// logged and dropped.
pub fn persist_if_absent(
    repo: &dyn Repository,
    overrides: &OverrideCache,
    service: &LbServiceRecord,
    vhost: &str,
) -> bool {
    if overrides.contains(&service.override_key()) {
        return false;
    }

    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let record = LbNginxConfRecord::from_service(service, vhost, &now);
    match repo.insert_nginx_conf(&record) {
        Ok(true) => {
            info!(
                cluster = %service.cluster_name,
                domain = %service.domain,
                "Stored generated vhost"
            );
            true
        }
        Ok(false) => false,
        Err(e) => {
            warn!(
                cluster = %service.cluster_name,
                domain = %service.domain,
                error = %e,
                "Failed to store generated vhost"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn record(cluster: &str, domain: &str, vhost: &str) -> LbNginxConfRecord {
        LbNginxConfRecord::from_service(&LbServiceRecord::new(cluster, domain, "web"), vhost, "now")
    }

    #[test]
    fn test_cache_lookup_and_cluster_filter() {
        let cache = OverrideCache::from_records(vec![
            record("c1", "a.example.com", "A"),
            record("c2", "a.example.com", "B"),
        ]);

        assert_eq!(cache.get(&OverrideKey::new("c1", "a.example.com")), Some("A"));
        assert_eq!(cache.get(&OverrideKey::new("c2", "a.example.com")), Some("B"));

        let c1 = cache.for_cluster("c1");
        assert_eq!(c1.len(), 1);
        assert!(c1.contains(&OverrideKey::new("c1", "a.example.com")));
        assert!(!c1.contains(&OverrideKey::new("c2", "a.example.com")));
    }

    #[test]
    fn test_persist_if_absent_creates_once() {
        let db = Database::open_in_memory().unwrap();
        let svc = LbServiceRecord::new("c1", "a.example.com", "web");

        let empty = OverrideCache::default();
        assert!(persist_if_absent(&db, &empty, &svc, "first"));
        // the store itself refuses a second row for the same pair
        assert!(!persist_if_absent(&db, &empty, &svc, "second"));

        let stored = db.get_nginx_conf("c1", "a.example.com").unwrap().unwrap();
        assert_eq!(stored.vhost, "first");
    }

    #[test]
    fn test_persist_if_absent_skips_cached_override() {
        let db = Database::open_in_memory().unwrap();
        let svc = LbServiceRecord::new("c1", "a.example.com", "web");
        let cache = OverrideCache::from_records(vec![record("c1", "a.example.com", "manual")]);

        assert!(!persist_if_absent(&db, &cache, &svc, "generated"));
        assert!(db.list_nginx_confs().unwrap().is_empty());
    }

    #[test]
    fn test_load_from_store() {
        let db = Database::open_in_memory().unwrap();
        db.insert_nginx_conf(&record("c1", "a.example.com", "A")).unwrap();

        let cache = OverrideCache::load(&db);
        assert_eq!(cache.get(&OverrideKey::new("c1", "a.example.com")), Some("A"));
    }
}
