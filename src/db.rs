//! SQLite store for load-balancer bindings, certificates and vhost overrides
//!
//! Bindings and certificates are maintained by an administrative flow and are
//! read-only here. Override rows are the one thing written back: a rendered
//! vhost is stored the first time a `(cluster, domain)` pair is generated so an
//! operator can edit it, and from then on the stored text wins.

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// How backends for a binding are discovered
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LbMethod {
    /// Target pod endpoints directly
    Pod,
    /// Target the service's node port on every ready load-balancer node
    #[default]
    Node,
}

impl LbMethod {
    /// Anything other than `pod` resolves through node ports
    pub fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("pod") {
            LbMethod::Pod
        } else {
            LbMethod::Node
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LbMethod::Pod => "pod",
            LbMethod::Node => "node",
        }
    }
}

/// Join two name parts the way cluster objects are named (`a--b`)
pub fn join_name(first: &str, second: &str) -> String {
    format!("{}--{}", first, second)
}

/// A logical load-balancer binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbServiceRecord {
    pub service_id: i64,
    pub lb_name: String,
    pub cluster_name: String,
    pub domain: String,
    pub app_name: String,
    pub resource_name: String,
    pub service_name: String,
    pub service_version: String,
    pub lb_method: LbMethod,
    /// Share of traffic shifted to `flow_service_name`, 0-100
    pub percent: i64,
    pub flow_service_name: String,
    /// Certificate identifier, empty or "0" for none
    pub cert_file: String,
    pub listen_port: Option<i64>,
    pub container_port: Option<i64>,
    pub description: Option<String>,
    pub create_user: String,
    pub create_time: String,
}

impl LbServiceRecord {
    /// Create a node-mode binding with no canary and no certificate
    pub fn new(cluster_name: &str, domain: &str, service_name: &str) -> Self {
        Self {
            service_id: 0,
            lb_name: String::new(),
            cluster_name: cluster_name.to_string(),
            domain: domain.to_string(),
            app_name: String::new(),
            resource_name: String::new(),
            service_name: service_name.to_string(),
            service_version: String::new(),
            lb_method: LbMethod::Node,
            percent: 0,
            flow_service_name: String::new(),
            cert_file: String::new(),
            listen_port: None,
            container_port: None,
            description: None,
            create_user: String::new(),
            create_time: String::new(),
        }
    }

    /// Set application and resource qualifiers (builder pattern)
    pub fn with_app(mut self, app_name: &str, resource_name: &str) -> Self {
        self.app_name = app_name.to_string();
        self.resource_name = resource_name.to_string();
        self
    }

    /// Set the balancing method (builder pattern)
    pub fn with_method(mut self, method: LbMethod) -> Self {
        self.lb_method = method;
        self
    }

    /// Set the service version (builder pattern)
    pub fn with_version(mut self, version: &str) -> Self {
        self.service_version = version.to_string();
        self
    }

    /// Shift `percent` of traffic to `flow_service_name` (builder pattern)
    pub fn with_flow(mut self, flow_service_name: &str, percent: i64) -> Self {
        self.flow_service_name = flow_service_name.to_string();
        self.percent = percent;
        self
    }

    /// Set the certificate identifier (builder pattern)
    pub fn with_cert(mut self, cert_file: &str) -> Self {
        self.cert_file = cert_file.to_string();
        self
    }

    /// Namespace the target service lives in
    pub fn namespace(&self) -> String {
        join_name(&self.app_name, &self.resource_name)
    }

    /// Versioned service name, falling back to `default_version`
    pub fn versioned_service_name(&self, default_version: &str) -> String {
        let version = if self.service_version.is_empty() {
            default_version
        } else {
            &self.service_version
        };
        join_name(&self.service_name, version)
    }

    /// Certificate identifier, if the binding references one
    pub fn cert_id(&self) -> Option<&str> {
        match self.cert_file.as_str() {
            "" | "0" => None,
            id => Some(id),
        }
    }

    /// Key used to look up overrides
    pub fn override_key(&self) -> OverrideKey {
        OverrideKey::new(&self.cluster_name, &self.domain)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let method: String = row.get(8)?;
        Ok(Self {
            service_id: row.get(0)?,
            lb_name: row.get(1)?,
            cluster_name: row.get(2)?,
            domain: row.get(3)?,
            app_name: row.get(4)?,
            resource_name: row.get(5)?,
            service_name: row.get(6)?,
            service_version: row.get(7)?,
            lb_method: LbMethod::parse(&method),
            percent: row.get(9)?,
            flow_service_name: row.get(10)?,
            cert_file: row.get(11)?,
            listen_port: row.get(12)?,
            container_port: row.get(13)?,
            description: row.get(14)?,
            create_user: row.get(15)?,
            create_time: row.get(16)?,
        })
    }
}

/// `(cluster, domain)` addressing key for generated artifacts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OverrideKey {
    pub cluster_name: String,
    pub domain: String,
}

impl OverrideKey {
    pub fn new(cluster_name: &str, domain: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            domain: domain.to_string(),
        }
    }
}

/// Certificate material
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbCertRecord {
    /// Certificate identifier referenced by bindings
    pub cert_key: String,
    /// Private key
    pub cert_value: String,
    /// Certificate chain in PEM form
    pub pem_value: String,
    pub description: Option<String>,
    pub create_user: String,
    pub create_time: String,
}

impl LbCertRecord {
    pub fn new(cert_key: &str, cert_value: &str, pem_value: &str) -> Self {
        Self {
            cert_key: cert_key.to_string(),
            cert_value: cert_value.to_string(),
            pem_value: pem_value.to_string(),
            description: None,
            create_user: String::new(),
            create_time: String::new(),
        }
    }
}

/// A stored vhost for one `(cluster, domain)` pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbNginxConfRecord {
    pub conf_id: i64,
    pub cluster_name: String,
    pub domain: String,
    pub service_name: String,
    pub app_name: String,
    pub resource_name: String,
    pub cert_file: String,
    pub service_id: i64,
    pub lb_service_id: String,
    pub vhost: String,
    pub create_user: String,
    pub create_time: String,
    pub last_modify_user: String,
    pub last_modify_time: String,
}

impl LbNginxConfRecord {
    /// Build a new override row for a freshly rendered vhost
    pub fn from_service(service: &LbServiceRecord, vhost: &str, now: &str) -> Self {
        Self {
            conf_id: 0,
            cluster_name: service.cluster_name.clone(),
            domain: service.domain.clone(),
            service_name: service.service_name.clone(),
            app_name: service.app_name.clone(),
            resource_name: service.resource_name.clone(),
            cert_file: service.cert_file.clone(),
            service_id: service.service_id,
            lb_service_id: service.service_id.to_string(),
            vhost: vhost.to_string(),
            create_user: service.create_user.clone(),
            create_time: now.to_string(),
            last_modify_user: service.create_user.clone(),
            last_modify_time: now.to_string(),
        }
    }

    pub fn key(&self) -> OverrideKey {
        OverrideKey::new(&self.cluster_name, &self.domain)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            conf_id: row.get(0)?,
            cluster_name: row.get(1)?,
            domain: row.get(2)?,
            service_name: row.get(3)?,
            app_name: row.get(4)?,
            resource_name: row.get(5)?,
            cert_file: row.get(6)?,
            service_id: row.get(7)?,
            lb_service_id: row.get(8)?,
            vhost: row.get(9)?,
            create_user: row.get(10)?,
            create_time: row.get(11)?,
            last_modify_user: row.get(12)?,
            last_modify_time: row.get(13)?,
        })
    }
}

/// Read/write access the synthesizer needs from the relational store
pub trait Repository: Send + Sync {
    /// All load-balancer bindings, in a stable order
    fn list_lb_services(&self) -> Result<Vec<LbServiceRecord>>;

    /// All stored vhost overrides
    fn list_nginx_confs(&self) -> Result<Vec<LbNginxConfRecord>>;

    /// Certificate material by identifier
    fn get_cert(&self, cert_key: &str) -> Result<Option<LbCertRecord>>;

    /// Insert an override row unless one exists for its `(cluster, domain)`.
    /// Returns whether a row was created.
    fn insert_nginx_conf(&self, conf: &LbNginxConfRecord) -> Result<bool>;
}

/// Database connection wrapper with thread-safe access
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).context("Failed to open database")?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        info!("Database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < SCHEMA_VERSION {
            info!("Running migrations from v{} to v{}", current_version, SCHEMA_VERSION);

            if current_version < 1 {
                Self::migrate_v1(&conn)?;
            }
        }

        Ok(())
    }

    /// Migration v1: Initial schema
    fn migrate_v1(conn: &Connection) -> Result<()> {
        debug!("Applying migration v1: initial schema");

        conn.execute_batch(r#"
            CREATE TABLE IF NOT EXISTS lb_services (
                service_id INTEGER PRIMARY KEY AUTOINCREMENT,
                lb_name TEXT NOT NULL DEFAULT '',
                cluster_name TEXT NOT NULL,
                domain TEXT NOT NULL,
                app_name TEXT NOT NULL DEFAULT '',
                resource_name TEXT NOT NULL DEFAULT '',
                service_name TEXT NOT NULL,
                service_version TEXT NOT NULL DEFAULT '',
                lb_method TEXT NOT NULL DEFAULT 'node',
                percent INTEGER NOT NULL DEFAULT 0,
                flow_service_name TEXT NOT NULL DEFAULT '',
                cert_file TEXT NOT NULL DEFAULT '',
                listen_port INTEGER,
                container_port INTEGER,
                description TEXT,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL DEFAULT (datetime('now')),
                last_modify_user TEXT NOT NULL DEFAULT '',
                last_modify_time TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS lb_certs (
                cert_key TEXT PRIMARY KEY,
                cert_value TEXT NOT NULL DEFAULT '',
                pem_value TEXT NOT NULL DEFAULT '',
                description TEXT,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL DEFAULT (datetime('now')),
                last_modify_user TEXT NOT NULL DEFAULT '',
                last_modify_time TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS lb_nginx_confs (
                conf_id INTEGER PRIMARY KEY AUTOINCREMENT,
                cluster_name TEXT NOT NULL,
                domain TEXT NOT NULL,
                service_name TEXT NOT NULL DEFAULT '',
                app_name TEXT NOT NULL DEFAULT '',
                resource_name TEXT NOT NULL DEFAULT '',
                cert_file TEXT NOT NULL DEFAULT '',
                service_id INTEGER NOT NULL DEFAULT 0,
                lb_service_id TEXT NOT NULL DEFAULT '',
                vhost TEXT NOT NULL,
                create_user TEXT NOT NULL DEFAULT '',
                create_time TEXT NOT NULL DEFAULT (datetime('now')),
                last_modify_user TEXT NOT NULL DEFAULT '',
                last_modify_time TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (cluster_name, domain)
            );

            CREATE INDEX IF NOT EXISTS idx_lb_services_cluster ON lb_services(cluster_name);

            INSERT INTO schema_migrations (version) VALUES (1);
        "#)?;

        Ok(())
    }

    // ==================== Load Balancer Bindings ====================

    /// Create a binding, returning its id
    pub fn create_lb_service(&self, service: &LbServiceRecord) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lb_services (lb_name, cluster_name, domain, app_name, resource_name,
                service_name, service_version, lb_method, percent, flow_service_name, cert_file,
                listen_port, container_port, description, create_user)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                service.lb_name, service.cluster_name, service.domain, service.app_name,
                service.resource_name, service.service_name, service.service_version,
                service.lb_method.as_str(), service.percent, service.flow_service_name,
                service.cert_file, service.listen_port, service.container_port,
                service.description, service.create_user
            ],
        )
        .context("Failed to create load balancer service")?;
        Ok(conn.last_insert_rowid())
    }

    /// List all bindings ordered by id
    pub fn list_lb_services(&self) -> Result<Vec<LbServiceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT service_id, lb_name, cluster_name, domain, app_name, resource_name,
                service_name, service_version, lb_method, percent, flow_service_name, cert_file,
                listen_port, container_port, description, create_user, create_time
             FROM lb_services ORDER BY service_id",
        )?;

        let services = stmt
            .query_map([], LbServiceRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list load balancer services")?;

        Ok(services)
    }

    // ==================== Certificates ====================

    /// Create or replace certificate material
    pub fn save_cert(&self, cert: &LbCertRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lb_certs (cert_key, cert_value, pem_value, description, create_user)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cert_key) DO UPDATE SET
                cert_value = excluded.cert_value,
                pem_value = excluded.pem_value,
                description = excluded.description,
                last_modify_time = datetime('now')",
            params![
                cert.cert_key,
                cert.cert_value,
                cert.pem_value,
                cert.description,
                cert.create_user
            ],
        )
        .context("Failed to save certificate")?;
        Ok(())
    }

    /// Get certificate material by identifier
    pub fn get_cert(&self, cert_key: &str) -> Result<Option<LbCertRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT cert_key, cert_value, pem_value, description, create_user, create_time
             FROM lb_certs WHERE cert_key = ?1",
            params![cert_key],
            |row| {
                Ok(LbCertRecord {
                    cert_key: row.get(0)?,
                    cert_value: row.get(1)?,
                    pem_value: row.get(2)?,
                    description: row.get(3)?,
                    create_user: row.get(4)?,
                    create_time: row.get(5)?,
                })
            },
        )
        .optional()
        .context("Failed to get certificate")
    }

    // ==================== Vhost Overrides ====================

    /// List all stored vhost overrides
    pub fn list_nginx_confs(&self) -> Result<Vec<LbNginxConfRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conf_id, cluster_name, domain, service_name, app_name, resource_name, cert_file,
                service_id, lb_service_id, vhost, create_user, create_time, last_modify_user,
                last_modify_time
             FROM lb_nginx_confs ORDER BY conf_id",
        )?;

        let confs = stmt
            .query_map([], LbNginxConfRecord::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list nginx confs")?;

        Ok(confs)
    }

    /// Get the stored vhost override for a cluster and domain
    pub fn get_nginx_conf(
        &self,
        cluster_name: &str,
        domain: &str,
    ) -> Result<Option<LbNginxConfRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT conf_id, cluster_name, domain, service_name, app_name, resource_name, cert_file,
                service_id, lb_service_id, vhost, create_user, create_time, last_modify_user,
                last_modify_time
             FROM lb_nginx_confs WHERE cluster_name = ?1 AND domain = ?2",
            params![cluster_name, domain],
            LbNginxConfRecord::from_row,
        )
        .optional()
        .context("Failed to get nginx conf")
    }

    /// Insert an override row; an existing row for the same cluster and domain is left untouched
    pub fn insert_nginx_conf(&self, conf: &LbNginxConfRecord) -> Result<bool> {
        let conn = self.conn()?;
        let rows = conn
            .execute(
                "INSERT OR IGNORE INTO lb_nginx_confs (cluster_name, domain, service_name,
                    app_name, resource_name, cert_file, service_id, lb_service_id, vhost,
                    create_user, create_time, last_modify_user, last_modify_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    conf.cluster_name, conf.domain, conf.service_name, conf.app_name,
                    conf.resource_name, conf.cert_file, conf.service_id, conf.lb_service_id,
                    conf.vhost, conf.create_user, conf.create_time, conf.last_modify_user,
                    conf.last_modify_time
                ],
            )
            .context("Failed to insert nginx conf")?;
        Ok(rows > 0)
    }
}

impl Repository for Database {
    fn list_lb_services(&self) -> Result<Vec<LbServiceRecord>> {
        Database::list_lb_services(self)
    }

    fn list_nginx_confs(&self) -> Result<Vec<LbNginxConfRecord>> {
        Database::list_nginx_confs(self)
    }

    fn get_cert(&self, cert_key: &str) -> Result<Option<LbCertRecord>> {
        Database::get_cert(self, cert_key)
    }

    fn insert_nginx_conf(&self, conf: &LbNginxConfRecord) -> Result<bool> {
        Database::insert_nginx_conf(self, conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lb_method_parse() {
        assert_eq!(LbMethod::parse("pod"), LbMethod::Pod);
        assert_eq!(LbMethod::parse(" POD "), LbMethod::Pod);
        assert_eq!(LbMethod::parse("node"), LbMethod::Node);
        assert_eq!(LbMethod::parse(""), LbMethod::Node);
    }

    #[test]
    fn test_versioned_service_name() {
        let svc = LbServiceRecord::new("c1", "a.example.com", "web");
        assert_eq!(svc.versioned_service_name("1"), "web--1");

        let svc = svc.with_version("3");
        assert_eq!(svc.versioned_service_name("1"), "web--3");
    }

    #[test]
    fn test_namespace_and_cert_id() {
        let svc = LbServiceRecord::new("c1", "a.example.com", "web").with_app("shop", "prod");
        assert_eq!(svc.namespace(), "shop--prod");
        assert_eq!(svc.cert_id(), None);
        assert_eq!(svc.clone().with_cert("0").cert_id(), None);
        assert_eq!(svc.with_cert("wildcard").cert_id(), Some("wildcard"));
    }

    #[test]
    fn test_create_and_list_lb_services() {
        let db = Database::open_in_memory().unwrap();

        let first = LbServiceRecord::new("c1", "a.example.com", "web")
            .with_app("shop", "prod")
            .with_method(LbMethod::Pod);
        let second = LbServiceRecord::new("c2", "b.example.com", "api").with_flow("api-canary", 20);

        let first_id = db.create_lb_service(&first).unwrap();
        let second_id = db.create_lb_service(&second).unwrap();
        assert!(second_id > first_id);

        let services = db.list_lb_services().unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].service_id, first_id);
        assert_eq!(services[0].lb_method, LbMethod::Pod);
        assert_eq!(services[0].namespace(), "shop--prod");
        assert_eq!(services[1].lb_method, LbMethod::Node);
        assert_eq!(services[1].percent, 20);
        assert_eq!(services[1].flow_service_name, "api-canary");
    }

    #[test]
    fn test_save_and_get_cert() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.get_cert("missing").unwrap().is_none());

        db.save_cert(&LbCertRecord::new("site", "KEY", "PEM")).unwrap();
        let cert = db.get_cert("site").unwrap().unwrap();
        assert_eq!(cert.cert_value, "KEY");
        assert_eq!(cert.pem_value, "PEM");

        db.save_cert(&LbCertRecord::new("site", "KEY2", "PEM2")).unwrap();
        assert_eq!(db.get_cert("site").unwrap().unwrap().cert_value, "KEY2");
    }

    #[test]
    fn test_insert_nginx_conf_never_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let svc = LbServiceRecord::new("c1", "a.example.com", "web");

        let conf = LbNginxConfRecord::from_service(&svc, "generated", "2024-01-01 00:00:00");
        assert!(db.insert_nginx_conf(&conf).unwrap());

        let again = LbNginxConfRecord::from_service(&svc, "regenerated", "2024-01-02 00:00:00");
        assert!(!db.insert_nginx_conf(&again).unwrap());

        let stored = db.get_nginx_conf("c1", "a.example.com").unwrap().unwrap();
        assert_eq!(stored.vhost, "generated");
        assert_eq!(db.list_nginx_confs().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("lb.db");

        {
            let db = Database::open(&path).unwrap();
            db.create_lb_service(&LbServiceRecord::new("c1", "a.example.com", "web"))
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        assert_eq!(db.list_lb_services().unwrap().len(), 1);
    }
}
