use anyhow::Context;
use clap::{Parser, Subcommand};
use lbsync::config::Config;
use lbsync::db::Database;
use lbsync::kube_client::KubeClientFactory;
use lbsync::sync::{RunReport, Synthesizer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// Synthesize and publish nginx load balancer configuration
#[derive(Debug, Parser)]
#[command(name = "lbsync", version)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, short, env = "LBSYNC_CONFIG", default_value = "lbsync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Regenerate configuration for every cluster
    Generate {
        /// Suffix appended to config map names, e.g. -test
        #[arg(long, default_value = "")]
        variant: String,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Recompute a single domain's upstream on one cluster
    UpdateUpstream {
        #[arg(long)]
        cluster: String,

        #[arg(long)]
        domain: String,

        #[arg(long, default_value = "")]
        variant: String,
    },

    /// Publish vhost and SSL files to a cluster's `-test` config maps
    PublishTest {
        #[arg(long)]
        cluster: String,

        /// Vhost file, published under its file name (repeatable)
        #[arg(long = "conf")]
        conf: Vec<PathBuf>,

        /// Certificate key or PEM file, published under its file name (repeatable)
        #[arg(long = "ssl")]
        ssl: Vec<PathBuf>,
    },

    /// Create the store schema
    InitDb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lbsync=info".parse().context("invalid log directive")?),
        )
        .init();

    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    info!(path = %cli.config.display(), "Configuration loaded");

    let db = Database::open(&config.store.path)?;

    match cli.command {
        Command::InitDb => {
            info!(path = %config.store.path, "Store schema ready");
        }
        Command::Generate { variant, json } => {
            let synthesizer = kube_synthesizer(&config, db);
            let report = synthesizer.run(&variant).await;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }

            if !report.is_success() {
                anyhow::bail!("{} cluster(s) failed", report.failed_clusters());
            }
        }
        Command::UpdateUpstream { cluster, domain, variant } => {
            let synthesizer = kube_synthesizer(&config, db);
            let outcome = synthesizer
                .update_upstream(&cluster, &domain, &variant)
                .await
                .map_err(|e| {
                    error!(
                        cluster = %cluster,
                        domain = %domain,
                        error = %e,
                        "Upstream update failed"
                    );
                    e
                })?;
            println!("{}", serde_json::to_string(&outcome)?);
        }
        Command::PublishTest { cluster, conf, ssl } => {
            let vhosts = read_entries(&conf)?;
            let ssl = read_entries(&ssl)?;
            let synthesizer = kube_synthesizer(&config, db);
            synthesizer.publish_test(&cluster, vhosts, ssl).await?;
            info!(cluster = %cluster, "Published test config");
        }
    }

    Ok(())
}

fn kube_synthesizer(config: &Config, db: Database) -> Synthesizer {
    let factory = Arc::new(KubeClientFactory::new(
        config.kubernetes.clone(),
        &config.nginx.field_manager,
    ));
    Synthesizer::new(Arc::new(db), factory, config)
}

/// Load files as config map entries keyed by file name
fn read_entries(paths: &[PathBuf]) -> anyhow::Result<BTreeMap<String, String>> {
    let mut entries = BTreeMap::new();
    for path in paths {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("invalid entry file name: {}", path.display()))?;
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        entries.insert(name.to_string(), content);
    }
    Ok(entries)
}

fn print_report(report: &RunReport) {
    println!("lbsync run ({} ms)", report.duration_ms);
    for cluster in &report.clusters {
        let status = match (&cluster.error, cluster.published) {
            (Some(e), _) => format!("failed: {}", e),
            (None, true) => "published".to_string(),
            (None, false) => "nothing to publish".to_string(),
        };
        println!("  {}: {}", cluster.cluster, status);
        println!(
            "    rendered {}, skipped {}, certificates {}, new overrides {}",
            cluster.rendered.len(),
            cluster.skipped.len(),
            cluster.certificates.len(),
            cluster.stored_overrides
        );
        for domain in &cluster.skipped {
            println!("    skipped {}", domain);
        }
    }
}
