//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "binary"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Binary entrypoint for the Warden daemon."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use warden_common::{init_tracing, AppConfig};
use warden_core::{
    topic_from_seed, CoreSettings, HttpRoleDirectory, RoleDirectory, StaticRoleDirectory, Warden,
};
use warden_metrics::{new_registry, serve_metrics, SyncMetrics};
use warden_storage::MemoryStorage;
use warden_transport::MemoryBroker;

#[derive(Debug, Parser)]
#[command(author, version, about = "Warden authorization daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the permission service")]
    Run,
    #[command(about = "Validate the configuration and print the seeded topics")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/wardend.toml"));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let _tracing = init_tracing("wardend", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config).await?
        }
        Commands::CheckConfig => check_config(&config)?,
    }
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let settings = CoreSettings::from_config(&config);
    let registry = new_registry();
    let metrics = SyncMetrics::new(registry.clone())?;
    let metrics_server = if config.metrics.enabled {
        let server = serve_metrics(registry, config.metrics.listen).await?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let roles: Arc<dyn RoleDirectory> = match &config.identity.role_members_url {
        Some(url) => Arc::new(
            HttpRoleDirectory::new(url, settings.identity_timeout)
                .context("identity service configuration rejected")?,
        ),
        None => {
            warn!("no identity service configured; role widening will be refused");
            Arc::new(StaticRoleDirectory::new())
        }
    };
    let broker = MemoryBroker::new(settings.default_partitions)
        .with_retry_policy(settings.retry)
        .with_metrics(Some(metrics.clone()));

    let warden = Warden::assemble(
        Arc::new(MemoryStorage::new()),
        Arc::new(broker),
        roles,
        Some(metrics),
        settings,
    );
    let seeded = warden.seed_topics(&config).await?;
    info!(seeded, admin_role = %config.identity.admin_role, "topics seeded");
    let handle = warden.start().await?;

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

fn check_config(config: &AppConfig) -> Result<()> {
    config.validate()?;
    let settings = CoreSettings::from_config(config);
    let topics = config
        .topics
        .iter()
        .map(|(id, seed)| {
            topic_from_seed(id, seed)
                .map(|topic| topic.with_defaults(&settings.default_consumer_group))
                .with_context(|| format!("invalid seed for topic {id}"))
        })
        .collect::<Result<Vec<_>>>()?;
    println!("{}", serde_json::to_string_pretty(&topics)?);
    Ok(())
}
