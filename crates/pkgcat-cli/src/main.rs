use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pkgcat_core::SourceId;
use pkgcat_storage::PgCatalogStore;
use pkgcat_sync::{build_orchestrator, maybe_build_scheduler, open_store, run_all_once, SyncConfig};
use pkgcat_web::AppState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pkgcat")]
#[command(about = "Package catalog ingestion: sync upstream repositories and serve the catalog")]
struct Cli {
    /// Emit JSON log lines (also enabled by PKGCAT_LOG_JSON=1).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run enabled sources once, sequentially, then exit.
    Sync {
        /// Only this source.
        #[arg(long)]
        source: Option<SourceId>,
    },
    /// Apply catalog migrations.
    Migrate,
    /// Serve the HTTP API; runs the cron scheduler when enabled.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("PKGCAT_LOG").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|e| {
            eprintln!("WARN: PKGCAT_LOG is not a valid tracing filter ({e}); falling back to 'info'");
            EnvFilter::new("info")
        });
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_env = std::env::var("PKGCAT_LOG_JSON").is_ok_and(|v| matches!(v.trim(), "1" | "true"));
    init_tracing(cli.log_json || json_env);

    let config = SyncConfig::from_env();
    info!(version = env!("CARGO_PKG_VERSION"), "pkgcat starting");

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => sync(&config, source).await,
        Commands::Migrate => migrate(&config).await,
        Commands::Serve { port } => serve(&config, port.unwrap_or(config.web_port)).await,
    }
}

async fn sync(config: &SyncConfig, source: Option<SourceId>) -> Result<()> {
    let store = open_store(config).await?;
    let orchestrator = build_orchestrator(config, store).await?;

    let results: BTreeMap<_, _> = match source {
        Some(id) => std::iter::once((id, orchestrator.run(id).await)).collect(),
        None => run_all_once(&orchestrator).await,
    };

    let mut failed = 0;
    for (id, result) in &results {
        match result {
            Ok(counts) => println!(
                "{id}: inserted={} updated={} skipped={}",
                counts.inserted, counts.updated, counts.skipped
            ),
            Err(err) => {
                failed += 1;
                error!(source = %id, error = %err, "sync failed");
                println!("{id}: failed: {err}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} sources failed", results.len());
    }
    Ok(())
}

async fn migrate(config: &SyncConfig) -> Result<()> {
    if config.memory_store {
        bail!("PKGCAT_MEMORY_STORE is set; there is no database to migrate");
    }
    let store = PgCatalogStore::connect(&config.database_url, 2)
        .await
        .context("connecting to catalog database")?;
    store.migrate().await.context("applying migrations")?;
    println!("migrations applied");
    Ok(())
}

async fn serve(config: &SyncConfig, port: u16) -> Result<()> {
    let store = open_store(config).await?;
    let orchestrator = Arc::new(build_orchestrator(config, Arc::clone(&store)).await?);

    // held for the life of the server
    let scheduler = maybe_build_scheduler(config, Arc::clone(&orchestrator)).await?;
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting scheduler")?;
        info!(cron = %config.sync_cron, "sync scheduler started");
    }

    pkgcat_web::serve(AppState::new(store, orchestrator), port).await
}
