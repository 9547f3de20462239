//! CLI entry point for the fleet ingestion service.
//!
//! Provides subcommands for running the polling service, triggering a
//! single ingestion cycle, and inspecting store statistics.

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleet_ingest::config::Settings;
use fleet_ingest::fetch::BasicClient;
use fleet_ingest::service::IngestionService;
use fleet_ingest::store::{RedisStore, StateStore};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "fleet_ingest")]
#[command(about = "GTFS-RT vehicle position ingestion service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the polling service until interrupted
    Serve,
    /// Run a single fetch-normalize-publish cycle and exit
    Ingest,
    /// Print store statistics as JSON
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/fleet_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("fleet_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(Settings::from_env()?);

    match cli.command {
        Commands::Serve => {
            let store = connect_store(&settings).await?;
            let service = Arc::new(IngestionService::new(
                settings,
                store,
                BasicClient::new(),
            ));
            service.clone().start().await;

            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");
            service.stop().await;
        }
        Commands::Ingest => {
            let store = connect_store(&settings).await?;
            let service = Arc::new(IngestionService::new(
                settings,
                store,
                BasicClient::new(),
            ));
            if let Err(e) = service.refresh_schedule().await {
                tracing::warn!(error = %e, "Schedule load failed, ingesting without enrichment");
            }
            let outcome = service.run_cycle().await?;
            info!(
                received = outcome.received,
                published = outcome.published,
                unchanged = outcome.unchanged,
                transitions = outcome.transitions,
                "Cycle finished"
            );
        }
        Commands::Stats => {
            let store = connect_store(&settings).await?;
            let stats = store.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}

async fn connect_store(settings: &Settings) -> Result<Arc<dyn StateStore>> {
    let store = RedisStore::connect(&settings.redis_url()).await?;
    Ok(Arc::new(store))
}
