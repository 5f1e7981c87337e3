use std::io;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ccm-cli")]
#[command(about = "CCM generation ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest one generation folder and print the run report as JSON.
    Sync {
        /// Generation key, e.g. 20250103.
        #[arg(long)]
        generation: String,
        /// Drive folder holding the generation workbooks.
        #[arg(long)]
        folder: String,
        /// Ignore any persisted resume point.
        #[arg(long)]
        force: bool,
    },
    Migrate,
    Serve,
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("CCM_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_writer(io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync {
            generation,
            folder,
            force,
        } => {
            info!(command = "sync", fecha_generacion = %generation, drive_folder_id = %folder, force, "running sync");
            let report = ccm_sync::run_sync_once_from_env(&generation, &folder, force).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Migrate => {
            info!(command = "migrate", "applying migrations");
            ccm_sync::migrate_from_env().await?;
        }
        Commands::Serve => {
            info!(command = "serve", "starting http server");
            ccm_web::serve_from_env().await?;
        }
    }

    Ok(())
}
