use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use railsync_sync::{build_scheduler, connect_store, run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "railsync-cli")]
#[command(about = "Reconcile train-service batches into the rail store")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile one batch file and print the run summary.
    Sync {
        /// Batch file to load instead of RAILSYNC_BATCH_PATH.
        #[arg(long)]
        batch: Option<PathBuf>,
    },
    /// Apply pending schema migrations.
    Migrate,
    /// Run `sync` on RAILSYNC_SYNC_CRON until interrupted.
    Schedule,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json);
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { batch: None }) {
        Commands::Sync { batch } => {
            let summary = run_sync_once(&config, batch.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let mut sched = build_scheduler(config.clone()).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
            info!("scheduler stopped");
        }
    }

    Ok(())
}
