use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dinesafe_sync::{report_markdown, Pipeline, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "dinesafe")]
#[command(about = "DineSafe inspection pipeline")]
struct Cli {
    /// Directory holding pipeline.yaml and reports/ (overrides DINESAFE_WORKSPACE_ROOT).
    #[arg(long, global = true)]
    workspace_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every pipeline stage once.
    Run,
    /// Create the database tables.
    Migrate,
    /// Run the pipeline on the configured cron schedules until interrupted.
    Schedule,
    /// Summarize the most recent runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dinesafe=info,dinesafe_sync=info,dinesafe_storage=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.workspace_root {
        config.workspace_root = root;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let output = Pipeline::new(config).await?.run_once().await?;
            let summary = output.summary;
            println!(
                "run complete: run_id={} inserted={} inspections={} reports={}",
                summary.run_id,
                summary.load.rows_inserted,
                summary.inspections_labeled,
                summary.reports_dir
            );
        }
        Commands::Migrate => {
            let database_url = config.database_url.clone();
            Pipeline::new(config).await?.migrate().await?;
            println!("migrated {database_url}");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let pipeline = Arc::new(Pipeline::new(config).await?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .context("scheduler was not built")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_root())?);
        }
    }

    Ok(())
}
