use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use newswire_storage::PgArticleStore;
use newswire_sync::{
    build_coordinator, init_logging, maybe_build_cron_scheduler, ScrapeConfig, ScrapePass, Scheduler,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "newswire")]
#[command(about = "Newswire news ingestion command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scrape pass and print its summary.
    Scrape(PassArgs),
    /// Scrape on the configured interval (or cron expressions) until Ctrl-C.
    Schedule(PassArgs),
    /// Apply the SQL migrations.
    Migrate,
}

#[derive(Debug, Default, Args)]
struct PassArgs {
    /// Keep articles in memory instead of writing to Postgres.
    #[arg(long)]
    dry_run: bool,
    /// Source registry file; overrides NEWSWIRE_SOURCES.
    #[arg(long)]
    sources: Option<PathBuf>,
    /// Only scrape the named source. Repeatable.
    #[arg(long = "only")]
    only: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = ScrapeConfig::from_env();
    let log_path = init_logging(&config.log_dir)?;
    info!(log = %log_path.display(), "logging initialised");

    match cli.command.unwrap_or(Commands::Scrape(PassArgs::default())) {
        Commands::Scrape(args) => {
            if let Some(path) = args.sources {
                config.sources_path = path;
            }
            let coordinator = build_coordinator(&config, &args.only, args.dry_run).await?;
            let summary = coordinator.run_once().await;
            println!("{}", summary.to_json_pretty()?);
            println!("scrape complete: run_id={} {}", summary.run_id, summary.headline());
        }
        Commands::Schedule(args) => {
            if let Some(path) = args.sources {
                config.sources_path = path;
            }
            let coordinator = build_coordinator(&config, &args.only, args.dry_run).await?;
            let pass: Arc<dyn ScrapePass> = Arc::new(coordinator);

            match maybe_build_cron_scheduler(pass.clone(), &config.scrape_crons).await? {
                Some(mut sched) => {
                    sched.start().await.context("starting cron scheduler")?;
                    info!(crons = ?config.scrape_crons, "cron scheduler running");
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    sched.shutdown().await.context("stopping cron scheduler")?;
                }
                None => {
                    let handle = Scheduler::spawn(pass, config.schedule_config());
                    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
                    info!(stats = ?handle.stats(), "stopping scheduler");
                    handle.shutdown();
                }
            }
        }
        Commands::Migrate => {
            let store = PgArticleStore::connect(&config.database_url, config.db_max_connections)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
    }

    Ok(())
}
