use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};
use wikisync_sync::{RunStatus, StoreMode, SyncConfig};

#[derive(Debug, Parser)]
#[command(name = "wikisync")]
#[command(about = "Mirror wiki cargo tables into Postgres")]
struct Cli {
    /// Raise log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled table once.
    Sync {
        /// Write to in-memory tables instead of Postgres.
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run syncs on the configured cron until interrupted.
    Schedule,
    /// List registered table definitions.
    Tables,
}

fn init_logging(verbose: u8, json: bool) -> Result<()> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer.json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .try_init()?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json)?;
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { dry_run: false }) {
        Commands::Sync { dry_run } => {
            let mode = if dry_run {
                StoreMode::DryRun
            } else {
                StoreMode::Postgres
            };
            let run = wikisync_sync::run_sync_once(&config, mode).await?;
            let summary = &run.summary;
            println!(
                "sync {:?}: run_id={} tables={} index_entries={} reports={}",
                summary.status,
                summary.run_id,
                summary.tables.len(),
                summary.index_entries.len(),
                run.reports_dir.display()
            );
            if summary.status != RunStatus::Completed {
                let failed = summary
                    .failed_tables()
                    .map(|t| t.target.as_str())
                    .collect::<Vec<_>>();
                bail!("{} table(s) failed: {}", failed.len(), failed.join(", "));
            }
        }
        Commands::Migrate => {
            let pool = wikisync_sync::connect_pool(&config.database_url).await?;
            wikisync_sync::migrate(&pool).await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let Some(mut sched) = wikisync_sync::maybe_build_scheduler(config).await? else {
                bail!("scheduler was not built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Tables => {
            let registry = wikisync_transforms::load_table_registry(&config.tables_path)
                .with_context(|| format!("loading {}", config.tables_path.display()))?;
            for table in &registry.tables {
                println!(
                    "{:<24} <- {:<24} identity={} {}",
                    table.target,
                    table.source,
                    table.identity,
                    if table.enabled { "" } else { "(disabled)" }
                );
            }
        }
    }

    Ok(())
}
