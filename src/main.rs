use anyhow::{Context, Result};
use clap::Parser;
use event_icon_migrate::config::{MigrationConfig, REQUIRED_VARS, SCHEMA_VAR};
use event_icon_migrate::database_ops::events::PgEventStore;
use event_icon_migrate::fetch::HttpFetcher;
use event_icon_migrate::logging::init_tracing;
use event_icon_migrate::orchestrator::{MigrateOptions, Migrator};
use event_icon_migrate::progress::LineProgress;
use event_icon_migrate::storage::gcs::GcsClient;
use event_icon_migrate::util::env as env_util;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "event-icon-migrate",
    version,
    about = "Re-host event icons in Cloud Storage and point the Events table at them"
)]
struct Cli {
    /// Fetch and classify every icon but skip uploads and row updates
    #[arg(long, default_value_t = false)]
    dry_run: bool,
    /// Schema holding the "Events" table (overrides DB_SCHEMA)
    #[arg(long)]
    schema: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_util::init_env();
    init_tracing("info")?;
    let cli = Cli::parse();

    env_util::preflight_check("event_icon_migrate", &REQUIRED_VARS, &[SCHEMA_VAR, "PROGRESS_INTERVAL"]);
    let config = MigrationConfig::from_env()?;
    let schema = cli.schema.unwrap_or_else(|| config.schema.clone());

    let gcs = GcsClient::authenticate(&config.credentials)
        .context("authenticate to Cloud Storage")?;
    let bucket = gcs.bucket(&config.bucket);
    let fetcher = HttpFetcher::new()?;

    let store = PgEventStore::connect(&config.db_uri).await?;
    info!("Connected to PostgreSQL");

    let mut progress = LineProgress::new("event_icons");
    let options = MigrateOptions {
        schema,
        dry_run: cli.dry_run,
    };
    let report = Migrator::new(store, &fetcher, &bucket, &mut progress, options)
        .run()
        .await?;

    info!(
        total = report.total,
        completed = report.completed,
        ignored = report.ignored,
        errored = report.errored_ids.len(),
        "event icon migration done"
    );
    Ok(())
}
