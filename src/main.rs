use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use comfy_table::{Table, presets::UTF8_FULL};
use configuration::{BackendKind, Config, load_config};
use core_types::ErrorCode;
use database::{CollectionSchema, Database, Filter};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// The main entry point for the Strata operator CLI.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; the environment may already be populated.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = build_config(&cli)?;
    let _log_guard = init_tracing(&config);

    let db = Database::from_config(&config, alerter::build_notifier(&config.alerting));
    db.connect()
        .await
        .with_context(|| format!("connecting to {}", config.database.backend))?;

    let outcome = match cli.command {
        Commands::Health => handle_health(&db).await,
        Commands::SyncSchema(args) => handle_sync_schema(&db, args).await,
        Commands::Collections(args) => handle_collections(&db, args).await,
    };

    if let Err(e) = db.disconnect().await {
        tracing::warn!(error = %e, "Disconnect failed");
    }
    outcome
}

// ==============================================================================
// CLI Structure
// ==============================================================================

/// Operator tooling for the Strata data layer.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file (optional).
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    /// Overrides the configured storage backend.
    #[arg(long, global = true, value_enum)]
    backend: Option<BackendKind>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, ping, and report pool and resilience state.
    Health,
    /// Register the built-in and the given content collections.
    SyncSchema(SyncSchemaArgs),
    /// List physical collections with their record counts.
    Collections(CollectionsArgs),
}

#[derive(Parser)]
struct SyncSchemaArgs {
    /// JSON file holding an array of collection schemas.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Parser)]
struct CollectionsArgs {
    /// Schemas to register first. Relational backends can only count
    /// registered collections.
    #[arg(long)]
    file: Option<PathBuf>,
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = load_config(&cli.config).context("loading configuration")?;
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.database.url = url;
    }
    if let Some(backend) = cli.backend {
        config.database.backend = backend;
    }
    config.validate().context("validating configuration")?;
    Ok(config)
}

/// Console plus a daily-rolling file. The returned guard flushes the file
/// writer on drop and must live until `main` returns.
fn init_tracing(config: &Config) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(&config.logging.directory, &config.logging.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,strata=debug,database=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    guard
}

// ==============================================================================
// Command Logic
// ==============================================================================

async fn handle_health(db: &Database) -> anyhow::Result<()> {
    let report = db.health_check().await;
    let pool = db.pool_diagnostics();
    let metrics = db.resilience().metrics();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Check", "Value"]);
    table.add_row(vec!["Backend".to_string(), db.adapter().backend().to_string()]);
    table.add_row(vec!["Healthy".to_string(), report.healthy.to_string()]);
    table.add_row(vec!["Ping latency (ms)".to_string(), format!("{:.2}", report.latency_ms)]);
    if let Some(error) = &report.error {
        table.add_row(vec!["Ping error".to_string(), error.clone()]);
    }
    table.add_row(vec!["Pool health".to_string(), format!("{:?}", pool.health)]);
    table.add_row(vec![
        "Pool utilization".to_string(),
        format!(
            "{:.1}% ({}/{} active, {} waiting)",
            pool.utilization_percent,
            pool.stats.active_connections,
            pool.stats.total_connections,
            pool.stats.waiting_requests
        ),
    ]);
    for recommendation in &pool.recommendations {
        table.add_row(vec!["Recommendation".to_string(), recommendation.clone()]);
    }
    table.add_row(vec!["Retries".to_string(), metrics.total_retries.to_string()]);
    table.add_row(vec!["Failed retries".to_string(), metrics.failed_retries.to_string()]);
    table.add_row(vec![
        "Reconnections (ok/failed)".to_string(),
        format!("{}/{}", metrics.successful_reconnections, metrics.failed_reconnections),
    ]);
    println!("{table}");

    if !report.healthy {
        bail!("health check failed");
    }
    Ok(())
}

async fn handle_sync_schema(db: &Database, args: SyncSchemaArgs) -> anyhow::Result<()> {
    let schemas = read_schemas(&args.file)?;
    if schemas.is_empty() {
        bail!("{} defines no collections", args.file.display());
    }

    db.setup_auth_models().await?;

    let progress_bar = ProgressBar::new(schemas.len() as u64);
    progress_bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    for schema in &schemas {
        progress_bar.set_message(schema.id.clone());
        db.collection().create_model(schema).await?;
        progress_bar.inc(1);
    }
    progress_bar.finish_with_message("Schema in sync");

    tracing::info!(collections = db.collection().len(), "Schema sync complete");
    Ok(())
}

async fn handle_collections(db: &Database, args: CollectionsArgs) -> anyhow::Result<()> {
    db.setup_auth_models().await?;
    if let Some(file) = &args.file {
        for schema in read_schemas(file)? {
            db.collection().create_model(&schema).await?;
        }
    }

    let physical = db
        .adapter()
        .list_collections()
        .await
        .map_err(|e| e.into_database_error(ErrorCode::FIND_MANY_ERROR, "listing collections"))?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec!["Collection", "Records"]);
    for name in physical {
        let count = match db.adapter().count(&name, &Filter::All).await {
            Ok(count) => count.to_string(),
            Err(e) => {
                tracing::debug!(collection = %name, error = %e, "Count unavailable");
                "-".to_string()
            }
        };
        table.add_row(vec![name, count]);
    }
    println!("{table}");
    Ok(())
}

fn read_schemas(path: &Path) -> anyhow::Result<Vec<CollectionSchema>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
