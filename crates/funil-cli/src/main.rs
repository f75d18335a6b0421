//! Command-line entry point: serve the API or run one-off ingestion and profiling.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use funil_ai::OpenAiChatDriver;
use funil_analytics::{aggregate, build_profile};
use funil_ingest::{AliasTable, IngestPipeline};
use funil_store::{MemoryRowStore, PgRowStore, RowStore, DEFAULT_PAGE_SIZE};
use funil_web::{serve_from_env, AppState, StaticTokenIdentity};
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "funil", version, about = "CRM spreadsheet ingestion and sales analytics")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API.
    Serve,
    /// Ingest one spreadsheet for an account and print the report.
    Ingest {
        #[arg(long)]
        owner: Uuid,
        #[arg(long)]
        file: PathBuf,
    },
    /// Print an account's analytics profile.
    Profile {
        #[arg(long)]
        owner: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .try_init()
        .context("installing tracing subscriber")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve().await,
        Commands::Ingest { owner, file } => ingest(owner, file).await,
        Commands::Profile { owner } => profile(owner).await,
    }
}

async fn row_store_from_env() -> Result<Arc<dyn RowStore>> {
    match std::env::var("DATABASE_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let store = PgRowStore::connect(&url)
                .await
                .context("connecting to postgres")?;
            store
                .ensure_schema()
                .await
                .context("ensuring opportunities schema")?;
            Ok(Arc::new(store))
        }
        _ => {
            warn!("DATABASE_URL is not set, rows will live in memory for this process only");
            Ok(Arc::new(MemoryRowStore::new()))
        }
    }
}

fn alias_table_from_env() -> Result<AliasTable> {
    match std::env::var("FUNIL_ALIAS_FILE") {
        Ok(path) if !path.trim().is_empty() => AliasTable::from_yaml_file(Path::new(&path)),
        _ => Ok(AliasTable::default()),
    }
}

async fn serve() -> Result<()> {
    let store = row_store_from_env().await?;
    let identity = StaticTokenIdentity::from_env().context("loading FUNIL_API_TOKENS")?;
    let llm = OpenAiChatDriver::from_env().context("configuring the language model driver")?;
    let state = AppState::new(
        store,
        Arc::new(identity),
        Arc::new(llm),
        alias_table_from_env()?,
    );
    serve_from_env(state).await
}

async fn ingest(owner: Uuid, file: PathBuf) -> Result<()> {
    let bytes = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
    let store = row_store_from_env().await?;
    let pipeline = IngestPipeline::new(alias_table_from_env()?);
    let outcome = pipeline
        .run(store.as_ref(), owner, &bytes)
        .await
        .context("running ingestion")?;
    println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    Ok(())
}

async fn profile(owner: Uuid) -> Result<()> {
    let store = row_store_from_env().await?;
    let dataset = store
        .fetch_all(owner, DEFAULT_PAGE_SIZE)
        .await
        .context("loading stored opportunities")?;
    match aggregate(&dataset) {
        Some(analytics) => {
            println!("{}", serde_json::to_string_pretty(&build_profile(analytics))?)
        }
        None => println!("no opportunities stored for {owner}"),
    }
    Ok(())
}
