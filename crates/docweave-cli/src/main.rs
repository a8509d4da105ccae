//! Docweave CLI - run the blog tutorial against MongoDB
//!
//! Usage:
//!   docweave                               Run the lookup against the default database
//!   docweave --seed group                  Seed sample data, then group posts
//!   docweave --memory find-all lookup      Run on the in-memory store (seeded automatically)
//!   docweave --uri mongodb://host/db lean  Use another deployment
//!   docweave --timeout-ms 500 find-some    Fail calls slower than 500ms

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use docweave_cli::{Operation, Tutorial};
use docweave_mongodb::{MemorySession, MongoSession, Session};

const DEFAULT_URI: &str = "mongodb://127.0.0.1:27017/mongoose_tutorial";

#[derive(Parser)]
#[command(name = "docweave")]
#[command(about = "Blog tutorial over schema-validated MongoDB collections", long_about = None)]
#[command(version)]
struct Cli {
    /// MongoDB connection string; must name a database
    #[arg(long, default_value = DEFAULT_URI)]
    uri: String,

    /// Use the in-memory store instead of MongoDB
    #[arg(long)]
    memory: bool,

    /// Seed sample data before running (always done with --memory)
    #[arg(long)]
    seed: bool,

    /// Per-call timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Operations to run, in order
    #[arg(value_enum, default_value = "lookup")]
    operations: Vec<Operation>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let session: Arc<dyn Session> = if cli.memory {
        Arc::new(MemorySession::with_database("mongoose_tutorial"))
    } else {
        let session = MongoSession::connect(&cli.uri)
            .await
            .with_context(|| format!("Failed to connect to {}", cli.uri))?;
        Arc::new(session)
    };
    session.ping().await.context("Store is not reachable")?;
    info!(backend = session.backend(), "Connection Success!!!");

    let mut tutorial = Tutorial::new(session).context("Failed to register schemas")?;
    if let Some(ms) = cli.timeout_ms {
        tutorial = tutorial.with_timeout(Duration::from_millis(ms));
    }
    tutorial
        .ensure_indexes()
        .await
        .context("Failed to create unique indexes")?;

    if cli.memory || cli.seed {
        tutorial.seed().await.context("Failed to seed sample data")?;
    }

    for operation in cli.operations {
        let value = operation
            .run(&tutorial)
            .await
            .with_context(|| format!("Operation '{}' failed", operation))?;
        println!("{}", serde_json::to_string_pretty(&value)?);
    }

    Ok(())
}

/// Initialize logging based on log level
fn init_logging(level: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok(); // Ignore error if already initialized

    Ok(())
}
