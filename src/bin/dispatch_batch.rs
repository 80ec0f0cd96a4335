use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::info;

use shiftbridge::config;
use shiftbridge::db;
use shiftbridge::handlers::{Dispatcher, Services};
use shiftbridge::model::ChangeBatch;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Dispatch one change batch for a team and print the per-item response"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Team the batch belongs to
    #[arg(long)]
    team: String,

    /// Batch JSON file; reads stdin when omitted
    #[arg(long)]
    batch: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let raw = match &args.batch {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            buf
        }
    };
    let batch: ChangeBatch = serde_json::from_str(&raw).context("invalid change batch JSON")?;
    info!(team = %args.team, items = batch.requests.len(), "dispatching batch");

    let dispatcher = Dispatcher::new(Services::from_config(&cfg, pool)?);
    let response = dispatcher.dispatch(&batch, &args.team).await;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
