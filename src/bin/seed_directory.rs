use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::info;

use shiftbridge::config;
use shiftbridge::db::{self, directory};
use shiftbridge::model::{Connection, EmployeeRecord};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Load employee mappings and team connections from YAML into SQLite"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Directory YAML with `employees` and `connections` lists
    #[arg(long)]
    directory: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    employees: Vec<EmployeeRecord>,
    #[serde(default)]
    connections: Vec<Connection>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let raw = std::fs::read_to_string(&args.directory)
        .with_context(|| format!("failed to read {}", args.directory.display()))?;
    let file: DirectoryFile = serde_yaml::from_str(&raw).context("invalid directory YAML")?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    for employee in &file.employees {
        directory::upsert_employee(&pool, employee).await?;
    }
    for connection in &file.connections {
        directory::upsert_connection(&pool, connection).await?;
    }
    info!(
        employees = file.employees.len(),
        connections = file.connections.len(),
        "directory seeded"
    );
    Ok(())
}
