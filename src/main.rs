use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use shiftbridge::config;
use shiftbridge::db::{self, SqliteStore};
use shiftbridge::deferred;
use shiftbridge::frontend::FrontEndClient;
use shiftbridge::gateway::ConnectionLookup;
use shiftbridge::sync::Syncer;
use shiftbridge::wfm::WfmClient;

#[derive(Debug, Parser)]
#[command(author, version, about = "Deferred-action worker and periodic WFM sync")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run only the deferred-action worker
    #[arg(long)]
    no_sync: bool,
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

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let store = Arc::new(SqliteStore::new(pool.clone()));
    let frontend = Arc::new(FrontEndClient::from_config(&cfg.frontend)?);
    let wfm = Arc::new(WfmClient::from_config(&cfg.wfm)?);

    // Deferred-action worker (single task)
    let worker_pool = pool.clone();
    let worker_frontend = frontend.clone();
    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    let max_backoff = cfg.app.max_backoff_seconds as i64;
    tokio::spawn(async move {
        loop {
            match deferred::process_next_action(&worker_pool, worker_frontend.as_ref(), max_backoff).await {
                Ok(processed) => {
                    if !processed {
                        tokio::time::sleep(poll_sleep).await;
                    }
                }
                Err(err) => {
                    error!(?err, "deferred worker error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    });

    if !args.no_sync {
        let syncer = Syncer::new(
            pool.clone(),
            cfg.engine_settings(),
            cfg.sync.clone(),
            wfm,
            store.clone(),
            frontend,
            store.clone(),
        );
        let connections = store.clone();
        let every = Duration::from_secs(cfg.sync.interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match connections.list_connections().await {
                    Ok(list) => {
                        let report = syncer.run_pass(&list, Utc::now()).await;
                        info!(
                            teams = list.len(),
                            created = report.created,
                            updated = report.updated,
                            deleted = report.deleted,
                            failed = report.failed,
                            has_more = report.has_more,
                            "sync pass complete"
                        );
                    }
                    Err(err) => error!(?err, "could not list connections"),
                }
            }
        });
    }

    info!("shiftbridge running; ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}
