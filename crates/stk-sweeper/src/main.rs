//! stk-sweeper entry point.
//!
//! This file is intentionally thin: it sets up tracing, loads and validates
//! config, wires the Postgres store into the inventory service, and runs
//! the two scheduled bodies (the reservation expiry sweep and the batch
//! alert scan) on their configured intervals. Both bodies are stateless
//! over (`now`, store), so overlapping or redundant runs are harmless.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Context;
use chrono::{Duration, Utc};
use clap::Parser;
use tracing::{info, warn};

use stk_alerts::{AlertEngine, LogSink};
use stk_audit::{AuditLog, AuditWriter};
use stk_config::InventoryConfig;
use stk_db::PgStore;
use stk_inventory::InventoryService;
use stk_store::StockStore;

#[derive(Debug, Parser)]
#[command(
    name = "stk-sweeper",
    about = "Scheduled expiry sweep and low-stock alert scan"
)]
struct Cli {
    /// YAML config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run one sweep and one scan, then exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist; production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => InventoryConfig::load(path)?,
        None => {
            let config = InventoryConfig::default();
            config.validate()?;
            config
        }
    };
    info!(
        config_hash = %config.config_hash()?,
        sweep_interval_secs = config.sweep_interval_secs,
        scan_interval_secs = config.scan_interval_secs,
        "stk-sweeper starting"
    );

    let pool = stk_db::connect_from_env().await?;
    stk_db::migrate(&pool).await?;
    let store = Arc::new(PgStore::new(pool));

    let audit: Arc<dyn AuditLog> = Arc::new(
        AuditWriter::new(&config.audit_log_path, "stock", config.audit_hash_chain)
            .context("open audit log")?,
    );
    let service = InventoryService::new(
        store.clone(),
        store.clone(),
        AlertEngine::new(store.clone(), Arc::new(LogSink)),
        audit,
    )
    .with_default_ttl(Duration::seconds(config.default_ttl_secs));
    let scan_engine = AlertEngine::new(store.clone(), Arc::new(LogSink));

    if cli.once {
        run_sweep(&service).await;
        run_scan(store.as_ref(), &scan_engine, &config).await;
        return Ok(());
    }

    let mut sweep_tick =
        tokio::time::interval(StdDuration::from_secs(config.sweep_interval_secs));
    let mut scan_tick = tokio::time::interval(StdDuration::from_secs(config.scan_interval_secs));
    loop {
        tokio::select! {
            _ = sweep_tick.tick() => run_sweep(&service).await,
            _ = scan_tick.tick() => run_scan(store.as_ref(), &scan_engine, &config).await,
        }
    }
}

async fn run_sweep(service: &InventoryService) {
    match service.expire_sweep(Utc::now()).await {
        Ok(report) => {
            if report.expired > 0 {
                info!(
                    examined = report.examined,
                    expired = report.expired,
                    reclaimed = report.reclaimed_quantity,
                    "sweep pass complete"
                );
            }
        }
        Err(err) => warn!(error = %err, "sweep pass failed"),
    }
}

async fn run_scan(store: &PgStore, engine: &AlertEngine, config: &InventoryConfig) {
    let records = match store.list_stock().await {
        Ok(records) => records,
        Err(err) => {
            warn!(error = %err, "alert scan could not list stock");
            return;
        }
    };
    match engine
        .scan(&records, config.scan_low_override, Utc::now())
        .await
    {
        Ok(opened) => {
            if !opened.is_empty() {
                info!(opened = opened.len(), "alert scan opened alerts");
            }
        }
        Err(err) => warn!(error = %err, "alert scan failed"),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}
