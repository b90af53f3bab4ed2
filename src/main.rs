//! Service entry point
//!
//! Wires configuration, logging, the database, and the background workers
//! (access poller, transfer-request sweeper, idempotency GC), then waits
//! for ctrl-c and drains everything through one cancellation token.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use point_ledger::akerun::{AccessPoller, AkerunClient};
use point_ledger::config::AppConfig;
use point_ledger::daily_bonus::DailyBonusEngine;
use point_ledger::db::Database;
use point_ledger::ledger::friendship::AllowAll;
use point_ledger::ledger::{LedgerEngine, idempotency};
use point_ledger::logging::init_logging;
use point_ledger::transfer_request;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref()).context("loading configuration")?;

    let _log_guard = init_logging(&config.log);
    tracing::info!("point-ledger starting");

    let database = Database::connect(&config.database_url)
        .await
        .context("connecting to PostgreSQL")?;
    database.init_schema().await.context("initializing schema")?;

    let engine = Arc::new(LedgerEngine::new(
        database.pool().clone(),
        Arc::new(AllowAll),
    ));
    let bonus_engine = Arc::new(DailyBonusEngine::new(
        engine.clone(),
        config.bonus.base_points,
        config.bonus.timezone_offset_hours,
    ));

    let cancel = CancellationToken::new();
    let mut workers = tokio::task::JoinSet::new();

    // Access-event poller feeding the daily-bonus engine.
    let poller = AccessPoller::new(
        database.pool().clone(),
        Arc::new(AkerunClient::new(config.poller.akerun.clone())),
        bonus_engine.clone(),
        config.poller.clone(),
    );
    let poller_cancel = cancel.clone();
    workers.spawn(async move {
        poller.run(poller_cancel).await;
    });

    // Transfer-request expiry sweeper.
    let sweep_interval = std::time::Duration::from_secs(config.sweep_interval_secs);
    workers.spawn(transfer_request::run_sweeper(
        database.pool().clone(),
        sweep_interval,
        cancel.clone(),
    ));

    // Idempotency key garbage collection.
    let gc_pool = database.pool().clone();
    let gc_cancel = cancel.clone();
    workers.spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            tokio::select! {
                _ = gc_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = idempotency::purge_expired(&gc_pool).await {
                        tracing::warn!(error = %e, "Idempotency GC failed");
                    }
                }
            }
        }
    });

    tracing::info!("point-ledger running - ctrl-c to stop");
    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;

    tracing::info!("Shutdown signal received - draining workers");
    cancel.cancel();
    while workers.join_next().await.is_some() {}

    tracing::info!("point-ledger stopped");
    Ok(())
}
