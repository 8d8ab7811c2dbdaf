use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomledger::catalog::Catalog;
use roomledger::clock::{Clock, SystemClock};
use roomledger::config::Config;
use roomledger::engine::Engine;
use roomledger::notify::NotifyHub;
use roomledger::sweeper::{HoldCleanupJob, NightAuditJob, Sweeper, run_compactor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    roomledger::observability::init(config.metrics_port)?;

    std::fs::create_dir_all(&config.data_dir)?;
    let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), catalog.clone(), clock.clone(), notify)?);

    info!("roomledger started");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  catalog: {} ({} room types, {} rooms)",
        config.catalog_path.display(),
        catalog.room_types.len(),
        catalog.rooms.len()
    );
    info!("  hold ttl: {}s", config.hold_ttl.as_secs());
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    let night_audit = Arc::new(Sweeper::new(
        NightAuditJob { engine: engine.clone() },
        &config.night_audit_schedule,
        clock.clone(),
        config.sweep_timeout,
    )?);
    let hold_cleanup = Arc::new(Sweeper::new(
        HoldCleanupJob { engine: engine.clone() },
        &config.hold_cleanup_schedule,
        clock.clone(),
        config.sweep_timeout,
    )?);

    let shutdown = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();
    {
        let sweeper = night_audit.clone();
        let token = shutdown.clone();
        tasks.spawn(async move { sweeper.run_scheduled(token).await });
    }
    {
        let sweeper = hold_cleanup.clone();
        let token = shutdown.clone();
        tasks.spawn(async move { sweeper.run_scheduled(token).await });
    }
    tasks.spawn(run_compactor(engine.clone(), config.compact_threshold, shutdown.clone()));

    // Graceful shutdown on SIGTERM/ctrl-c: stop the schedulers, let runs in flight finish
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }

    info!("shutdown signal received, stopping sweepers");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}

    info!("roomledger stopped");
    Ok(())
}
