//! execd-worker entry point. Runs the poll loop as its own process, sharing
//! the Postgres store with execd-api rather than being embedded in it (the
//! submission API and the worker loop are separate architectural components
//! per the run model, and neither needs the other's process up to do its own
//! job).

use anyhow::Context;
use execd_ops::KillSwitch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::from_filename(".env.local");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = execd_config::Config::from_env().context("loading configuration")?;
    let pool = execd_db::connect_from_env()
        .await
        .context("connecting to database")?;
    execd_db::migrate(&pool).await.context("running migrations")?;
    execd_db::strict_check(&pool)
        .await
        .context("strict schema check failed")?;

    let kill_switch = KillSwitch::from_config(&config).context("building kill switch")?;
    let sink: Box<dyn execd_db::NotifySink> = if config.telegram_notify_enabled {
        Box::new(execd_ops::TelegramSink::from_config(&config))
    } else {
        Box::new(execd_db::NoopSink)
    };
    let registry = execd_registry::Registry::new();
    let policies = execd_policy::default_chain();

    let worker_id = std::env::var("WORKER_ID").unwrap_or_else(|_| format!("worker-{}", std::process::id()));
    info!(worker_id = %worker_id, "execd-worker starting");

    let mut worker_loop = execd_worker::WorkerLoop::new(
        &pool,
        sink.as_ref(),
        &registry,
        &policies,
        &config,
        &kill_switch,
        worker_id,
    );

    let stop = worker_loop.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, stopping after current tick");
            stop.store(false, std::sync::atomic::Ordering::Relaxed);
        }
    });

    worker_loop.run().await;
    Ok(())
}
