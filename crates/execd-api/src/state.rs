//! Shared runtime state for execd-api. Cloneable via `Arc`; handlers receive
//! `State<Arc<AppState>>`.

use std::sync::Arc;
use std::time::Instant;

use execd_config::Config;
use execd_db::NotifySink;
use execd_ops::{KillSwitch, TelegramSink};
use execd_registry::Registry;
use sqlx::PgPool;

/// Shared state for the HTTP surface. This process only submits and reads
/// commands; it never runs them. Running is `execd-worker`'s job, against
/// the same store. `registry` is kept here only to validate that a
/// `POST /domain-commands/{kind}` endpoint names a handler that actually
/// exists.
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub sink: Box<dyn NotifySink>,
    pub kill_switch: KillSwitch,
    pub registry: Registry,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Arc<Self>> {
        let kill_switch = KillSwitch::from_config(&config)?;
        let sink: Box<dyn NotifySink> = if config.telegram_notify_enabled {
            Box::new(TelegramSink::from_config(&config))
        } else {
            Box::new(execd_db::NoopSink)
        };

        Ok(Arc::new(AppState {
            pool,
            config,
            sink,
            kill_switch,
            registry: Registry::new(),
            started_at: Instant::now(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// `OPS_TOKEN` presented by a caller, if it matches the configured
    /// token (or no token is configured, in which case every request is
    /// authorized).
    pub fn authorize_ops(&self, presented: Option<&str>) -> bool {
        match &self.config.ops_token {
            None => true,
            Some(expected) => presented == Some(expected.as_str()),
        }
    }
}
