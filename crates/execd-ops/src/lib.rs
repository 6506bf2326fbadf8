//! Kill-switch, panic guard, state snapshot/history, and the Telegram
//! notify sink. The kill-switch is the one piece of cluster-wide state this
//! engine keeps outside Postgres: Redis is the source of truth (so every
//! worker replica and API instance agrees instantly), mirrored into
//! `ops_state`/`ops_state_history` for durability and the history export.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use execd_config::Config;
use execd_schemas::{event_type, SYNTHETIC_OPS_KILL_SWITCH, SYNTHETIC_OPS_WORKER};
use redis::AsyncCommands;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const KILL_SWITCH_REDIS_KEY: &str = "execd:kill_switch";
const LOCKOUT_CLEAR_REDIS_KEY: &str = "execd:lockout:clear";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchSource {
    Env,
    Redis,
    None,
}

#[derive(Debug, Clone, Copy)]
pub struct KillSwitchState {
    pub enabled: bool,
    pub source: KillSwitchSource,
}

/// Holds the (optional) Redis client. `redis_url` absent means the
/// deployment only ever uses the env override / default-off path — reads
/// and writes against Redis are skipped rather than erroring, since a
/// missing kill-switch backend must never itself stall the queue.
pub struct KillSwitch {
    client: Option<redis::Client>,
}

impl KillSwitch {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let client = match &cfg.redis_url {
            Some(url) => Some(redis::Client::open(url.as_str()).context("open redis client")?),
            None => None,
        };
        Ok(KillSwitch { client })
    }

    async fn conn(&self) -> Result<Option<redis::aio::MultiplexedConnection>> {
        match &self.client {
            Some(c) => Ok(Some(
                c.get_multiplexed_async_connection()
                    .await
                    .context("connect to redis")?,
            )),
            None => Ok(None),
        }
    }

    /// Precedence: env ANCHOR_KILL_SWITCH=1 > Redis flag > default off.
    pub async fn read(&self, cfg: &Config) -> Result<KillSwitchState> {
        if cfg.anchor_kill_switch {
            return Ok(KillSwitchState {
                enabled: true,
                source: KillSwitchSource::Env,
            });
        }

        let Some(mut conn) = self.conn().await? else {
            return Ok(KillSwitchState {
                enabled: false,
                source: KillSwitchSource::None,
            });
        };

        let raw: Option<String> = conn
            .get(KILL_SWITCH_REDIS_KEY)
            .await
            .context("read kill switch from redis")?;

        match raw {
            Some(v) => Ok(KillSwitchState {
                enabled: v == "1",
                source: KillSwitchSource::Redis,
            }),
            None => Ok(KillSwitchState {
                enabled: false,
                source: KillSwitchSource::None,
            }),
        }
    }

    /// Write Redis, mirror to ops_state, and append a KILL_SWITCH_SET event.
    /// `actor` is recorded in ops_audit when present.
    pub async fn set(
        &self,
        pool: &PgPool,
        sink: &dyn execd_db::NotifySink,
        enabled: bool,
        actor: Option<&str>,
    ) -> Result<()> {
        if let Some(mut conn) = self.conn().await? {
            let _: () = conn
                .set(KILL_SWITCH_REDIS_KEY, if enabled { "1" } else { "0" })
                .await
                .context("write kill switch to redis")?;
        }

        execd_db::upsert_ops_state(pool, "kill_switch", json!({ "enabled": enabled })).await?;
        execd_db::insert_ops_audit(
            pool,
            actor,
            "kill_switch_set",
            json!({ "enabled": enabled }),
        )
        .await?;
        execd_db::append_event(
            pool,
            sink,
            SYNTHETIC_OPS_KILL_SWITCH,
            event_type::KILL_SWITCH_SET,
            0,
            json!({ "enabled": enabled, "actor": actor }),
        )
        .await;
        Ok(())
    }

    /// Emit KILL_SWITCH_ON for `pending_id`, once per (pending_id, ON
    /// session). Called by the worker loop's kill-switch gate.
    pub async fn emit_kill_switch_on_once(
        &self,
        pool: &PgPool,
        sink: &dyn execd_db::NotifySink,
        seen: &mut std::collections::HashSet<String>,
        pending_id: &str,
    ) {
        if seen.contains(pending_id) {
            return;
        }
        execd_db::append_event(
            pool,
            sink,
            pending_id,
            event_type::KILL_SWITCH_ON,
            0,
            json!({}),
        )
        .await;
        seen.insert(pending_id.to_string());
    }

    /// Set the `LOCKOUT_CLEAR_TTL_SEC`-bounded override key used by
    /// `POST /risk/lockout/clear`.
    pub async fn clear_lockout(&self, ttl_secs: i64) -> Result<()> {
        if let Some(mut conn) = self.conn().await? {
            let _: () = conn
                .set_ex(LOCKOUT_CLEAR_REDIS_KEY, "1", ttl_secs.max(1) as u64)
                .await
                .context("write lockout clear override")?;
        }
        Ok(())
    }

    pub async fn lockout_override_active(&self) -> Result<bool> {
        let Some(mut conn) = self.conn().await? else {
            return Ok(false);
        };
        let exists: bool = conn
            .exists(LOCKOUT_CLEAR_REDIS_KEY)
            .await
            .context("read lockout clear override")?;
        Ok(exists)
    }
}

// ---------------------------------------------------------------------------
// Panic guard control plane (operator-facing; distinct from the worker's own
// in-process sliding-window trip logic in execd-worker)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum PanicTriggerOutcome {
    Triggered,
    Forbidden,
    Cooldown { remaining_secs: i64 },
}

pub async fn panic_trigger(
    pool: &PgPool,
    kill_switch: &KillSwitch,
    sink: &dyn execd_db::NotifySink,
    cfg: &Config,
    actor: Option<&str>,
) -> Result<PanicTriggerOutcome> {
    if cfg.exec_mode.is_prod() {
        return Ok(PanicTriggerOutcome::Forbidden);
    }

    if let Some(state) = execd_db::load_ops_state(pool, "worker_panic").await? {
        if let Some(last_panic_at) = state.get("last_panic_at").and_then(Value::as_str) {
            if let Ok(ts) = DateTime::parse_from_rfc3339(last_panic_at) {
                let elapsed = (Utc::now() - ts.with_timezone(&Utc)).num_seconds();
                if elapsed < cfg.panic_guard_cooldown_sec {
                    return Ok(PanicTriggerOutcome::Cooldown {
                        remaining_secs: cfg.panic_guard_cooldown_sec - elapsed,
                    });
                }
            }
        }
    }

    kill_switch.set(pool, sink, true, actor).await?;
    execd_db::upsert_ops_state(
        pool,
        "worker_panic",
        json!({ "last_panic_at": Utc::now().to_rfc3339() }),
    )
    .await?;
    execd_db::insert_ops_audit(pool, actor, "panic_guard_trigger", json!({})).await?;
    execd_db::append_event(
        pool,
        sink,
        SYNTHETIC_OPS_WORKER,
        event_type::PANIC_GUARD_TRIGGERED,
        0,
        json!({ "actor": actor }),
    )
    .await;

    Ok(PanicTriggerOutcome::Triggered)
}

pub async fn panic_reset(
    pool: &PgPool,
    kill_switch: &KillSwitch,
    sink: &dyn execd_db::NotifySink,
    actor: Option<&str>,
) -> Result<()> {
    kill_switch.set(pool, sink, false, actor).await?;
    execd_db::upsert_ops_state(pool, "worker_panic", json!(null)).await?;
    execd_db::insert_ops_audit(pool, actor, "panic_guard_reset", json!({})).await?;
    execd_db::append_event(
        pool,
        sink,
        SYNTHETIC_OPS_WORKER,
        event_type::PANIC_GUARD_RESET,
        0,
        json!({ "actor": actor }),
    )
    .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// State snapshot / history export
// ---------------------------------------------------------------------------

#[derive(Debug, serde::Serialize)]
pub struct StateSnapshot {
    pub kill_switch: bool,
    pub kill_switch_source: &'static str,
    pub last_heartbeat: Option<Value>,
    pub worker_panic: Option<Value>,
    pub panic_cooldown_remaining_secs: i64,
}

pub async fn state_snapshot(
    pool: &PgPool,
    kill_switch: &KillSwitch,
    cfg: &Config,
) -> Result<StateSnapshot> {
    let ks = kill_switch.read(cfg).await?;
    let heartbeat = execd_db::load_ops_state(pool, "worker_heartbeat").await?;
    let panic_state = execd_db::load_ops_state(pool, "worker_panic").await?;

    let cooldown_remaining = panic_state
        .as_ref()
        .and_then(|v| v.get("last_panic_at"))
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|ts| {
            let elapsed = (Utc::now() - ts.with_timezone(&Utc)).num_seconds();
            (cfg.panic_guard_cooldown_sec - elapsed).max(0)
        })
        .unwrap_or(0);

    Ok(StateSnapshot {
        kill_switch: ks.enabled,
        kill_switch_source: match ks.source {
            KillSwitchSource::Env => "env",
            KillSwitchSource::Redis => "redis",
            KillSwitchSource::None => "none",
        },
        last_heartbeat: heartbeat,
        worker_panic: panic_state,
        panic_cooldown_remaining_secs: cooldown_remaining,
    })
}

/// Forbidden in production, per spec.md §4.9/§6.
pub async fn history_export(
    pool: &PgPool,
    since: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<execd_db::OpsStateHistoryRow>> {
    execd_db::list_ops_state_history(pool, since, limit).await
}

pub fn history_export_csv(rows: &[execd_db::OpsStateHistoryRow]) -> Result<String> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer.write_record(["key", "value", "created_at"])?;
    for row in rows {
        writer.write_record([
            row.key.as_str(),
            &row.value.to_string(),
            &row.created_at.to_rfc3339(),
        ])?;
    }
    let bytes = writer.into_inner().context("flush csv writer")?;
    Ok(String::from_utf8(bytes).context("csv output was not utf8")?)
}

// ---------------------------------------------------------------------------
// Telegram notify sink
// ---------------------------------------------------------------------------

/// Throttled, best-effort Telegram sender. Disabled unless
/// `TELEGRAM_NOTIFY_ENABLED=1` and both token/chat id are configured. Never
/// propagates a send failure; logs via `tracing::warn!` instead.
pub struct TelegramSink {
    enabled: bool,
    token: Option<String>,
    chat_id: Option<String>,
    throttle_secs: u64,
    client: reqwest::Client,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl TelegramSink {
    pub fn from_config(cfg: &Config) -> Self {
        TelegramSink {
            enabled: cfg.telegram_notify_enabled,
            token: cfg.telegram_bot_token.clone(),
            chat_id: cfg.telegram_chat_id.clone(),
            throttle_secs: cfg.telegram_throttle_seconds,
            client: reqwest::Client::new(),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    async fn send(&self, text: &str, throttle_key: &str) {
        if !self.enabled {
            return;
        }
        let (Some(token), Some(chat_id)) = (&self.token, &self.chat_id) else {
            return;
        };

        {
            let mut last = self.last_sent.lock().unwrap();
            if let Some(t) = last.get(throttle_key) {
                if t.elapsed() < Duration::from_secs(self.throttle_secs) {
                    return;
                }
            }
            last.insert(throttle_key.to_string(), Instant::now());
        }

        let url = format!("https://api.telegram.org/bot{token}/sendMessage");
        let truncated: String = text.chars().take(4000).collect();
        let result = self
            .client
            .post(&url)
            .json(&json!({ "chat_id": chat_id, "text": truncated }))
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!(status = %resp.status(), "telegram send failed"),
            Err(e) => tracing::warn!(error = %e, "telegram send error"),
        }
    }
}

#[async_trait::async_trait]
impl execd_db::NotifySink for TelegramSink {
    async fn notify(&self, command_id: &str, event_type: &str, payload: &Value) {
        let code = payload.get("code").and_then(Value::as_str).unwrap_or("");
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("");
        let attempt = payload.get("attempt").cloned().unwrap_or(json!(""));
        let text = format!(
            "[{event_type}] id={command_id} attempt={attempt} code={code} message={message}"
        );
        let throttle_key = format!("{event_type}_{code}");
        self.send(&text, &throttle_key).await;
    }
}
