//! Typed access to the command queue, event log, idempotency keys, ops
//! state, and risk ledger. Every mutating path takes row-level locks with
//! skip-locked semantics so concurrent workers never contend on the same row.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use execd_schemas::{codes, event_type, trim_event_payload, Command, CommandStatus, Event};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

pub const ENV_DB_URL: &str = "DATABASE_URL";

/// Tables the schema strict-check expects to exist.
pub const REQUIRED_TABLES: &[&str] = &[
    "commands_domain",
    "domain_events",
    "idempotency_keys",
    "ops_state",
    "ops_state_history",
    "risk_state",
    "ops_audit",
];

pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub missing_tables: Vec<String>,
}

impl DbStatus {
    pub fn schema_ok(&self) -> bool {
        self.missing_tables.is_empty()
    }
}

/// Connectivity + schema presence probe. Used by `GET /health` and by the
/// startup strict-check (a missing table there aborts the process; here it
/// is just reported).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        let (exists,): (bool,) =
            sqlx::query_as("select to_regclass(concat('public.', $1::text)) is not null")
                .bind(table)
                .fetch_one(pool)
                .await
                .with_context(|| format!("status table-exists query failed for {table}"))?;
        if !exists {
            missing.push((*table).to_string());
        }
    }

    Ok(DbStatus {
        ok: one == 1,
        missing_tables: missing,
    })
}

/// Startup-time strict-check: abort with a named-table error if any required
/// table is missing, and abort if EXEC_MODE/NEXT_PUBLIC_EXEC_MODE disagree
/// (the latter is enforced by `execd_config::Config::from_env` already; this
/// re-checks schema only).
pub async fn strict_check(pool: &PgPool) -> Result<()> {
    let st = status(pool).await?;
    if !st.ok {
        anyhow::bail!("strict check: database connectivity probe failed");
    }
    if !st.missing_tables.is_empty() {
        anyhow::bail!(
            "strict check: required tables missing: {}",
            st.missing_tables.join(", ")
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Notification sink
// ---------------------------------------------------------------------------

/// Best-effort external notification for noteworthy events. Implementations
/// must never panic or propagate errors; `append_event` calls this fire-and
/// -forget style after the event row is committed.
#[async_trait::async_trait]
pub trait NotifySink: Send + Sync {
    async fn notify(&self, command_id: &str, event_type: &str, payload: &Value);
}

pub struct NoopSink;

#[async_trait::async_trait]
impl NotifySink for NoopSink {
    async fn notify(&self, _command_id: &str, _event_type: &str, _payload: &Value) {}
}

/// Event types that are worth paging an operator about.
const NOTIFY_WORTHY: &[&str] = &[
    event_type::EXCEPTION,
    event_type::POLICY_BLOCK,
    event_type::KILL_SWITCH_ON,
    event_type::WORKER_PANIC,
];

// ---------------------------------------------------------------------------
// Command rows
// ---------------------------------------------------------------------------

fn row_to_command(row: &sqlx::postgres::PgRow) -> Result<Command> {
    let status_str: String = row.try_get("status")?;
    Ok(Command {
        id: row.try_get("id")?,
        kind: row.try_get("type")?,
        status: CommandStatus::parse(&status_str)
            .with_context(|| format!("unrecognized command status {status_str}"))?,
        attempt: row.try_get("attempt")?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        error: row.try_get("error")?,
        locked_by: row.try_get("locked_by")?,
        locked_at: row.try_get("locked_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const COMMAND_COLUMNS: &str =
    "id, type, status, attempt, payload, result, error, locked_by, locked_at, created_at, updated_at";

/// Insert a brand-new command row in PENDING status. Used directly by the
/// `fail`/`flaky`/`quote` submission endpoints, which skip idempotency.
pub async fn insert_command(pool: &PgPool, id: &str, kind: &str, payload: Value) -> Result<Command> {
    let row = sqlx::query(&format!(
        r#"
        insert into commands_domain (id, type, status, attempt, payload)
        values ($1, $2, 'PENDING', 0, $3)
        returning {COMMAND_COLUMNS}
        "#
    ))
    .bind(id)
    .bind(kind)
    .bind(payload)
    .fetch_one(pool)
    .await
    .context("insert_command failed")?;

    row_to_command(&row)
}

pub async fn get_command(pool: &PgPool, id: &str) -> Result<Option<Command>> {
    let row = sqlx::query(&format!(
        "select {COMMAND_COLUMNS} from commands_domain where id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("get_command failed")?;

    row.as_ref().map(row_to_command).transpose()
}

pub async fn list_commands(pool: &PgPool, limit: i64) -> Result<Vec<Command>> {
    let rows = sqlx::query(&format!(
        "select {COMMAND_COLUMNS} from commands_domain order by created_at desc limit $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_commands failed")?;

    rows.iter().map(row_to_command).collect()
}

/// The oldest still-`PENDING` command id, or none. Used by the worker loop's
/// kill-switch gate to name the row the operator is blocking without
/// claiming it.
pub async fn oldest_pending_id(pool: &PgPool) -> Result<Option<String>> {
    let row = sqlx::query(
        "select id from commands_domain where status = 'PENDING' order by created_at asc limit 1",
    )
    .fetch_optional(pool)
    .await
    .context("oldest_pending_id failed")?;

    Ok(row.map(|r| r.try_get::<String, _>("id")).transpose()?)
}

/// Atomically select the oldest PENDING row under a row lock that skips
/// already-locked rows, bump it to RUNNING, and return it. Safe under N
/// concurrent callers: each returns a distinct row or nothing.
pub async fn claim_one(pool: &PgPool, worker_id: &str) -> Result<Option<Command>> {
    let row = sqlx::query(&format!(
        r#"
        with to_claim as (
            select id
            from commands_domain
            where status = 'PENDING'
            order by created_at asc
            limit 1
            for update skip locked
        )
        update commands_domain
           set status = 'RUNNING',
               attempt = attempt + 1,
               locked_by = $1,
               locked_at = now(),
               updated_at = now()
         where id in (select id from to_claim)
        returning {COMMAND_COLUMNS}
        "#
    ))
    .bind(worker_id)
    .fetch_optional(pool)
    .await
    .context("claim_one failed")?;

    row.as_ref().map(row_to_command).transpose()
}

/// Transition PENDING/RUNNING -> DONE. Returns rows affected; 0 is a benign
/// lost race (another caller already wrote a terminal state) and callers
/// must not retry.
pub async fn mark_done(pool: &PgPool, id: &str, result: Value) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update commands_domain
           set status = 'DONE',
               result = $2,
               error = null,
               updated_at = now()
         where id = $1
           and status in ('PENDING', 'RUNNING')
        "#,
    )
    .bind(id)
    .bind(result)
    .execute(pool)
    .await
    .context("mark_done failed")?;

    Ok(res.rows_affected())
}

/// Transition PENDING/RUNNING -> FAILED. `reason` is the short error string
/// stored on the command row.
pub async fn mark_failed(pool: &PgPool, id: &str, reason: &str) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update commands_domain
           set status = 'FAILED',
               error = $2,
               updated_at = now()
         where id = $1
           and status in ('PENDING', 'RUNNING')
        "#,
    )
    .bind(id)
    .bind(reason)
    .execute(pool)
    .await
    .context("mark_failed failed")?;

    Ok(res.rows_affected())
}

#[derive(Debug)]
pub enum RetryOutcome {
    Retried(Command),
    NotFailed,
    NotFound,
}

/// FAILED -> PENDING. Clears error/result/lock; preserves attempt (it is
/// only ever incremented by `claim_one`).
pub async fn retry(pool: &PgPool, id: &str) -> Result<RetryOutcome> {
    let row = sqlx::query(&format!(
        r#"
        update commands_domain
           set status = 'PENDING',
               error = null,
               result = null,
               locked_by = null,
               locked_at = null,
               updated_at = now()
         where id = $1
           and status = 'FAILED'
        returning {COMMAND_COLUMNS}
        "#
    ))
    .bind(id)
    .fetch_optional(pool)
    .await
    .context("retry failed")?;

    match row {
        Some(r) => Ok(RetryOutcome::Retried(row_to_command(&r)?)),
        None => {
            if get_command(pool, id).await?.is_some() {
                Ok(RetryOutcome::NotFailed)
            } else {
                Ok(RetryOutcome::NotFound)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event log
// ---------------------------------------------------------------------------

/// Append one event. Trims the payload to the ~8KB budget, never raises to
/// the caller (failures are logged), and fires the notify sink for a small
/// set of noteworthy event types.
pub async fn append_event(
    pool: &PgPool,
    sink: &dyn NotifySink,
    command_id: &str,
    kind: &str,
    attempt: i32,
    payload: Value,
) {
    let trimmed = trim_event_payload(&payload);
    let insert = sqlx::query(
        r#"
        insert into domain_events (command_id, event_type, attempt, payload)
        values ($1, $2, $3, $4)
        "#,
    )
    .bind(command_id)
    .bind(kind)
    .bind(attempt)
    .bind(&trimmed)
    .execute(pool)
    .await;

    if let Err(e) = insert {
        tracing::warn!(command_id, event_type = kind, error = %e, "append_event failed");
    }

    if NOTIFY_WORTHY.contains(&kind) {
        sink.notify(command_id, kind, &trimmed).await;
    }
}

pub async fn list_events(pool: &PgPool, command_id: &str, limit: i64) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        r#"
        select id, command_id, event_type, attempt, payload, created_at
        from domain_events
        where command_id = $1
        order by created_at asc, id asc
        limit $2
        "#,
    )
    .bind(command_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_events failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(Event {
                id: row.try_get("id")?,
                command_id: row.try_get("command_id")?,
                event_type: row.try_get("event_type")?,
                attempt: row.try_get("attempt")?,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Whether a terminal event (MARK_DONE/MARK_FAILED) already exists for this
/// (command_id, attempt). Backs the idempotency policy: exactly one terminal
/// write per attempt.
pub async fn terminal_event_exists(pool: &PgPool, command_id: &str, attempt: i32) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as(
        r#"
        select exists (
            select 1 from domain_events
            where command_id = $1
              and attempt = $2
              and event_type = any($3)
        )
        "#,
    )
    .bind(command_id)
    .bind(attempt)
    .bind(event_type::TERMINAL)
    .fetch_one(pool)
    .await
    .context("terminal_event_exists failed")?;

    Ok(exists)
}

/// Count `PICKED` events for a command type within the last `window_secs`.
/// Backs the rate-limit policy.
pub async fn count_recent_picked_events(
    pool: &PgPool,
    command_type: &str,
    window_secs: i64,
) -> Result<i64> {
    let (n,): (i64,) = sqlx::query_as(
        r#"
        select count(*)::bigint
        from domain_events e
        join commands_domain c on c.id = e.command_id
        where e.event_type = $1
          and c.type = $2
          and e.created_at >= now() - make_interval(secs => $3)
        "#,
    )
    .bind(event_type::PICKED)
    .bind(command_type)
    .bind(window_secs as f64)
    .fetch_one(pool)
    .await
    .context("count_recent_picked_events failed")?;

    Ok(n)
}

/// Timestamp of the most recent ACTION_FAIL/MARK_FAILED event for a command
/// type, within the last hour. Backs the cooldown-after-fail policy.
pub async fn most_recent_fail_at(
    pool: &PgPool,
    command_type: &str,
) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        select e.created_at
        from domain_events e
        join commands_domain c on c.id = e.command_id
        where c.type = $1
          and e.event_type = any($2)
          and e.created_at >= now() - interval '1 hour'
        order by e.created_at desc
        limit 1
        "#,
    )
    .bind(command_type)
    .bind([event_type::ACTION_FAIL, event_type::MARK_FAILED].as_slice())
    .fetch_optional(pool)
    .await
    .context("most_recent_fail_at failed")?;

    Ok(row.map(|(ts,)| ts))
}

/// Consecutive FAILED commands today (UTC), most-recent-first, stopping at
/// the first non-FAILED terminal command. Backs the lockout consecutive-
/// losses condition. See DESIGN.md Open Question 2 for why this is the only
/// lockout input this crate derives from storage.
pub async fn count_consecutive_failures_today(pool: &PgPool) -> Result<i64> {
    let rows: Vec<(String,)> = sqlx::query_as(
        r#"
        select status
        from commands_domain
        where status in ('DONE', 'FAILED')
          and created_at >= date_trunc('day', now())
        order by updated_at desc
        "#,
    )
    .fetch_all(pool)
    .await
    .context("count_consecutive_failures_today failed")?;

    let mut n = 0i64;
    for (status,) in rows {
        if status == "FAILED" {
            n += 1;
        } else {
            break;
        }
    }
    Ok(n)
}

// ---------------------------------------------------------------------------
// Idempotency keys
// ---------------------------------------------------------------------------

/// Insert (key, proposed_command_id) on-conflict-do-nothing, then re-read.
/// If the stored value differs from `proposed_command_id`, the caller lost
/// the race and must use the returned id instead of its own.
pub async fn claim_idempotency_key(
    pool: &PgPool,
    key: &str,
    proposed_command_id: &str,
) -> Result<String> {
    sqlx::query(
        r#"
        insert into idempotency_keys (key, first_command_id)
        values ($1, $2)
        on conflict (key) do update set last_seen_at = now()
        "#,
    )
    .bind(key)
    .bind(proposed_command_id)
    .execute(pool)
    .await
    .context("claim_idempotency_key insert failed")?;

    let (effective,): (String,) =
        sqlx::query_as("select first_command_id from idempotency_keys where key = $1")
            .bind(key)
            .fetch_one(pool)
            .await
            .context("claim_idempotency_key re-read failed")?;

    Ok(effective)
}

// ---------------------------------------------------------------------------
// Ops state / history / audit
// ---------------------------------------------------------------------------

/// Write current + append to history, atomically.
pub async fn upsert_ops_state(pool: &PgPool, key: &str, value: Value) -> Result<()> {
    let mut tx = pool.begin().await.context("upsert_ops_state begin tx")?;

    sqlx::query(
        r#"
        insert into ops_state (key, value, updated_at)
        values ($1, $2, now())
        on conflict (key) do update set value = excluded.value, updated_at = now()
        "#,
    )
    .bind(key)
    .bind(&value)
    .execute(&mut *tx)
    .await
    .context("upsert_ops_state upsert failed")?;

    sqlx::query("insert into ops_state_history (key, value) values ($1, $2)")
        .bind(key)
        .bind(&value)
        .execute(&mut *tx)
        .await
        .context("upsert_ops_state history insert failed")?;

    tx.commit().await.context("upsert_ops_state commit")?;
    Ok(())
}

pub async fn load_ops_state(pool: &PgPool, key: &str) -> Result<Option<Value>> {
    let row: Option<(Value,)> =
        sqlx::query_as("select value from ops_state where key = $1")
            .bind(key)
            .fetch_optional(pool)
            .await
            .context("load_ops_state failed")?;
    Ok(row.map(|(v,)| v))
}

#[derive(Debug, Clone)]
pub struct OpsStateHistoryRow {
    pub key: String,
    pub value: Value,
    pub created_at: DateTime<Utc>,
}

pub async fn list_ops_state_history(
    pool: &PgPool,
    since: Option<DateTime<Utc>>,
    limit: i64,
) -> Result<Vec<OpsStateHistoryRow>> {
    let rows = sqlx::query(
        r#"
        select key, value, created_at
        from ops_state_history
        where $1::timestamptz is null or created_at >= $1
        order by created_at desc
        limit $2
        "#,
    )
    .bind(since)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_ops_state_history failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(OpsStateHistoryRow {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Record an operator-initiated action (kill-switch set, panic trigger/
/// reset). `actor` is the caller identity if known (e.g. from OPS_TOKEN
/// presentation); unauthenticated deployments pass `None`.
pub async fn insert_ops_audit(
    pool: &PgPool,
    actor: Option<&str>,
    action: &str,
    detail: Value,
) -> Result<()> {
    sqlx::query("insert into ops_audit (actor, action, detail) values ($1, $2, $3)")
        .bind(actor)
        .bind(action)
        .bind(detail)
        .execute(pool)
        .await
        .context("insert_ops_audit failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Risk ledger / net exposure
// ---------------------------------------------------------------------------

/// Sum of `payload.notional` for tradeable-type commands in {DONE, PENDING}.
/// Used as the non-atomic net-exposure estimate (`RISK_EXPOSURE_ATOMIC=0`).
pub async fn current_net_exposure(pool: &PgPool, tradeable_types: &[&str]) -> Result<f64> {
    let (total,): (Option<f64>,) = sqlx::query_as(
        r#"
        select sum(coalesce((payload->>'notional')::double precision, 0))
        from commands_domain
        where status in ('DONE', 'PENDING')
          and type = any($1)
        "#,
    )
    .bind(tradeable_types)
    .fetch_one(pool)
    .await
    .context("current_net_exposure failed")?;

    Ok(total.unwrap_or(0.0))
}

#[derive(Debug)]
pub enum ReserveOutcome {
    Reserved { new_total: f64 },
    Exceeded { current: f64 },
}

/// Lock the single risk-ledger row, check `current + notional <= max_total`,
/// and increment in the same transaction. Caller must not have started an
/// outer transaction; this owns its own.
pub async fn reserve_exposure(pool: &PgPool, notional: f64, max_total: f64) -> Result<ReserveOutcome> {
    let mut tx = pool.begin().await.context("reserve_exposure begin tx")?;

    let (current,): (f64,) =
        sqlx::query_as("select current_exposure_usd from risk_state where id = 1 for update")
            .fetch_one(&mut *tx)
            .await
            .context(codes::NET_EXPOSURE_EXCEEDED)?;

    let total = current + notional;
    if total > max_total {
        // No mutation; the transaction is dropped (implicit rollback).
        return Ok(ReserveOutcome::Exceeded { current });
    }

    sqlx::query(
        "update risk_state set current_exposure_usd = current_exposure_usd + $1, updated_at = now() where id = 1",
    )
    .bind(notional)
    .execute(&mut *tx)
    .await
    .context("reserve_exposure update failed")?;

    tx.commit().await.context("reserve_exposure commit")?;
    Ok(ReserveOutcome::Reserved { new_total: total })
}

#[derive(Debug, serde::Serialize)]
pub struct RiskStateRow {
    pub current_exposure_usd: f64,
    pub updated_at: DateTime<Utc>,
}

pub async fn risk_state(pool: &PgPool) -> Result<RiskStateRow> {
    let row = sqlx::query("select current_exposure_usd, updated_at from risk_state where id = 1")
        .fetch_one(pool)
        .await
        .context("risk_state failed")?;
    Ok(RiskStateRow {
        current_exposure_usd: row.try_get("current_exposure_usd")?,
        updated_at: row.try_get("updated_at")?,
    })
}

// ---------------------------------------------------------------------------
// Ops summary / dev helpers
// ---------------------------------------------------------------------------

/// Count of events of each requested type with `created_at >= since`.
/// Missing types are simply absent from the map (zero), not an error.
pub async fn event_type_counts_since(
    pool: &PgPool,
    since: DateTime<Utc>,
    types: &[&str],
) -> Result<std::collections::HashMap<String, i64>> {
    let rows = sqlx::query(
        "select event_type, count(*) as n from domain_events \
         where created_at >= $1 and event_type = any($2) group by event_type",
    )
    .bind(since)
    .bind(types)
    .fetch_all(pool)
    .await
    .context("event_type_counts_since failed")?;

    let mut out = std::collections::HashMap::new();
    for row in rows {
        let kind: String = row.try_get("event_type")?;
        let n: i64 = row.try_get("n")?;
        out.insert(kind, n);
    }
    Ok(out)
}

/// Most recent events across every command, newest first. Backs
/// `GET /ops/summary`'s "recent events" field.
pub async fn recent_events(pool: &PgPool, limit: i64) -> Result<Vec<Event>> {
    let rows = sqlx::query(
        "select id, command_id, event_type, attempt, payload, created_at \
         from domain_events order by created_at desc limit $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("recent_events failed")?;

    rows.into_iter()
        .map(|row| {
            Ok(Event {
                id: row.try_get("id")?,
                command_id: row.try_get("command_id")?,
                event_type: row.try_get("event_type")?,
                attempt: row.try_get("attempt")?,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

/// Dev-only recovery helper: there is no auto-reaper for abandoned `RUNNING`
/// rows (see DESIGN.md Open Question 1), so a crashed worker's claim is
/// otherwise stuck until an operator intervenes. Resets every `RUNNING` row
/// back to `PENDING`, clearing its lock, and returns the count affected.
pub async fn reset_stuck_running(pool: &PgPool) -> Result<u64> {
    let result = sqlx::query(
        "update commands_domain set status = 'PENDING', locked_by = null, locked_at = null, \
         updated_at = now() where status = 'RUNNING'",
    )
    .execute(pool)
    .await
    .context("reset_stuck_running failed")?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_tables_list_matches_schema() {
        assert_eq!(REQUIRED_TABLES.len(), 7);
        assert!(REQUIRED_TABLES.contains(&"commands_domain"));
        assert!(REQUIRED_TABLES.contains(&"ops_audit"));
    }
}
