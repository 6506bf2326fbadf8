//! Axum router and HTTP handlers. `build_router` is the single entry point;
//! `main.rs` attaches middleware after calling it.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::api_types::{
    CommandResponse, ErrorResponse, EventsQuery, HealthResponse, HistoryQuery, KillSwitchBody,
    KillSwitchResponse, ListQuery, QuoteRequest, SummaryQuery, SummaryResponse,
};
use crate::state::AppState;

const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";
const OPS_TOKEN_HEADER: &str = "x-ops-token";

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/domain-commands", get(list_commands))
        .route("/domain-commands/:kind", post(create_command))
        .route("/domain-commands/:id", get(get_command))
        .route("/domain-commands/:id/retry", post(retry_command))
        .route("/domain-commands/:id/events", get(get_events))
        .route("/ops/kill-switch", get(kill_switch_get).post(kill_switch_set))
        .route("/ops/panic_guard/trigger", post(panic_trigger))
        .route("/ops/panic_guard/reset", post(panic_reset))
        .route("/ops/state", get(ops_state))
        .route("/ops/state/history", get(ops_state_history))
        .route("/ops/state/history/export", get(ops_state_history_export))
        .route(
            "/ops/state/history/export.csv",
            get(ops_state_history_export_csv),
        )
        .route("/ops/summary", get(ops_summary))
        .route("/risk/state", get(risk_state))
        .route("/risk/lockout/clear", post(lockout_clear))
        .route(
            "/ops/dev/reset-pending-domain-commands",
            post(dev_reset_pending),
        )
        .with_state(state)
}

fn err(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorResponse { error: message.into() })).into_response()
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

// ---------------------------------------------------------------------------
// Domain commands
// ---------------------------------------------------------------------------

async fn create_command(
    State(st): State<Arc<AppState>>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Option<Json<QuoteRequest>>,
) -> Response {
    let kind_upper = execd_schemas::normalize_type(&kind);
    if st.registry.lookup(&kind_upper).is_none() {
        return err(StatusCode::NOT_FOUND, format!("unknown create endpoint {kind}"));
    }

    let payload = match kind_upper.as_str() {
        "QUOTE" => {
            let q = body.map(|Json(b)| b).unwrap_or_default();
            json!({
                "symbol": q.symbol.unwrap_or_else(|| "BTCUSDT".to_string()),
                "side": q.side.unwrap_or_else(|| "BUY".to_string()),
                "notional": q.notional.unwrap_or(100.0),
                "price": q.price,
            })
        }
        _ => json!({}),
    };

    // Only `noop` honors the idempotency key (spec.md §4.10).
    if kind_upper == "NOOP" {
        if let Some(key) = headers
            .get(IDEMPOTENCY_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let proposed_id = Uuid::new_v4().to_string();
            let resolved_id = match execd_db::claim_idempotency_key(&st.pool, key, &proposed_id).await
            {
                Ok(id) => id,
                Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            };

            let command = if resolved_id == proposed_id {
                execd_db::insert_command(&st.pool, &resolved_id, "NOOP", payload).await
            } else {
                execd_db::get_command(&st.pool, &resolved_id)
                    .await
                    .map(|c| c.expect("idempotency key resolved to a missing command"))
            };

            return match command {
                Ok(c) => (StatusCode::OK, Json(CommandResponse::from(&c))).into_response(),
                Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            };
        }
    }

    let id = Uuid::new_v4().to_string();
    match execd_db::insert_command(&st.pool, &id, &kind_upper, payload).await {
        Ok(c) => (StatusCode::OK, Json(CommandResponse::from(&c))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn get_command(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match execd_db::get_command(&st.pool, &id).await {
        Ok(Some(c)) => (StatusCode::OK, Json(CommandResponse::from(&c))).into_response(),
        Ok(None) => err(StatusCode::NOT_FOUND, "command not found"),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn list_commands(State(st): State<Arc<AppState>>, Query(q): Query<ListQuery>) -> Response {
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    match execd_db::list_commands(&st.pool, limit).await {
        Ok(rows) => {
            let out: Vec<CommandResponse> = rows.iter().map(CommandResponse::from).collect();
            (StatusCode::OK, Json(out)).into_response()
        }
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn retry_command(State(st): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match execd_db::retry(&st.pool, &id).await {
        Ok(execd_db::RetryOutcome::Retried(c)) => {
            execd_db::append_event(
                &st.pool,
                st.sink.as_ref(),
                &id,
                execd_schemas::event_type::RETRY,
                c.attempt,
                json!({ "attempt": c.attempt }),
            )
            .await;
            (StatusCode::OK, Json(CommandResponse::from(&c))).into_response()
        }
        Ok(execd_db::RetryOutcome::NotFailed) => {
            err(StatusCode::BAD_REQUEST, "command is not FAILED")
        }
        Ok(execd_db::RetryOutcome::NotFound) => err(StatusCode::NOT_FOUND, "command not found"),
        Err(e) => err(StatusCode::CONFLICT, e.to_string()),
    }
}

async fn get_events(
    State(st): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<EventsQuery>,
) -> Response {
    let limit = q.limit.unwrap_or(200).clamp(1, 500);
    match execd_db::list_events(&st.pool, &id, limit).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Ops control plane
// ---------------------------------------------------------------------------

fn ops_token_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(OPS_TOKEN_HEADER).and_then(|v| v.to_str().ok())
}

fn authorize(st: &AppState, headers: &HeaderMap) -> Option<Response> {
    if st.authorize_ops(ops_token_header(headers)) {
        None
    } else {
        Some(err(StatusCode::UNAUTHORIZED, "invalid or missing OPS_TOKEN"))
    }
}

async fn kill_switch_get(State(st): State<Arc<AppState>>) -> Response {
    match st.kill_switch.read(&st.config).await {
        Ok(state) => (
            StatusCode::OK,
            Json(KillSwitchResponse {
                enabled: state.enabled,
                source: match state.source {
                    execd_ops::KillSwitchSource::Env => "env",
                    execd_ops::KillSwitchSource::Redis => "redis",
                    execd_ops::KillSwitchSource::None => "none",
                },
            }),
        )
            .into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn kill_switch_set(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<KillSwitchBody>,
) -> Response {
    if let Some(resp) = authorize(&st, &headers) {
        return resp;
    }
    let actor = ops_token_header(&headers);
    match st
        .kill_switch
        .set(&st.pool, st.sink.as_ref(), body.enabled, actor)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({ "enabled": body.enabled }))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn panic_trigger(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(resp) = authorize(&st, &headers) {
        return resp;
    }
    let actor = ops_token_header(&headers);
    match execd_ops::panic_trigger(&st.pool, &st.kill_switch, st.sink.as_ref(), &st.config, actor)
        .await
    {
        Ok(execd_ops::PanicTriggerOutcome::Triggered) => {
            (StatusCode::OK, Json(json!({ "triggered": true }))).into_response()
        }
        Ok(execd_ops::PanicTriggerOutcome::Forbidden) => {
            err(StatusCode::FORBIDDEN, "panic trigger is forbidden in production")
        }
        Ok(execd_ops::PanicTriggerOutcome::Cooldown { remaining_secs }) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "panic guard cooldown", "remaining_secs": remaining_secs })),
        )
            .into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn panic_reset(State(st): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(resp) = authorize(&st, &headers) {
        return resp;
    }
    let actor = ops_token_header(&headers);
    match execd_ops::panic_reset(&st.pool, &st.kill_switch, st.sink.as_ref(), actor).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "reset": true }))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn forbidden_in_prod(st: &AppState) -> Option<Response> {
    if st.config.exec_mode.is_prod() {
        Some(err(StatusCode::FORBIDDEN, "forbidden in production"))
    } else {
        None
    }
}

async fn ops_state(State(st): State<Arc<AppState>>) -> Response {
    if let Some(resp) = forbidden_in_prod(&st) {
        return resp;
    }
    match execd_ops::state_snapshot(&st.pool, &st.kill_switch, &st.config).await {
        Ok(snap) => (StatusCode::OK, Json(snap)).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn ops_state_history(
    State(st): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    if let Some(resp) = forbidden_in_prod(&st) {
        return resp;
    }
    let limit = q.limit.unwrap_or(200).clamp(1, 1000);
    match execd_ops::history_export(&st.pool, q.since, limit).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn ops_state_history_export(
    State(st): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    ops_state_history(State(st), Query(q)).await
}

async fn ops_state_history_export_csv(
    State(st): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Response {
    if let Some(resp) = forbidden_in_prod(&st) {
        return resp;
    }
    let limit = q.limit.unwrap_or(200).clamp(1, 1000);
    let rows = match execd_ops::history_export(&st.pool, q.since, limit).await {
        Ok(rows) => rows,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    match execd_ops::history_export_csv(&rows) {
        Ok(csv) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/csv")],
            csv,
        )
            .into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn ops_summary(State(st): State<Arc<AppState>>, Query(q): Query<SummaryQuery>) -> Response {
    let minutes = q.minutes.unwrap_or(60).clamp(1, 24 * 60);
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let since = Utc::now() - chrono::Duration::minutes(minutes);

    let types = [
        "FAILED",
        execd_schemas::event_type::POLICY_BLOCK,
        execd_schemas::event_type::EXCEPTION,
        execd_schemas::event_type::KILL_SWITCH_ON,
    ];

    let counts = match execd_db::event_type_counts_since(&st.pool, since, &types).await {
        Ok(c) => c,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    let recent_events = match execd_db::recent_events(&st.pool, limit).await {
        Ok(e) => e,
        Err(e) => return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    (
        StatusCode::OK,
        Json(SummaryResponse {
            window_minutes: minutes,
            counts,
            recent_events,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// Risk
// ---------------------------------------------------------------------------

async fn risk_state(State(st): State<Arc<AppState>>) -> Response {
    match execd_db::risk_state(&st.pool).await {
        Ok(row) => (StatusCode::OK, Json(row)).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

async fn lockout_clear(State(st): State<Arc<AppState>>) -> Response {
    match st
        .kill_switch
        .clear_lockout(st.config.lockout_clear_ttl_sec)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "cleared": true, "ttl_secs": st.config.lockout_clear_ttl_sec })),
        )
            .into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Dev helper
// ---------------------------------------------------------------------------

async fn dev_reset_pending(State(st): State<Arc<AppState>>) -> Response {
    if let Some(resp) = forbidden_in_prod(&st) {
        return resp;
    }
    match execd_db::reset_stuck_running(&st.pool).await {
        Ok(n) => (StatusCode::OK, Json(json!({ "reset": n }))).into_response(),
        Err(e) => err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

