//! In-process scenario tests for execd-api's HTTP surface. Each test spins
//! up `routes::build_router` against a real, migrated pool (no TCP socket)
//! and drives it via `tower::ServiceExt::oneshot`. Skips if `DATABASE_URL`
//! is unset, matching the rest of the workspace's integration tests.

use std::sync::Arc;

use axum::http::{Request, StatusCode};
use execd_api::{routes, state::AppState};
use http_body_util::BodyExt;

async fn make_state(ops_token: Option<&str>) -> Option<Arc<AppState>> {
    let Ok(_url) = std::env::var(execd_db::ENV_DB_URL) else {
        eprintln!("SKIP: {} not set", execd_db::ENV_DB_URL);
        return None;
    };
    if let Some(token) = ops_token {
        std::env::set_var("OPS_TOKEN", token);
    } else {
        std::env::remove_var("OPS_TOKEN");
    }
    let config = execd_config::Config::from_env().expect("config from env");
    let pool = execd_testkit::db_pool_from_env()
        .await
        .expect("db pool from env");
    Some(AppState::new(pool, config).expect("app state"))
}

async fn call(
    router: axum::Router,
    req: Request<axum::body::Body>,
) -> (StatusCode, serde_json::Value) {
    let resp = router.oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post(uri: &str) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap()
}

fn post_json(uri: &str, body: serde_json::Value) -> Request<axum::body::Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_returns_200_ok_true() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, json) = call(routes::build_router(st), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
}

#[tokio::test]
async fn unknown_create_kind_returns_404() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, _) = call(routes::build_router(st), post("/domain-commands/bogus")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn noop_create_then_get_then_events_roundtrip() {
    let Some(st) = make_state(None).await else {
        return;
    };

    let (status, created) = call(routes::build_router(Arc::clone(&st)), post("/domain-commands/noop")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["status"], "PENDING");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = call(
        routes::build_router(Arc::clone(&st)),
        get(&format!("/domain-commands/{id}")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], id);

    let (status, events) = call(
        routes::build_router(Arc::clone(&st)),
        get(&format!("/domain-commands/{id}/events")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(events.is_array());
}

#[tokio::test]
async fn noop_idempotency_key_dedupes_to_one_command() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let key = format!("test-key-{}", uuid::Uuid::new_v4());

    let mut req1 = post("/domain-commands/noop");
    req1.headers_mut()
        .insert("x-idempotency-key", key.parse().unwrap());
    let (_, first) = call(routes::build_router(Arc::clone(&st)), req1).await;

    let mut req2 = post("/domain-commands/noop");
    req2.headers_mut()
        .insert("x-idempotency-key", key.parse().unwrap());
    let (_, second) = call(routes::build_router(Arc::clone(&st)), req2).await;

    assert_eq!(first["id"], second["id"]);
}

#[tokio::test]
async fn get_missing_command_returns_404() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, _) = call(
        routes::build_router(st),
        get(&format!("/domain-commands/{}", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_missing_command_returns_404() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, _) = call(
        routes::build_router(st),
        post(&format!("/domain-commands/{}/retry", uuid::Uuid::new_v4())),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn retry_pending_command_returns_400() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (_, created) = call(routes::build_router(Arc::clone(&st)), post("/domain-commands/fail")).await;
    let id = created["id"].as_str().unwrap().to_string();

    let (status, _) = call(
        routes::build_router(Arc::clone(&st)),
        post(&format!("/domain-commands/{id}/retry")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST, "PENDING is not FAILED yet");
}

#[tokio::test]
async fn list_commands_honors_limit_clamp() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, list) = call(
        routes::build_router(st),
        get("/domain-commands?limit=999999"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(list.as_array().unwrap().len() <= 200);
}

#[tokio::test]
async fn quote_create_derives_payload_from_body() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let req = post_json(
        "/domain-commands/quote",
        serde_json::json!({ "symbol": "ETHUSDT", "side": "SELL", "notional": 250.0 }),
    );
    let (status, created) = call(routes::build_router(st), req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["payload"]["symbol"], "ETHUSDT");
    assert_eq!(created["payload"]["side"], "SELL");
}

#[tokio::test]
async fn kill_switch_requires_ops_token_when_configured() {
    let Some(st) = make_state(Some("secret-token")).await else {
        return;
    };

    let mut req = post_json("/ops/kill-switch", serde_json::json!({ "enabled": true }));
    let (status, _) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    req = post_json("/ops/kill-switch", serde_json::json!({ "enabled": true }));
    req.headers_mut()
        .insert("x-ops-token", "secret-token".parse().unwrap());
    let (status, _) = call(routes::build_router(Arc::clone(&st)), req).await;
    assert_eq!(status, StatusCode::OK);

    // Restore a clean env for subsequent tests in this process.
    let _ = st
        .kill_switch
        .set(&st.pool, st.sink.as_ref(), false, Some("test-cleanup"))
        .await;
}

#[tokio::test]
async fn kill_switch_get_no_token_required_when_unconfigured() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, json) = call(routes::build_router(st), get("/ops/kill-switch")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["enabled"].is_boolean());
}

#[tokio::test]
async fn ops_summary_returns_window_and_counts() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, json) = call(
        routes::build_router(st),
        get("/ops/summary?minutes=60&limit=10"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["window_minutes"], 60);
    assert!(json["counts"].is_object());
    assert!(json["recent_events"].is_array());
}

#[tokio::test]
async fn risk_state_returns_exposure_and_timestamp() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, json) = call(routes::build_router(st), get("/risk/state")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["current_exposure_usd"].is_number());
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let Some(st) = make_state(None).await else {
        return;
    };
    let (status, _) = call(routes::build_router(st), get("/does-not-exist")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
