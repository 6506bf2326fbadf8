//! JSON request/response shapes for the HTTP surface.

use execd_schemas::Command;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: String,
    pub attempt: i32,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Command> for CommandResponse {
    fn from(c: &Command) -> Self {
        // get merges `_binance_testnet` metadata from result into payload
        // when present. This workspace never populates that key (the live
        // executor is out of scope) but the merge point is kept so a
        // handler that does populate it surfaces correctly without an API
        // change.
        let mut payload = c.payload.clone();
        if let Some(meta) = c.result.as_ref().and_then(|r| r.get("_binance_testnet")) {
            if let Some(obj) = payload.as_object_mut() {
                obj.insert("_binance_testnet".to_string(), meta.clone());
            }
        }

        CommandResponse {
            id: c.id.clone(),
            kind: c.kind.clone(),
            status: c.status.as_str().to_string(),
            attempt: c.attempt,
            payload,
            result: c.result.clone(),
            error: c.error.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct QuoteRequest {
    pub symbol: Option<String>,
    pub side: Option<String>,
    pub notional: Option<f64>,
    pub price: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct KillSwitchBody {
    pub enabled: bool,
}

#[derive(Debug, Serialize)]
pub struct KillSwitchResponse {
    pub enabled: bool,
    pub source: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub minutes: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SummaryResponse {
    pub window_minutes: i64,
    pub counts: std::collections::HashMap<String, i64>,
    pub recent_events: Vec<execd_schemas::Event>,
}
