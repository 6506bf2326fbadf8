//! Shared test helpers: a migrated pool from `DATABASE_URL`, and a no-op
//! notify sink. Integration tests in every other crate depend on this one
//! as a dev-dependency.

use anyhow::Result;
use execd_db::NotifySink;
use serde_json::Value;
use sqlx::PgPool;

/// Connect using `DATABASE_URL` and ensure migrations are applied. Tests
/// should call this after checking `std::env::var(execd_db::ENV_DB_URL)`
/// themselves and skipping with a `SKIP:` message if it's unset, matching
/// the rest of the suite's style.
pub async fn db_pool_from_env() -> Result<PgPool> {
    let pool = execd_db::connect_from_env().await?;
    execd_db::migrate(&pool).await?;
    Ok(pool)
}

pub struct RecordingSink {
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        RecordingSink {
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl NotifySink for RecordingSink {
    async fn notify(&self, command_id: &str, event_type: &str, _payload: &Value) {
        self.calls
            .lock()
            .unwrap()
            .push((command_id.to_string(), event_type.to_string()));
    }
}
