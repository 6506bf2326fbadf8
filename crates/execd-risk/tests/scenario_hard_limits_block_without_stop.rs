use chrono::Utc;
use execd_config::Config;
use execd_risk::{hard_limits_check, RiskInputs};
use execd_schemas::{codes, Command, CommandStatus};
use serde_json::json;

fn quote_command(payload: serde_json::Value) -> Command {
    Command {
        id: "quote-hard-limits-test".into(),
        kind: "QUOTE".into(),
        status: CommandStatus::Running,
        attempt: 1,
        payload,
        result: None,
        error: None,
        locked_by: None,
        locked_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[tokio::test]
async fn missing_stop_blocks_before_any_other_rule() -> anyhow::Result<()> {
    let Ok(_) = std::env::var(execd_db::ENV_DB_URL) else {
        eprintln!("SKIP: {} not set", execd_db::ENV_DB_URL);
        return Ok(());
    };

    let pool = execd_testkit::db_pool_from_env().await?;
    let cfg = Config::from_env()?;
    let inputs = RiskInputs::default();

    let cmd = quote_command(json!({"symbol": "BTCUSDT", "notional": 100}));
    let decision = hard_limits_check(&pool, &cfg, &inputs, &cmd).await?;

    assert!(!decision.allowed);
    assert!(decision
        .code
        .unwrap()
        .starts_with(&format!("RISK_HARD_LIMITS_{}", codes::STOP_REQUIRED)));
    Ok(())
}

#[tokio::test]
async fn stop_present_and_within_limits_allows() -> anyhow::Result<()> {
    let Ok(_) = std::env::var(execd_db::ENV_DB_URL) else {
        eprintln!("SKIP: {} not set", execd_db::ENV_DB_URL);
        return Ok(());
    };

    let pool = execd_testkit::db_pool_from_env().await?;
    let cfg = Config::from_env()?;
    let inputs = RiskInputs::default();

    let cmd = quote_command(json!({
        "symbol": "BTCUSDT",
        "notional": 1.0,
        "stop_loss": 10.0,
    }));
    let decision = hard_limits_check(&pool, &cfg, &inputs, &cmd).await?;
    assert!(decision.allowed);
    Ok(())
}
