use execd_db::{claim_idempotency_key, insert_command, NoopSink};
use serde_json::json;
use uuid::Uuid;

#[tokio::test]
async fn concurrent_submits_with_same_key_converge_on_one_command() -> anyhow::Result<()> {
    let Ok(url) = std::env::var(execd_db::ENV_DB_URL) else {
        eprintln!("SKIP: {} not set", execd_db::ENV_DB_URL);
        return Ok(());
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    execd_db::migrate(&pool).await?;

    let key = format!("idem-test-{}", Uuid::new_v4());
    let proposed_a = format!("noop-{}", Uuid::new_v4());
    let proposed_b = format!("noop-{}", Uuid::new_v4());

    let effective_a = claim_idempotency_key(&pool, &key, &proposed_a).await?;
    let effective_b = claim_idempotency_key(&pool, &key, &proposed_b).await?;

    assert_eq!(effective_a, effective_b);
    assert_eq!(effective_a, proposed_a);

    insert_command(&pool, &effective_a, "NOOP", json!({})).await?;
    let cmd = execd_db::get_command(&pool, &effective_a).await?.unwrap();
    assert_eq!(cmd.id, effective_a);

    let _ = NoopSink;
    Ok(())
}

#[tokio::test]
async fn claim_one_returns_oldest_pending_and_is_exclusive() -> anyhow::Result<()> {
    let Ok(url) = std::env::var(execd_db::ENV_DB_URL) else {
        eprintln!("SKIP: {} not set", execd_db::ENV_DB_URL);
        return Ok(());
    };
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;
    execd_db::migrate(&pool).await?;

    let id = format!("noop-{}", Uuid::new_v4());
    insert_command(&pool, &id, "NOOP", json!({})).await?;

    let claimed = execd_db::claim_one(&pool, "worker-1").await?.unwrap();
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempt, 1);
    assert_eq!(claimed.locked_by.as_deref(), Some("worker-1"));

    let second_claim = execd_db::get_command(&pool, &id).await?.unwrap();
    assert_eq!(second_claim.status, execd_schemas::CommandStatus::Running);
    Ok(())
}
