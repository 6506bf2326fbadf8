//! Ordered pre-execution guardrails. The chain short-circuits on the first
//! block; a policy that returns `Err` is treated as `allowed = true` for
//! that policy (fail-open — a broken guardrail must not stall the queue).

use anyhow::Result;
use execd_config::Config;
use execd_schemas::{codes, normalize_type, Command};
use serde_json::Value;
use sqlx::PgPool;

pub struct PolicyContext<'a> {
    pub pool: &'a PgPool,
    pub config: &'a Config,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<Value>,
}

impl Decision {
    pub fn allow() -> Self {
        Decision {
            allowed: true,
            code: None,
            message: None,
            detail: None,
        }
    }

    pub fn block(code: &str, message: impl Into<String>) -> Self {
        Decision {
            allowed: false,
            code: Some(code.to_string()),
            message: Some(message.into()),
            detail: None,
        }
    }
}

#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn check(&self, ctx: &PolicyContext<'_>, command: &Command) -> Result<Decision>;
}

pub struct ChainResult {
    /// Names of policies that ran and allowed, in order, up to (and
    /// excluding) any block.
    pub applied: Vec<&'static str>,
    pub blocked: Option<Decision>,
}

/// Run every policy in order; stop at the first `allowed = false`.
pub async fn run_chain(
    policies: &[Box<dyn Policy>],
    ctx: &PolicyContext<'_>,
    command: &Command,
) -> ChainResult {
    let mut applied = Vec::with_capacity(policies.len());
    for policy in policies {
        let decision = match policy.check(ctx, command).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(policy = policy.name(), error = %e, "policy check failed, fail-open");
                Decision::allow()
            }
        };
        if !decision.allowed {
            return ChainResult {
                applied,
                blocked: Some(decision),
            };
        }
        applied.push(policy.name());
    }
    ChainResult {
        applied,
        blocked: None,
    }
}

pub fn default_chain() -> Vec<Box<dyn Policy>> {
    vec![
        Box::new(IdempotencyPolicy),
        Box::new(RateLimitPolicy),
        Box::new(CooldownAfterFailPolicy),
        Box::new(QuoteNotionalCapPolicy),
    ]
}

/// Blocks if a terminal event already exists for (command_id, attempt).
/// Enforces exactly-one terminal write per attempt.
pub struct IdempotencyPolicy;

#[async_trait::async_trait]
impl Policy for IdempotencyPolicy {
    fn name(&self) -> &'static str {
        "idempotency"
    }

    async fn check(&self, ctx: &PolicyContext<'_>, command: &Command) -> Result<Decision> {
        let exists =
            execd_db::terminal_event_exists(ctx.pool, &command.id, command.attempt).await?;
        if exists {
            Ok(Decision::block(
                codes::IDEMPOTENT_BLOCK,
                "terminal event already recorded for this attempt",
            ))
        } else {
            Ok(Decision::allow())
        }
    }
}

/// Per-type rate limit over a trailing 60s window of `PICKED` events.
pub struct RateLimitPolicy;

#[async_trait::async_trait]
impl Policy for RateLimitPolicy {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn check(&self, ctx: &PolicyContext<'_>, command: &Command) -> Result<Decision> {
        let limit = ctx.config.rate_limit_per_minute(&command.kind);
        if limit <= 0 {
            return Ok(Decision::allow());
        }
        let kind = normalize_type(&command.kind);
        let count = execd_db::count_recent_picked_events(ctx.pool, &kind, 60).await?;
        if count >= limit {
            Ok(Decision::block(
                codes::RATE_LIMIT,
                format!("{count} picks in the last 60s exceeds limit {limit}"),
            ))
        } else {
            Ok(Decision::allow())
        }
    }
}

/// Blocks a type that recently failed within its configured cooldown window.
pub struct CooldownAfterFailPolicy;

#[async_trait::async_trait]
impl Policy for CooldownAfterFailPolicy {
    fn name(&self) -> &'static str {
        "cooldown_after_fail"
    }

    async fn check(&self, ctx: &PolicyContext<'_>, command: &Command) -> Result<Decision> {
        let cooldown = ctx.config.policy_fail_cooldown_seconds;
        if cooldown <= 0 {
            return Ok(Decision::allow());
        }
        let kind = normalize_type(&command.kind);
        let Some(last_fail) = execd_db::most_recent_fail_at(ctx.pool, &kind).await? else {
            return Ok(Decision::allow());
        };
        let elapsed = (chrono::Utc::now() - last_fail).num_seconds();
        if elapsed < cooldown {
            Ok(Decision::block(
                codes::COOLDOWN_AFTER_FAIL,
                format!("last failure {elapsed}s ago, cooldown is {cooldown}s"),
            ))
        } else {
            Ok(Decision::allow())
        }
    }
}

/// Caps QUOTE notional; no-op for every other type.
pub struct QuoteNotionalCapPolicy;

#[async_trait::async_trait]
impl Policy for QuoteNotionalCapPolicy {
    fn name(&self) -> &'static str {
        "quote_notional_cap"
    }

    async fn check(&self, ctx: &PolicyContext<'_>, command: &Command) -> Result<Decision> {
        if normalize_type(&command.kind) != "QUOTE" {
            return Ok(Decision::allow());
        }
        let cap = ctx.config.policy_quote_max_notional;
        if cap <= 0.0 {
            return Ok(Decision::allow());
        }
        // Missing notional defaults to 0 here, not the handler's 100.0 — a
        // QUOTE with no notional never blocks regardless of the cap.
        let notional = command
            .payload
            .get("notional")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        if notional > cap {
            Ok(Decision::block(
                codes::QUOTE_NOTIONAL_TOO_LARGE,
                format!("notional {notional} exceeds cap {cap}"),
            ))
        } else {
            Ok(Decision::allow())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_allow_has_no_code() {
        let d = Decision::allow();
        assert!(d.allowed);
        assert!(d.code.is_none());
    }

    #[test]
    fn decision_block_carries_code_and_message() {
        let d = Decision::block(codes::RATE_LIMIT, "too many");
        assert!(!d.allowed);
        assert_eq!(d.code.as_deref(), Some(codes::RATE_LIMIT));
        assert_eq!(d.message.as_deref(), Some("too many"));
    }
}
