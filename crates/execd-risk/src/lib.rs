//! Risk lockout and pre-execution hard limits. Both are runtime gates,
//! independent of the policy chain (§4.4), evaluated before it in the
//! runner's sequence.

use anyhow::Result;
use execd_config::Config;
use execd_schemas::{codes, is_tradeable, lockout_allows, Command, TRADEABLE_TYPES};
use serde_json::Value;
use sqlx::PgPool;

#[derive(Debug, Clone, Default)]
pub struct RiskDecision {
    pub allowed: bool,
    pub code: Option<String>,
    pub message: Option<String>,
}

impl RiskDecision {
    pub fn allow() -> Self {
        RiskDecision {
            allowed: true,
            ..Default::default()
        }
    }

    pub fn block(code: impl Into<String>, message: impl Into<String>) -> Self {
        RiskDecision {
            allowed: false,
            code: Some(code.into()),
            message: Some(message.into()),
        }
    }
}

/// Metrics the core does not compute itself (see DESIGN.md Open Question 2)
/// and that the runner must inject from whatever ledger a deployment wires
/// in. `today_loss_pct` is `0.0` in this workspace's default wiring — an
/// honest placeholder, not a computed value.
#[derive(Debug, Clone, Copy, Default)]
pub struct RiskInputs {
    pub today_loss_pct: f64,
    pub consecutive_losses: i64,
    /// True while an operator-issued `POST /risk/lockout/clear` override is
    /// live (tracked as a Redis key with TTL by `execd-ops`, consulted by
    /// the runner before calling `lockout_check`). The evaluator itself
    /// stays Redis-free, matching the pure-function split the teacher's
    /// risk engine uses.
    pub lockout_override_clear: bool,
}

/// Active iff daily realized loss or consecutive failures today crossed
/// their configured threshold. When active, blocks any command whose type
/// is not in the lockout allowlist (`NOOP`).
pub fn lockout_check(cfg: &Config, inputs: &RiskInputs, command: &Command) -> RiskDecision {
    if cfg.risk_lockout_disable {
        return RiskDecision::allow();
    }

    let active = inputs.today_loss_pct >= cfg.risk_lockout_loss_pct
        || inputs.consecutive_losses >= cfg.risk_lockout_consec_losses;

    if !active || inputs.lockout_override_clear || lockout_allows(&command.kind) {
        return RiskDecision::allow();
    }

    RiskDecision::block(
        codes::RISK_LOCKOUT_ACTIVE,
        format!(
            "lockout active (loss_pct={:.2} consec_losses={})",
            inputs.today_loss_pct, inputs.consecutive_losses
        ),
    )
}

fn payload_f64(payload: &Value, key: &str, default: f64) -> f64 {
    payload.get(key).and_then(Value::as_f64).unwrap_or(default)
}

/// Pre-execution validation for tradeable types. Non-tradeable types always
/// pass. Disabled wholesale by `RISK_HARD_LIMITS_DISABLE=1`.
pub async fn hard_limits_check(
    pool: &PgPool,
    cfg: &Config,
    inputs: &RiskInputs,
    command: &Command,
) -> Result<RiskDecision> {
    if cfg.risk_hard_limits_disable || !is_tradeable(&command.kind) {
        return Ok(RiskDecision::allow());
    }

    let notional = payload_f64(&command.payload, "notional", 100.0);
    let capital = cfg.capital_usd;

    let has_stop = command.payload.get("stop_loss").is_some()
        || command.payload.get("stop_price").is_some();
    if !has_stop {
        return Ok(RiskDecision::block(
            codes::risk_hard_limit_code(codes::STOP_REQUIRED, "missing stop_loss or stop_price"),
            "order carries no stop",
        ));
    }

    // Unconfigured capital (<=0, also this crate's own default) skips the
    // percentage-based checks entirely rather than substituting infinity —
    // mirrors `validate_single_trade_risk`/`validate_net_exposure`/
    // `validate_leverage` each returning `(True, None)` when `capital <= 0`.
    if capital > 0.0 {
        let single_trade_risk_pct = notional / capital * 100.0;
        if single_trade_risk_pct > cfg.max_single_trade_risk_pct {
            return Ok(RiskDecision::block(
                codes::risk_hard_limit_code(
                    codes::SINGLE_TRADE_RISK_EXCEEDED,
                    &format!("{single_trade_risk_pct:.2}pct"),
                ),
                format!(
                    "single trade risk {single_trade_risk_pct:.2}% exceeds {:.2}%",
                    cfg.max_single_trade_risk_pct
                ),
            ));
        }

        let max_exposure_usd = capital * cfg.max_net_exposure_pct / 100.0;
        let total_after = if cfg.risk_exposure_atomic {
            match execd_db::reserve_exposure(pool, notional, max_exposure_usd).await? {
                execd_db::ReserveOutcome::Reserved { new_total } => new_total,
                execd_db::ReserveOutcome::Exceeded { current } => {
                    return Ok(RiskDecision::block(
                        codes::risk_hard_limit_code(
                            codes::NET_EXPOSURE_EXCEEDED,
                            &format!("current={current:.2}"),
                        ),
                        format!(
                            "reserving {notional:.2} would exceed max exposure {max_exposure_usd:.2}"
                        ),
                    ));
                }
            }
        } else {
            let current = execd_db::current_net_exposure(pool, TRADEABLE_TYPES).await?;
            let total = current + notional;
            let exposure_pct = total / capital * 100.0;
            if exposure_pct > cfg.max_net_exposure_pct {
                return Ok(RiskDecision::block(
                    codes::risk_hard_limit_code(
                        codes::NET_EXPOSURE_EXCEEDED,
                        &format!("{exposure_pct:.2}pct"),
                    ),
                    format!(
                        "net exposure {exposure_pct:.2}% exceeds {:.2}%",
                        cfg.max_net_exposure_pct
                    ),
                ));
            }
            total
        };

        let leverage = total_after / capital;
        if leverage > cfg.max_leverage {
            return Ok(RiskDecision::block(
                codes::risk_hard_limit_code(codes::LEVERAGE_EXCEEDED, &format!("{leverage:.2}x")),
                format!("leverage {leverage:.2}x exceeds {:.2}x", cfg.max_leverage),
            ));
        }
    }

    if inputs.today_loss_pct >= cfg.max_daily_drawdown_pct {
        return Ok(RiskDecision::block(
            codes::risk_hard_limit_code(
                codes::DAILY_DRAWDOWN_EXCEEDED,
                &format!("{:.2}pct", inputs.today_loss_pct),
            ),
            format!(
                "today's drawdown {:.2}% has reached {:.2}%",
                inputs.today_loss_pct, cfg.max_daily_drawdown_pct
            ),
        ));
    }

    Ok(RiskDecision::allow())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use execd_schemas::CommandStatus;
    use serde_json::json;

    fn cfg() -> Config {
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        let cfg = Config::from_env().unwrap();
        std::env::remove_var("DATABASE_URL");
        cfg
    }

    fn command(kind: &str, payload: Value) -> Command {
        Command {
            id: "q-1".into(),
            kind: kind.into(),
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

    #[test]
    fn lockout_allows_noop_while_active() {
        let cfg = cfg();
        let inputs = RiskInputs {
            today_loss_pct: 99.0,
            consecutive_losses: 0,
            lockout_override_clear: false,
        };
        let d = lockout_check(&cfg, &inputs, &command("NOOP", json!({})));
        assert!(d.allowed);
    }

    #[test]
    fn lockout_blocks_non_allowlisted_while_active() {
        let cfg = cfg();
        let inputs = RiskInputs {
            today_loss_pct: 0.0,
            consecutive_losses: 999,
            lockout_override_clear: false,
        };
        let d = lockout_check(&cfg, &inputs, &command("QUOTE", json!({})));
        assert!(!d.allowed);
        assert_eq!(d.code.as_deref(), Some(codes::RISK_LOCKOUT_ACTIVE));
    }

    #[test]
    fn lockout_inactive_allows_everything() {
        let cfg = cfg();
        let inputs = RiskInputs::default();
        let d = lockout_check(&cfg, &inputs, &command("QUOTE", json!({})));
        assert!(d.allowed);
    }
}
