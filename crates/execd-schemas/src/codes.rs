//! Error/guardrail code taxonomy (§7). These strings appear as event payload
//! `code` fields and as the terminal `command.error` reason.

// Guardrails
pub const IDEMPOTENT_BLOCK: &str = "IDEMPOTENT_BLOCK";
pub const RATE_LIMIT: &str = "RATE_LIMIT";
pub const COOLDOWN_AFTER_FAIL: &str = "COOLDOWN_AFTER_FAIL";
pub const QUOTE_NOTIONAL_TOO_LARGE: &str = "QUOTE_NOTIONAL_TOO_LARGE";
pub const RISK_LOCKOUT_ACTIVE: &str = "RISK_LOCKOUT_ACTIVE";
pub const KILL_SWITCH_ON: &str = "KILL_SWITCH_ON";

// RISK_HARD_LIMITS_<rule>
pub const SINGLE_TRADE_RISK_EXCEEDED: &str = "SINGLE_TRADE_RISK_EXCEEDED";
pub const NET_EXPOSURE_EXCEEDED: &str = "NET_EXPOSURE_EXCEEDED";
pub const LEVERAGE_EXCEEDED: &str = "LEVERAGE_EXCEEDED";
pub const DAILY_DRAWDOWN_EXCEEDED: &str = "DAILY_DRAWDOWN_EXCEEDED";
pub const STOP_REQUIRED: &str = "STOP_REQUIRED";

/// Format a hard-limit block code: `RISK_HARD_LIMITS_<rule>:<detail>`.
pub fn risk_hard_limit_code(rule: &str, detail: &str) -> String {
    format!("RISK_HARD_LIMITS_{rule}:{detail}")
}

// Dispatch
pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
pub const NO_RUN_CORE: &str = "NO_RUN_CORE";

// Handler
pub const INTENTIONAL_FAIL: &str = "INTENTIONAL_FAIL";
pub const FLAKY_FAIL: &str = "FLAKY_FAIL";

// Pipeline / runner
pub const STEP_EXCEPTION: &str = "STEP_EXCEPTION";
pub const STEP_FAILED: &str = "STEP_FAILED";
pub const ACTION_EXCEPTION: &str = "ACTION_EXCEPTION";
pub const RUNNER_PERSIST_ERROR: &str = "RUNNER_PERSIST_ERROR";

// Worker
pub const WORKER_PANIC: &str = "WORKER_PANIC";
