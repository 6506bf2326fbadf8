//! Environment-derived configuration (§6 of the design).
//!
//! Every runtime threshold is read from the process environment with a
//! documented default. There is no YAML/file layer here — thresholds are
//! cheap to override per-deployment (container env, systemd unit, `.env`)
//! and the whole point of this crate is to have exactly one place that
//! calls `std::env::var`.

use anyhow::{bail, Context, Result};

/// Execution mode. `Prod`/`Production` locks destructive/dev-only operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    Dev,
    Prod,
}

impl ExecMode {
    pub fn is_prod(&self) -> bool {
        matches!(self, ExecMode::Prod)
    }

    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => ExecMode::Prod,
            _ => ExecMode::Dev,
        }
    }
}

/// All environment-derived configuration for one process (daemon, worker,
/// or API). Constructed once at startup via [`Config::from_env`].
#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: Option<String>,
    pub exec_mode: ExecMode,
    pub ops_token: Option<String>,
    pub anchor_kill_switch: bool,

    pub worker_poll_interval_sec: u64,
    pub worker_heartbeat_seconds: u64,
    pub worker_panic_threshold: u32,
    pub worker_panic_window_seconds: u64,
    pub worker_panic_cooldown_seconds: u64,
    pub worker_inject_panic: bool,
    pub pending_check_interval_sec: u64,
    pub panic_guard_cooldown_sec: i64,

    pub policy_rate_limit_per_minute_default: i64,
    pub policy_fail_cooldown_seconds: i64,
    pub policy_quote_max_notional: f64,

    pub capital_usd: f64,
    pub max_single_trade_risk_pct: f64,
    pub max_net_exposure_pct: f64,
    pub max_leverage: f64,
    pub max_daily_drawdown_pct: f64,

    pub risk_lockout_loss_pct: f64,
    pub risk_lockout_consec_losses: i64,
    pub risk_lockout_minutes: i64,
    pub risk_lockout_disable: bool,
    pub risk_hard_limits_disable: bool,
    pub risk_exposure_atomic: bool,
    pub lockout_clear_ttl_sec: i64,

    pub telegram_notify_enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub telegram_throttle_seconds: u64,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print secrets; everything else is an operational threshold
        // and safe to log at startup.
        f.debug_struct("Config")
            .field("database_url", &"<redacted>")
            .field("redis_url", &self.redis_url.as_ref().map(|_| "<redacted>"))
            .field("exec_mode", &self.exec_mode)
            .field("ops_token", &self.ops_token.as_ref().map(|_| "<redacted>"))
            .field("anchor_kill_switch", &self.anchor_kill_switch)
            .field("worker_poll_interval_sec", &self.worker_poll_interval_sec)
            .field("worker_heartbeat_seconds", &self.worker_heartbeat_seconds)
            .field("worker_panic_threshold", &self.worker_panic_threshold)
            .field(
                "worker_panic_window_seconds",
                &self.worker_panic_window_seconds,
            )
            .field("capital_usd", &self.capital_usd)
            .field("risk_hard_limits_disable", &self.risk_hard_limits_disable)
            .field("risk_exposure_atomic", &self.risk_exposure_atomic)
            .field(
                "telegram_bot_token",
                &self.telegram_bot_token.as_ref().map(|_| "<redacted>"),
            )
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// `DATABASE_URL` is the only required variable; everything else has a
    /// documented default matching §6.
    pub fn from_env() -> Result<Self> {
        let database_url =
            env_string("DATABASE_URL").context("missing required env var DATABASE_URL")?;

        let exec_mode = ExecMode::parse(&env_opt_string("EXEC_MODE").unwrap_or_default());

        // Strict-check: if both EXEC_MODE and NEXT_PUBLIC_EXEC_MODE are set,
        // they must agree on prod-ness or startup aborts.
        if let Some(next_public) = env_opt_string("NEXT_PUBLIC_EXEC_MODE") {
            let next_public_mode = ExecMode::parse(&next_public);
            if next_public_mode.is_prod() != exec_mode.is_prod() {
                bail!(
                    "EXEC_MODE and NEXT_PUBLIC_EXEC_MODE disagree on prod-ness \
                     (EXEC_MODE={:?} NEXT_PUBLIC_EXEC_MODE={:?}); refusing to start",
                    exec_mode,
                    next_public_mode
                );
            }
        }

        Ok(Config {
            database_url,
            redis_url: env_opt_string("REDIS_URL"),
            exec_mode,
            ops_token: env_opt_string("OPS_TOKEN"),
            anchor_kill_switch: env_bool("ANCHOR_KILL_SWITCH", false),

            worker_poll_interval_sec: env_u64("WORKER_POLL_INTERVAL_SEC", 1),
            worker_heartbeat_seconds: env_u64("WORKER_HEARTBEAT_SECONDS", 30),
            worker_panic_threshold: env_u64("WORKER_PANIC_THRESHOLD", 5) as u32,
            worker_panic_window_seconds: env_u64("WORKER_PANIC_WINDOW_SECONDS", 60),
            worker_panic_cooldown_seconds: env_u64("WORKER_PANIC_COOLDOWN_SECONDS", 60),
            worker_inject_panic: env_bool("WORKER_INJECT_PANIC", false),
            pending_check_interval_sec: env_u64("PENDING_CHECK_INTERVAL_SEC", 10),
            panic_guard_cooldown_sec: env_i64("PANIC_GUARD_COOLDOWN_SEC", 60),

            policy_rate_limit_per_minute_default: env_i64(
                "POLICY_RATE_LIMIT_PER_MINUTE",
                100_000,
            ),
            policy_fail_cooldown_seconds: env_i64("POLICY_FAIL_COOLDOWN_SECONDS", 0),
            policy_quote_max_notional: env_f64("POLICY_QUOTE_MAX_NOTIONAL", 0.0),

            capital_usd: env_f64("CAPITAL_USD", 100_000.0),
            max_single_trade_risk_pct: env_f64("MAX_SINGLE_TRADE_RISK_PCT", 2.0),
            max_net_exposure_pct: env_f64("MAX_NET_EXPOSURE_PCT", 50.0),
            max_leverage: env_f64("MAX_LEVERAGE", 3.0),
            max_daily_drawdown_pct: env_f64("MAX_DAILY_DRAWDOWN_PCT", 5.0),

            risk_lockout_loss_pct: env_f64("RISK_LOCKOUT_LOSS_PCT", 5.0),
            risk_lockout_consec_losses: env_i64("RISK_LOCKOUT_CONSEC_LOSSES", 5),
            risk_lockout_minutes: env_i64("RISK_LOCKOUT_MINUTES", 60),
            risk_lockout_disable: env_bool("RISK_LOCKOUT_DISABLE", false),
            risk_hard_limits_disable: env_bool("RISK_HARD_LIMITS_DISABLE", false),
            risk_exposure_atomic: env_bool("RISK_EXPOSURE_ATOMIC", false),
            lockout_clear_ttl_sec: env_i64("LOCKOUT_CLEAR_TTL_SEC", 3600),

            telegram_notify_enabled: env_bool("TELEGRAM_NOTIFY_ENABLED", false),
            telegram_bot_token: env_opt_string("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt_string("TELEGRAM_CHAT_ID"),
            telegram_throttle_seconds: env_u64("TELEGRAM_THROTTLE_SECONDS", 60),
        })
    }

    /// Per-type rate limit (`POLICY_RATE_LIMIT_PER_MINUTE_<TYPE>`), falling
    /// back to the global default. `<= 0` disables the limit.
    pub fn rate_limit_per_minute(&self, command_type: &str) -> i64 {
        let var = format!(
            "POLICY_RATE_LIMIT_PER_MINUTE_{}",
            command_type.trim().to_ascii_uppercase()
        );
        match env_opt_string(&var).and_then(|v| v.parse::<i64>().ok()) {
            Some(v) => v,
            None => self.policy_rate_limit_per_minute_default,
        }
    }
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

fn env_opt_string(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

fn env_string(name: &str) -> Result<String> {
    env_opt_string(name).with_context(|| format!("env var {name} not set"))
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_opt_string(name) {
        Some(v) => v == "1" || v.eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    env_opt_string(name)
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    env_opt_string(name)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(default)
}

fn env_f64(name: &str, default: f64) -> f64 {
    env_opt_string(name)
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var mutation is process-global; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_database_url_is_an_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("DATABASE_URL");
        assert!(Config::from_env().is_err());
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::remove_var("CAPITAL_USD");
        std::env::remove_var("POLICY_QUOTE_MAX_NOTIONAL");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.capital_usd, 100_000.0);
        assert_eq!(cfg.policy_quote_max_notional, 0.0);
        std::env::remove_var("DATABASE_URL");
    }

    #[test]
    fn exec_mode_mismatch_aborts_startup() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::set_var("EXEC_MODE", "prod");
        std::env::set_var("NEXT_PUBLIC_EXEC_MODE", "dev");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("disagree"));
        std::env::remove_var("DATABASE_URL");
        std::env::remove_var("EXEC_MODE");
        std::env::remove_var("NEXT_PUBLIC_EXEC_MODE");
    }

    #[test]
    fn per_type_rate_limit_falls_back_to_default() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("DATABASE_URL", "postgres://localhost/test");
        std::env::remove_var("POLICY_RATE_LIMIT_PER_MINUTE_QUOTE");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.rate_limit_per_minute("QUOTE"), 100_000);

        std::env::set_var("POLICY_RATE_LIMIT_PER_MINUTE_QUOTE", "7");
        assert_eq!(cfg.rate_limit_per_minute("quote"), 7);
        std::env::remove_var("POLICY_RATE_LIMIT_PER_MINUTE_QUOTE");
        std::env::remove_var("DATABASE_URL");
    }
}
