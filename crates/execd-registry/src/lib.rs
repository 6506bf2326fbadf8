//! Maps a command type to its handler. Populated once at startup; lookup is
//! case-insensitive by trimmed-uppercase name, matching
//! `execd_schemas::normalize_type`.

use execd_schemas::{codes, normalize_type, Command};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A handler's result. Handlers never raise; a panic inside one is caught by
/// the pipeline's `catch_unwind` boundary, not by this type.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub ok: bool,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl HandlerOutput {
    pub fn ok(result: Value) -> Self {
        HandlerOutput {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn fail(code: &str) -> Self {
        HandlerOutput {
            ok: false,
            result: None,
            error: Some(json!({ "code": code })),
        }
    }
}

/// A handler declares a name and implements `run_core`; `run` defaults to
/// `run_core` but exists as a seam for handlers that need pre/post work
/// outside what the pipeline's own Validate/Postprocess steps provide.
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    fn run_core(&self, command: &Command) -> HandlerOutput;

    fn run(&self, command: &Command) -> HandlerOutput {
        self.run_core(command)
    }
}

pub struct NoopHandler;

impl Handler for NoopHandler {
    fn name(&self) -> &'static str {
        "NOOP"
    }

    fn run_core(&self, command: &Command) -> HandlerOutput {
        HandlerOutput::ok(json!({
            "ok": true,
            "type": "noop",
            "payload": command.payload,
        }))
    }
}

pub struct FailHandler;

impl Handler for FailHandler {
    fn name(&self) -> &'static str {
        "FAIL"
    }

    fn run_core(&self, _command: &Command) -> HandlerOutput {
        HandlerOutput::fail(codes::INTENTIONAL_FAIL)
    }
}

pub struct FlakyHandler;

impl Handler for FlakyHandler {
    fn name(&self) -> &'static str {
        "FLAKY"
    }

    fn run_core(&self, command: &Command) -> HandlerOutput {
        if command.attempt <= 1 {
            HandlerOutput::fail(codes::FLAKY_FAIL)
        } else {
            HandlerOutput::ok(json!({
                "ok": true,
                "type": "flaky",
                "attempt": command.attempt,
            }))
        }
    }
}

pub struct QuoteHandler;

impl Handler for QuoteHandler {
    fn name(&self) -> &'static str {
        "QUOTE"
    }

    fn run_core(&self, command: &Command) -> HandlerOutput {
        let payload = command.payload.as_object();

        let symbol = payload
            .and_then(|p| p.get("symbol"))
            .and_then(Value::as_str)
            .unwrap_or("BTCUSDT")
            .to_string();

        let side = payload
            .and_then(|p| p.get("side"))
            .and_then(Value::as_str)
            .unwrap_or("BUY")
            .to_uppercase();
        let side = if side == "BUY" || side == "SELL" {
            side
        } else {
            "BUY".to_string()
        };

        let notional = payload
            .and_then(|p| p.get("notional"))
            .and_then(Value::as_f64)
            .unwrap_or(100.0);
        let notional = if notional <= 0.0 { 100.0 } else { notional };

        let explicit_price = payload
            .and_then(|p| p.get("price"))
            .and_then(Value::as_f64)
            .filter(|p| *p > 0.0);

        let price = explicit_price.unwrap_or_else(|| derive_price(&symbol, &side));
        let qty = round8(notional / price);

        HandlerOutput::ok(json!({
            "ok": true,
            "type": "quote",
            "symbol": symbol,
            "side": side,
            "notional": notional,
            "price": price,
            "qty": qty,
        }))
    }
}

/// Deterministic price derivation: first 8 hex digits of SHA-256(symbol),
/// mapped into [10, 100000]; SELL adds 1 so BUY/SELL never collide.
fn derive_price(symbol: &str, side: &str) -> f64 {
    let digest = Sha256::digest(symbol.as_bytes());
    let hex_prefix = hex::encode(&digest[..4]); // 4 bytes = 8 hex digits
    let n = u32::from_str_radix(&hex_prefix, 16).unwrap_or(0) as u64;
    let mut price = 10 + (n % (100_000 - 10 + 1));
    if side == "SELL" {
        price += 1;
    }
    price as f64
}

fn round8(v: f64) -> f64 {
    (v * 1e8).round() / 1e8
}

/// Map of uppercase command type -> handler. Immutable after construction;
/// rebuilding via `Registry::new()` is cheap and idempotent (no shared
/// mutable state across instances).
pub struct Registry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        let mut handlers: HashMap<String, Box<dyn Handler>> = HashMap::new();
        for handler in built_ins() {
            handlers.insert(handler.name().to_string(), handler);
        }
        Registry { handlers }
    }

    pub fn lookup(&self, kind: &str) -> Option<&dyn Handler> {
        self.handlers
            .get(&normalize_type(kind))
            .map(|b| b.as_ref())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn built_ins() -> Vec<Box<dyn Handler>> {
    vec![
        Box::new(NoopHandler),
        Box::new(FailHandler),
        Box::new(FlakyHandler),
        Box::new(QuoteHandler),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use execd_schemas::CommandStatus;

    fn command(kind: &str, attempt: i32, payload: Value) -> Command {
        Command {
            id: format!("{}-test", kind.to_lowercase()),
            kind: kind.to_string(),
            status: CommandStatus::Running,
            attempt,
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
    fn lookup_is_case_insensitive_and_trims() {
        let reg = Registry::new();
        assert!(reg.lookup("noop").is_some());
        assert!(reg.lookup(" Noop ").is_some());
        assert!(reg.lookup("UNKNOWN").is_none());
    }

    #[test]
    fn noop_echoes_payload() {
        let cmd = command("NOOP", 1, json!({"x": 1}));
        let out = NoopHandler.run_core(&cmd);
        assert!(out.ok);
        assert_eq!(out.result.unwrap()["payload"], json!({"x": 1}));
    }

    #[test]
    fn fail_is_always_intentional() {
        let cmd = command("FAIL", 1, json!({}));
        let out = FailHandler.run_core(&cmd);
        assert!(!out.ok);
        assert_eq!(out.error.unwrap()["code"], codes::INTENTIONAL_FAIL);
    }

    #[test]
    fn flaky_fails_first_then_succeeds() {
        let first = command("FLAKY", 1, json!({}));
        assert!(!FlakyHandler.run_core(&first).ok);

        let second = command("FLAKY", 2, json!({}));
        assert!(FlakyHandler.run_core(&second).ok);
    }

    #[test]
    fn quote_price_is_deterministic() {
        let cmd = command("QUOTE", 1, json!({"symbol": "BTCUSDT", "side": "BUY", "notional": 100}));
        let a = QuoteHandler.run_core(&cmd);
        let b = QuoteHandler.run_core(&cmd);
        assert_eq!(a.result, b.result);
    }

    #[test]
    fn quote_buy_and_sell_prices_never_collide() {
        let buy = command("QUOTE", 1, json!({"symbol": "ETHUSDT", "side": "BUY"}));
        let sell = command("QUOTE", 1, json!({"symbol": "ETHUSDT", "side": "SELL"}));
        let buy_price = QuoteHandler.run_core(&buy).result.unwrap()["price"].clone();
        let sell_price = QuoteHandler.run_core(&sell).result.unwrap()["price"].clone();
        assert_ne!(buy_price, sell_price);
    }

    #[test]
    fn quote_honors_explicit_positive_price() {
        let cmd = command(
            "QUOTE",
            1,
            json!({"symbol": "BTCUSDT", "notional": 200, "price": 50.0}),
        );
        let out = QuoteHandler.run_core(&cmd);
        assert_eq!(out.result.unwrap()["price"], json!(50.0));
    }
}
