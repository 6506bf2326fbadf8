//! Shared wire/storage types for the command execution engine.
//!
//! Every other crate in the workspace depends on this one; it carries no
//! logic beyond parsing/formatting and the event-payload trimming policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub mod codes;

// ---------------------------------------------------------------------------
// CommandStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "PENDING",
            CommandStatus::Running => "RUNNING",
            CommandStatus::Done => "DONE",
            CommandStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CommandStatus::Pending),
            "RUNNING" => Some(CommandStatus::Running),
            "DONE" => Some(CommandStatus::Done),
            "FAILED" => Some(CommandStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A single row of the command table (`commands_domain`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: CommandStatus,
    pub attempt: i32,
    pub payload: Value,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Types whose notional contributes to net exposure / leverage checks.
pub const TRADEABLE_TYPES: &[&str] = &["QUOTE"];

pub fn is_tradeable(kind: &str) -> bool {
    TRADEABLE_TYPES.contains(&kind.to_ascii_uppercase().as_str())
}

/// Command types exempt from risk lockout while it is active.
pub const LOCKOUT_ALLOWLIST: &[&str] = &["NOOP"];

pub fn lockout_allows(kind: &str) -> bool {
    LOCKOUT_ALLOWLIST.contains(&kind.to_ascii_uppercase().as_str())
}

/// Normalize a command-type token: trim, uppercase. Lookup everywhere
/// (registry, policies, risk allowlists) goes through this so a client
/// sending `"noop"` or `" Noop "` still resolves.
pub fn normalize_type(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single append-only row of the event log (`domain_events`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub command_id: String,
    pub event_type: String,
    pub attempt: i32,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Synthetic command ids that carry events without a backing command row.
pub const SYNTHETIC_OPS_WORKER: &str = "ops-worker";
pub const SYNTHETIC_OPS_KILL_SWITCH: &str = "ops-kill-switch";
pub const SYNTHETIC_WORKER_HEARTBEAT: &str = "anchor:worker_heartbeat";

pub fn is_synthetic_command_id(id: &str) -> bool {
    id == SYNTHETIC_OPS_WORKER || id == SYNTHETIC_OPS_KILL_SWITCH || id.starts_with("anchor:")
}

/// Event type tokens, §7 of the design. Kept as plain strings in storage
/// (the event_type column is just text) but enumerated here so producers
/// can't typo a literal.
pub mod event_type {
    pub const PICKED: &str = "PICKED";
    pub const POLICY_ALLOW: &str = "POLICY_ALLOW";
    pub const POLICY_BLOCK: &str = "POLICY_BLOCK";
    pub const RISK_LOCKOUT_BLOCK: &str = "RISK_LOCKOUT_BLOCK";
    pub const RISK_HARD_LIMITS_BLOCK: &str = "RISK_HARD_LIMITS_BLOCK";
    pub const ACTION_OK: &str = "ACTION_OK";
    pub const ACTION_FAIL: &str = "ACTION_FAIL";
    pub const ACTION_EXCEPTION: &str = "ACTION_EXCEPTION";
    pub const MARK_DONE: &str = "MARK_DONE";
    pub const MARK_FAILED: &str = "MARK_FAILED";
    pub const EXCEPTION: &str = "EXCEPTION";
    pub const RETRY: &str = "RETRY";
    pub const KILL_SWITCH_ON: &str = "KILL_SWITCH_ON";
    pub const KILL_SWITCH_SET: &str = "KILL_SWITCH_SET";
    pub const WORKER_HEARTBEAT: &str = "WORKER_HEARTBEAT";
    pub const WORKER_PANIC: &str = "WORKER_PANIC";
    pub const PANIC_GUARD_TRIGGERED: &str = "PANIC_GUARD_TRIGGERED";
    pub const PANIC_GUARD_RESET: &str = "PANIC_GUARD_RESET";

    /// Events that constitute a terminal write for a (command_id, attempt).
    pub const TERMINAL: &[&str] = &[MARK_DONE, MARK_FAILED];
}

// ---------------------------------------------------------------------------
// Event payload trimming (≈8 KB budget)
// ---------------------------------------------------------------------------

pub const EVENT_PAYLOAD_BUDGET_BYTES: usize = 8 * 1024;

/// Keys the trimming policy always keeps (when present), before falling
/// back to truncating everything else. Order matches §6: "code, message,
/// type, attempt, ts, error, result_summary".
const RETAINED_KEYS: &[&str] = &[
    "code",
    "message",
    "type",
    "attempt",
    "ts",
    "error",
    "result_summary",
];

const MAX_STRING_LEN: usize = 2048;

/// Trim an event payload to fit the ~8 KB budget.
///
/// Strategy: truncate long strings and large nested maps/arrays first; if
/// the payload is still over budget, drop every key not in
/// [`RETAINED_KEYS`]. Never panics; always returns something serializable.
pub fn trim_event_payload(payload: &Value) -> Value {
    let shallow = truncate_value(payload, 0);
    if estimated_size(&shallow) <= EVENT_PAYLOAD_BUDGET_BYTES {
        return shallow;
    }

    match &shallow {
        Value::Object(map) => {
            let mut kept = Map::new();
            for key in RETAINED_KEYS {
                if let Some(v) = map.get(*key) {
                    kept.insert((*key).to_string(), v.clone());
                }
            }
            if kept.is_empty() {
                Value::String("<event payload too large, dropped>".to_string())
            } else {
                Value::Object(kept)
            }
        }
        other => {
            // Non-object payloads have no keys to retain; hard-truncate the
            // rendered string form.
            let rendered = other.to_string();
            Value::String(truncate_str(&rendered, MAX_STRING_LEN))
        }
    }
}

fn truncate_value(v: &Value, depth: u8) -> Value {
    const MAX_DEPTH: u8 = 4;
    const MAX_ARRAY_ITEMS: usize = 32;
    const MAX_OBJECT_KEYS: usize = 64;

    if depth >= MAX_DEPTH {
        return Value::String("<truncated: max depth>".to_string());
    }

    match v {
        Value::String(s) => Value::String(truncate_str(s, MAX_STRING_LEN)),
        Value::Array(items) => {
            let truncated: Vec<Value> = items
                .iter()
                .take(MAX_ARRAY_ITEMS)
                .map(|item| truncate_value(item, depth + 1))
                .collect();
            Value::Array(truncated)
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().take(MAX_OBJECT_KEYS) {
                out.insert(k.clone(), truncate_value(v, depth + 1));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut cut = max;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…<truncated>", &s[..cut])
    }
}

fn estimated_size(v: &Value) -> usize {
    serde_json::to_vec(v).map(|b| b.len()).unwrap_or(usize::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_round_trips() {
        for s in [
            CommandStatus::Pending,
            CommandStatus::Running,
            CommandStatus::Done,
            CommandStatus::Failed,
        ] {
            assert_eq!(CommandStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn normalize_type_trims_and_uppercases() {
        assert_eq!(normalize_type("  noop "), "NOOP");
        assert_eq!(normalize_type("Quote"), "QUOTE");
    }

    #[test]
    fn small_payload_passes_through_unchanged() {
        let p = json!({"code": "X", "message": "short"});
        assert_eq!(trim_event_payload(&p), p);
    }

    #[test]
    fn oversized_payload_falls_back_to_retained_keys() {
        let huge = "a".repeat(20 * 1024);
        let p = json!({
            "code": "RATE_LIMIT",
            "message": "too many",
            "junk": huge,
        });
        let trimmed = trim_event_payload(&p);
        let obj = trimmed.as_object().expect("object");
        assert!(!obj.contains_key("junk"));
        assert_eq!(obj.get("code").unwrap(), "RATE_LIMIT");
    }

    #[test]
    fn trimmed_payload_never_exceeds_budget() {
        let mut obj = Map::new();
        for i in 0..500 {
            obj.insert(format!("k{i}"), Value::String("x".repeat(200)));
        }
        let trimmed = trim_event_payload(&Value::Object(obj));
        assert!(estimated_size(&trimmed) <= EVENT_PAYLOAD_BUDGET_BYTES);
    }
}
