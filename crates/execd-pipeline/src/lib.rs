//! Validate -> Execute -> Postprocess wrapper around a handler. Converts any
//! panic inside the handler into a structured `STEP_EXCEPTION` result so the
//! runner never needs to catch anything itself.

use execd_registry::{Handler, HandlerOutput};
use execd_schemas::{codes, Command};
use serde_json::{json, Value};
use std::panic::AssertUnwindSafe;

/// Run the pipeline for one claimed command against its resolved handler.
///
/// `Handler::run_core` is a required trait method in this realization, so
/// the `NO_RUN_CORE` (`execd_schemas::codes::NO_RUN_CORE`) case the source
/// system models as "handler object missing a method" cannot occur here by
/// construction; the code constant is kept in the taxonomy for completeness
/// and is never produced.
pub fn run(handler: &dyn Handler, command: &Command) -> HandlerOutput {
    let validated = match validate(command) {
        Ok(c) => c,
        Err(out) => return out,
    };

    let executed = match execute(handler, &validated) {
        Ok(out) => out,
        Err(out) => return out,
    };

    postprocess(executed)
}

/// Ensures payload is an object (coercing otherwise) and attempt is
/// non-negative. `id`/`type` are always present on a `Command` in this
/// realization (they are non-optional fields), so there is nothing to
/// backfill there.
fn validate(command: &Command) -> Result<Command, HandlerOutput> {
    let mut validated = command.clone();
    if !validated.payload.is_object() {
        validated.payload = json!({ "value": validated.payload });
    }
    if validated.attempt < 0 {
        validated.attempt = 0;
    }
    Ok(validated)
}

fn execute(handler: &dyn Handler, command: &Command) -> Result<HandlerOutput, HandlerOutput> {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| handler.run(command)));
    match result {
        Ok(out) => Ok(out),
        Err(panic) => {
            let message = panic_message(&panic);
            Err(HandlerOutput {
                ok: false,
                result: None,
                error: Some(json!({
                    "code": codes::STEP_EXCEPTION,
                    "step": "execute",
                    "message": message,
                })),
            })
        }
    }
}

/// If the execute step's result is ok and its result object lacks a `ts`
/// field, attach the current Unix timestamp (seconds).
fn postprocess(mut out: HandlerOutput) -> HandlerOutput {
    if out.ok {
        if let Some(Value::Object(map)) = &mut out.result {
            if !map.contains_key("ts") {
                let ts = chrono::Utc::now().timestamp();
                map.insert("ts".to_string(), json!(ts));
            }
        }
    }
    out
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use execd_schemas::CommandStatus;

    struct PanicHandler;
    impl Handler for PanicHandler {
        fn name(&self) -> &'static str {
            "PANIC"
        }
        fn run_core(&self, _command: &Command) -> HandlerOutput {
            panic!("boom");
        }
    }

    struct OkHandler;
    impl Handler for OkHandler {
        fn name(&self) -> &'static str {
            "OK"
        }
        fn run_core(&self, _command: &Command) -> HandlerOutput {
            HandlerOutput::ok(json!({"done": true}))
        }
    }

    fn command(payload: Value) -> Command {
        Command {
            id: "x-1".into(),
            kind: "X".into(),
            status: CommandStatus::Running,
            attempt: 1,
            payload,
            result: None,
            error: None,
            locked_by: None,
            locked_at: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn panicking_handler_becomes_step_exception() {
        let out = run(&PanicHandler, &command(json!({})));
        assert!(!out.ok);
        assert_eq!(out.error.unwrap()["code"], codes::STEP_EXCEPTION);
    }

    #[test]
    fn postprocess_attaches_ts_when_missing() {
        let out = run(&OkHandler, &command(json!({})));
        assert!(out.result.unwrap().get("ts").is_some());
    }

    #[test]
    fn non_object_payload_is_coerced() {
        let out = validate(&command(json!("not-an-object"))).unwrap();
        assert!(out.payload.is_object());
    }
}
