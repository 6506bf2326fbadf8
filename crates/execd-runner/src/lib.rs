//! Orchestrates one claimed command end-to-end: lockout -> hard limits ->
//! policy chain -> handler -> terminal write, with an event emitted at
//! every boundary. Never raises to the worker loop under any circumstance.

use execd_config::Config;
use execd_ops::KillSwitch;
use execd_policy::{Policy, PolicyContext};
use execd_registry::Registry;
use execd_schemas::{codes, event_type, CommandStatus};
use serde_json::{json, Value};
use sqlx::PgPool;

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub id: String,
    pub kind: String,
    pub final_status: CommandStatus,
}

pub struct Runner<'a> {
    pub pool: &'a PgPool,
    pub sink: &'a dyn execd_db::NotifySink,
    pub registry: &'a Registry,
    pub policies: &'a [Box<dyn Policy>],
    pub config: &'a Config,
    pub kill_switch: &'a KillSwitch,
}

impl<'a> Runner<'a> {
    /// Claim and fully process at most one command. Returns `None` if
    /// nothing was PENDING. Every internal failure is absorbed (logged,
    /// best-effort `mark_failed`) rather than propagated.
    pub async fn run_one(&self, worker_id: &str) -> Option<RunOutcome> {
        let command = match execd_db::claim_one(self.pool, worker_id).await {
            Ok(Some(c)) => c,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(error = %e, "claim_one failed");
                return None;
            }
        };

        execd_db::append_event(
            self.pool,
            self.sink,
            &command.id,
            event_type::PICKED,
            command.attempt,
            json!({ "type": command.kind, "attempt": command.attempt }),
        )
        .await;

        let risk_inputs = self.gather_risk_inputs(&command).await;

        let lockout = execd_risk::lockout_check(self.config, &risk_inputs, &command);
        if !lockout.allowed {
            return self
                .fail(
                    &command,
                    event_type::RISK_LOCKOUT_BLOCK,
                    lockout.code.as_deref().unwrap_or(codes::RISK_LOCKOUT_ACTIVE),
                    lockout.message.unwrap_or_default(),
                )
                .await;
        }

        let hard_limits =
            match execd_risk::hard_limits_check(self.pool, self.config, &risk_inputs, &command)
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(error = %e, "hard_limits_check failed, fail-open");
                    execd_risk::RiskDecision::allow()
                }
            };
        if !hard_limits.allowed {
            return self
                .fail(
                    &command,
                    event_type::RISK_HARD_LIMITS_BLOCK,
                    hard_limits.code.as_deref().unwrap_or("RISK_HARD_LIMITS"),
                    hard_limits.message.unwrap_or_default(),
                )
                .await;
        }

        let ctx = PolicyContext {
            pool: self.pool,
            config: self.config,
        };
        let chain = execd_policy::run_chain(self.policies, &ctx, &command).await;
        if let Some(block) = chain.blocked {
            return self
                .fail(
                    &command,
                    event_type::POLICY_BLOCK,
                    block.code.as_deref().unwrap_or("POLICY_BLOCK"),
                    block.message.unwrap_or_default(),
                )
                .await;
        }
        execd_db::append_event(
            self.pool,
            self.sink,
            &command.id,
            event_type::POLICY_ALLOW,
            command.attempt,
            json!({ "policies": chain.applied }),
        )
        .await;

        let Some(handler) = self.registry.lookup(&command.kind) else {
            return self
                .fail(
                    &command,
                    event_type::MARK_FAILED,
                    codes::UNKNOWN_TYPE,
                    format!("no handler registered for type {}", command.kind),
                )
                .await;
        };

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            execd_pipeline::run(handler, &command)
        }));

        let output = match outcome {
            Ok(o) => o,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                execd_db::append_event(
                    self.pool,
                    self.sink,
                    &command.id,
                    event_type::EXCEPTION,
                    command.attempt,
                    json!({ "code": codes::ACTION_EXCEPTION, "message": message }),
                )
                .await;
                return self
                    .persist_terminal(
                        &command,
                        false,
                        None,
                        Some(json!({ "code": codes::ACTION_EXCEPTION, "message": message })),
                    )
                    .await;
            }
        };

        if output.ok {
            execd_db::append_event(
                self.pool,
                self.sink,
                &command.id,
                event_type::ACTION_OK,
                command.attempt,
                json!({ "type": command.kind }),
            )
            .await;
            self.persist_terminal(&command, true, output.result, None)
                .await
        } else {
            execd_db::append_event(
                self.pool,
                self.sink,
                &command.id,
                event_type::ACTION_FAIL,
                command.attempt,
                output.error.clone().unwrap_or(json!({})),
            )
            .await;
            self.persist_terminal(&command, false, None, output.error)
                .await
        }
    }

    async fn gather_risk_inputs(&self, command: &execd_schemas::Command) -> execd_risk::RiskInputs {
        let consecutive = execd_db::count_consecutive_failures_today(self.pool)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "count_consecutive_failures_today failed, assuming 0");
                0
            });
        let override_clear = self
            .kill_switch
            .lockout_override_active()
            .await
            .unwrap_or(false);
        let _ = command;
        execd_risk::RiskInputs {
            // Always 0.0: this workspace has no realized-PnL ledger to derive
            // it from. See DESIGN.md Open Question 2.
            today_loss_pct: 0.0,
            consecutive_losses: consecutive,
            lockout_override_clear: override_clear,
        }
    }

    async fn fail(
        &self,
        command: &execd_schemas::Command,
        guard_event: &str,
        code: &str,
        message: String,
    ) -> Option<RunOutcome> {
        execd_db::append_event(
            self.pool,
            self.sink,
            &command.id,
            guard_event,
            command.attempt,
            json!({ "code": code, "message": message }),
        )
        .await;
        self.persist_terminal(command, false, None, Some(json!({ "code": code, "message": message })))
            .await
    }

    async fn persist_terminal(
        &self,
        command: &execd_schemas::Command,
        ok: bool,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Option<RunOutcome> {
        if ok {
            match execd_db::mark_done(self.pool, &command.id, result.unwrap_or(json!({}))).await {
                Ok(_) => {
                    execd_db::append_event(
                        self.pool,
                        self.sink,
                        &command.id,
                        event_type::MARK_DONE,
                        command.attempt,
                        json!({}),
                    )
                    .await;
                    Some(RunOutcome {
                        id: command.id.clone(),
                        kind: command.kind.clone(),
                        final_status: CommandStatus::Done,
                    })
                }
                Err(e) => self.persist_error(command, e).await,
            }
        } else {
            let reason = reason_string(&error);
            match execd_db::mark_failed(self.pool, &command.id, &reason).await {
                Ok(_) => {
                    execd_db::append_event(
                        self.pool,
                        self.sink,
                        &command.id,
                        event_type::MARK_FAILED,
                        command.attempt,
                        json!({ "reason": reason }),
                    )
                    .await;
                    Some(RunOutcome {
                        id: command.id.clone(),
                        kind: command.kind.clone(),
                        final_status: CommandStatus::Failed,
                    })
                }
                Err(e) => self.persist_error(command, e).await,
            }
        }
    }

    async fn persist_error(
        &self,
        command: &execd_schemas::Command,
        e: anyhow::Error,
    ) -> Option<RunOutcome> {
        tracing::error!(error = %e, command_id = %command.id, "terminal write failed");
        execd_db::append_event(
            self.pool,
            self.sink,
            &command.id,
            event_type::EXCEPTION,
            command.attempt,
            json!({ "code": codes::RUNNER_PERSIST_ERROR, "message": e.to_string() }),
        )
        .await;
        // Best-effort only; if this also fails there is nothing further to do
        // without risking an infinite retry loop in the runner itself.
        let _ = execd_db::mark_failed(self.pool, &command.id, codes::RUNNER_PERSIST_ERROR).await;
        Some(RunOutcome {
            id: command.id.clone(),
            kind: command.kind.clone(),
            final_status: CommandStatus::Failed,
        })
    }
}

fn reason_string(error: &Option<Value>) -> String {
    match error {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v.to_string(),
        None => "unknown error".to_string(),
    }
}
