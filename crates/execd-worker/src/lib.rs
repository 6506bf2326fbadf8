//! The poll loop: one coroutine per worker process, owning the heartbeat,
//! the kill-switch gate, and the self-tripping panic guard. Business logic
//! for a single command lives in `execd-runner`; this crate only decides
//! *when* to call it.

use chrono::Utc;
use execd_config::Config;
use execd_db::NotifySink;
use execd_ops::KillSwitch;
use execd_policy::Policy;
use execd_registry::Registry;
use execd_runner::{RunOutcome, Runner};
use execd_schemas::{event_type, SYNTHETIC_WORKER_HEARTBEAT};
use futures_util::future::FutureExt;
use serde_json::json;
use sqlx::PgPool;
use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What one call to [`WorkerLoop::tick`] did, for logging/tests.
#[derive(Debug)]
pub enum TickOutcome {
    Ran(RunOutcome),
    Idle,
    KillSwitchGated,
}

pub struct WorkerLoop<'a> {
    pool: &'a PgPool,
    sink: &'a dyn NotifySink,
    registry: &'a Registry,
    policies: &'a [Box<dyn Policy>],
    config: &'a Config,
    kill_switch: &'a KillSwitch,
    worker_id: String,
    running: Arc<AtomicBool>,
    last_heartbeat_at: Option<Instant>,
    last_kill_switch_check_at: Option<Instant>,
    kill_switch_seen: HashSet<String>,
    panic_window: VecDeque<Instant>,
}

impl<'a> WorkerLoop<'a> {
    pub fn new(
        pool: &'a PgPool,
        sink: &'a dyn NotifySink,
        registry: &'a Registry,
        policies: &'a [Box<dyn Policy>],
        config: &'a Config,
        kill_switch: &'a KillSwitch,
        worker_id: impl Into<String>,
    ) -> Self {
        WorkerLoop {
            pool,
            sink,
            registry,
            policies,
            config,
            kill_switch,
            worker_id: worker_id.into(),
            running: Arc::new(AtomicBool::new(true)),
            last_heartbeat_at: None,
            last_kill_switch_check_at: None,
            kill_switch_seen: HashSet::new(),
            panic_window: VecDeque::new(),
        }
    }

    /// Clone of the stop flag. Set it to `false` to have [`Self::run`]
    /// exit after its current iteration.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run until the stop flag is cleared.
    pub async fn run(&mut self) {
        while self.running.load(Ordering::Relaxed) {
            let outcome = AssertUnwindSafe(self.tick()).catch_unwind().await;
            match outcome {
                Ok(TickOutcome::Ran(_)) => {}
                Ok(TickOutcome::Idle) => {
                    tokio::time::sleep(Duration::from_secs(self.config.worker_poll_interval_sec))
                        .await;
                }
                Ok(TickOutcome::KillSwitchGated) => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    tracing::error!(worker_id = %self.worker_id, %message, "worker tick panicked");
                    if self.record_panic_and_check_trip().await {
                        tokio::time::sleep(Duration::from_secs(
                            self.config.worker_panic_cooldown_seconds,
                        ))
                        .await;
                    }
                }
            }
        }
    }

    /// One iteration: fault injection, heartbeat, kill-switch gate, then at
    /// most one claimed command.
    async fn tick(&mut self) -> TickOutcome {
        if self.config.worker_inject_panic {
            panic!("WORKER_INJECT_PANIC=1 fault injection");
        }

        self.maybe_heartbeat().await;

        if self.kill_switch_gate().await {
            return TickOutcome::KillSwitchGated;
        }

        let runner = Runner {
            pool: self.pool,
            sink: self.sink,
            registry: self.registry,
            policies: self.policies,
            config: self.config,
            kill_switch: self.kill_switch,
        };

        match runner.run_one(&self.worker_id).await {
            Some(outcome) => TickOutcome::Ran(outcome),
            None => TickOutcome::Idle,
        }
    }

    async fn maybe_heartbeat(&mut self) {
        let due = match self.last_heartbeat_at {
            Some(t) => t.elapsed() >= Duration::from_secs(self.config.worker_heartbeat_seconds),
            None => true,
        };
        if !due {
            return;
        }
        self.last_heartbeat_at = Some(Instant::now());

        let payload = json!({ "worker_id": self.worker_id, "ts": Utc::now().to_rfc3339() });
        if let Err(e) =
            execd_db::upsert_ops_state(self.pool, "worker_heartbeat", payload.clone()).await
        {
            tracing::warn!(error = %e, "heartbeat upsert failed");
        }
        execd_db::append_event(
            self.pool,
            self.sink,
            SYNTHETIC_WORKER_HEARTBEAT,
            event_type::WORKER_HEARTBEAT,
            0,
            payload,
        )
        .await;
    }

    /// Returns true if the gate is active (kill-switch on) and the caller
    /// should skip claiming this iteration.
    async fn kill_switch_gate(&mut self) -> bool {
        let due = match self.last_kill_switch_check_at {
            Some(t) => {
                t.elapsed() >= Duration::from_secs(self.config.pending_check_interval_sec)
            }
            None => true,
        };

        let state = match self.kill_switch.read(self.config).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "kill switch read failed, treating as off");
                return false;
            }
        };
        if !state.enabled {
            return false;
        }
        if !due {
            return true;
        }
        self.last_kill_switch_check_at = Some(Instant::now());

        if let Ok(Some(pending_id)) = execd_db::oldest_pending_id(self.pool).await {
            self.kill_switch
                .emit_kill_switch_on_once(self.pool, self.sink, &mut self.kill_switch_seen, &pending_id)
                .await;
        }
        true
    }

    /// Records a failed tick in the sliding window; if the threshold is
    /// reached, trips the guard (event + ops_state + kill-switch on) and
    /// clears the window. Returns true iff it tripped.
    async fn record_panic_and_check_trip(&mut self) -> bool {
        let tripped = slide_and_check(
            &mut self.panic_window,
            Instant::now(),
            Duration::from_secs(self.config.worker_panic_window_seconds),
            self.config.worker_panic_threshold as usize,
        );
        if !tripped {
            return false;
        }

        tracing::error!(worker_id = %self.worker_id, "worker panic guard tripped");
        let payload = json!({
            "worker_id": self.worker_id,
            "count": self.panic_window.len(),
            "window_seconds": self.config.worker_panic_window_seconds,
        });
        if let Err(e) = execd_db::upsert_ops_state(self.pool, "worker_panic", payload.clone()).await
        {
            tracing::warn!(error = %e, "worker_panic ops_state upsert failed");
        }
        execd_db::append_event(
            self.pool,
            self.sink,
            execd_schemas::SYNTHETIC_OPS_WORKER,
            event_type::WORKER_PANIC,
            0,
            payload,
        )
        .await;
        if let Err(e) = self.kill_switch.set(self.pool, self.sink, true, None).await {
            tracing::warn!(error = %e, "kill switch set failed during panic trip");
        }

        self.panic_window.clear();
        true
    }
}

/// Push `now` into the window, drop entries older than `window`, and report
/// whether the count has reached `threshold`. Pulled out of
/// [`WorkerLoop::record_panic_and_check_trip`] so the trip condition is
/// testable without a database.
fn slide_and_check(
    window: &mut VecDeque<Instant>,
    now: Instant,
    window_duration: Duration,
    threshold: usize,
) -> bool {
    window.push_back(now);
    while let Some(front) = window.front() {
        if now.duration_since(*front) > window_duration {
            window.pop_front();
        } else {
            break;
        }
    }
    window.len() >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_once_threshold_reached_within_window() {
        let mut window = VecDeque::new();
        let t0 = Instant::now();
        let dur = Duration::from_secs(60);
        assert!(!slide_and_check(&mut window, t0, dur, 3));
        assert!(!slide_and_check(&mut window, t0 + Duration::from_secs(1), dur, 3));
        assert!(slide_and_check(&mut window, t0 + Duration::from_secs(2), dur, 3));
    }

    #[test]
    fn entries_outside_window_are_dropped() {
        let mut window = VecDeque::new();
        let t0 = Instant::now();
        let dur = Duration::from_secs(10);
        assert!(!slide_and_check(&mut window, t0, dur, 2));
        // Far enough past t0 that it falls out of the window by the time
        // the second failure lands, so the threshold is never reached.
        assert!(!slide_and_check(&mut window, t0 + Duration::from_secs(20), dur, 2));
        assert_eq!(window.len(), 1);
    }
}
