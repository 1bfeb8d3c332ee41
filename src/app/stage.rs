use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::app::error::AppError;
use crate::app::models::{clamp_score, StageKind};

pub const STAGE_TIMEOUT_DETAIL: &str = "stage timeout";

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub succeeded: bool,
    pub score: f64,
    pub detail: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl StageOutcome {
    pub fn success(detail: impl Into<String>) -> Self {
        Self::scored(true, 100.0, detail)
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self::scored(false, 0.0, detail)
    }

    pub fn scored(succeeded: bool, score: f64, detail: impl Into<String>) -> Self {
        Self {
            succeeded,
            score: clamp_score(score),
            detail: detail.into(),
            duration: Duration::ZERO,
            timed_out: false,
        }
    }
}

type StageAction = Box<dyn FnOnce() -> Result<StageOutcome, AppError> + Send + 'static>;

/// A named unit of work bounded by a timeout. Built fresh for every run.
pub struct Stage {
    pub kind: StageKind,
    pub timeout: Duration,
    action: StageAction,
}

impl Stage {
    pub fn new<F>(kind: StageKind, timeout: Duration, action: F) -> Self
    where
        F: FnOnce() -> Result<StageOutcome, AppError> + Send + 'static,
    {
        Self {
            kind,
            timeout,
            action: Box::new(action),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "stage panicked".to_string()
}

pub struct StageExecutor {
    trace_id: String,
}

impl StageExecutor {
    pub fn new(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }

    /// Runs the action on its own thread. Errors and panics become failed
    /// outcomes; an action still running at the deadline is abandoned.
    pub fn execute(&self, stage: Stage) -> StageOutcome {
        let Stage {
            kind,
            timeout,
            action,
        } = stage;
        let started = Instant::now();
        info!(trace_id = %self.trace_id, stage = kind.name(), timeout_secs = timeout.as_secs(), "stage started");

        let (tx, rx) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name(format!("stage-{}", kind.name().to_lowercase()))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(action));
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            return StageOutcome::failure(format!("failed to start stage thread: {err}"));
        }

        let mut outcome = match rx.recv_timeout(timeout) {
            Ok(Ok(Ok(outcome))) => outcome,
            Ok(Ok(Err(err))) => StageOutcome::failure(err.to_string()),
            Ok(Err(payload)) => StageOutcome::failure(panic_message(payload)),
            Err(RecvTimeoutError::Timeout) => {
                let mut outcome = StageOutcome::failure(STAGE_TIMEOUT_DETAIL);
                outcome.timed_out = true;
                outcome
            }
            Err(RecvTimeoutError::Disconnected) => {
                StageOutcome::failure("stage ended without an outcome")
            }
        };
        outcome.duration = started.elapsed();

        if outcome.succeeded {
            info!(
                trace_id = %self.trace_id,
                stage = kind.name(),
                elapsed_ms = outcome.duration.as_millis() as u64,
                score = outcome.score,
                "stage passed"
            );
        } else {
            warn!(
                trace_id = %self.trace_id,
                stage = kind.name(),
                elapsed_ms = outcome.duration.as_millis() as u64,
                detail = %outcome.detail,
                "stage failed"
            );
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> StageExecutor {
        StageExecutor::new("trace-stage")
    }

    #[test]
    fn returns_action_outcome() {
        let outcome = executor().execute(Stage::new(StageKind::Install, Duration::from_secs(5), || {
            Ok(StageOutcome::scored(true, 87.5, "installed"))
        }));
        assert!(outcome.succeeded);
        assert_eq!(outcome.score, 87.5);
        assert_eq!(outcome.detail, "installed");
        assert!(!outcome.timed_out);
    }

    #[test]
    fn error_becomes_failed_outcome() {
        let outcome = executor().execute(Stage::new(StageKind::Launch, Duration::from_secs(5), || {
            Err(AppError::command_failure("Error: Activity class does not exist", "trace-stage"))
        }));
        assert!(!outcome.succeeded);
        assert!(outcome.detail.contains("Activity class does not exist"));
        assert!(outcome.detail.contains("ERR_COMMAND"));
    }

    #[test]
    fn panic_becomes_failed_outcome() {
        let outcome = executor().execute(Stage::new(StageKind::Build, Duration::from_secs(5), || {
            panic!("build script exploded")
        }));
        assert!(!outcome.succeeded);
        assert_eq!(outcome.detail, "build script exploded");
    }

    #[test]
    fn slow_action_times_out() {
        let outcome = executor().execute(Stage::new(
            StageKind::RunChecks,
            Duration::from_millis(50),
            || {
                thread::sleep(Duration::from_secs(2));
                Ok(StageOutcome::success("too late"))
            },
        ));
        assert!(!outcome.succeeded);
        assert!(outcome.timed_out);
        assert_eq!(outcome.detail, STAGE_TIMEOUT_DETAIL);
        assert!(outcome.duration < Duration::from_secs(2));
    }

    #[test]
    fn scores_are_clamped() {
        assert_eq!(StageOutcome::scored(true, 140.0, "").score, 100.0);
    }
}
