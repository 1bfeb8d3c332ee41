use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::error::AppError;

/// Source of time for every wait in the pipeline: boot polling, settle delays,
/// sampling windows.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

pub enum PollStep<T> {
    Ready(T),
    Pending,
    Abort(AppError),
}

#[derive(Debug)]
pub enum PollOutcome<T> {
    Ready { value: T, elapsed: Duration, attempts: u32 },
    TimedOut { elapsed: Duration, attempts: u32 },
    Failed { error: AppError, elapsed: Duration },
}

/// Calls `probe` every `interval` until it reports ready, aborts, or `timeout`
/// elapses. The probe receives the 1-based attempt number.
pub fn poll_until<T, F>(clock: &dyn Clock, interval: Duration, timeout: Duration, mut probe: F) -> PollOutcome<T>
where
    F: FnMut(u32) -> PollStep<T>,
{
    let start = clock.now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match probe(attempts) {
            PollStep::Ready(value) => {
                return PollOutcome::Ready {
                    value,
                    elapsed: clock.now().saturating_duration_since(start),
                    attempts,
                };
            }
            PollStep::Abort(error) => {
                return PollOutcome::Failed {
                    error,
                    elapsed: clock.now().saturating_duration_since(start),
                };
            }
            PollStep::Pending => {}
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed >= timeout {
            return PollOutcome::TimedOut { elapsed, attempts };
        }
        debug!(
            attempt = attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            timeout_ms = timeout.as_millis() as u64,
            "poll pending"
        );
        clock.sleep(interval.min(timeout - elapsed));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::FakeClock;

    #[test]
    fn returns_ready_at_first_satisfied_attempt() {
        let clock = FakeClock::new();
        let probe_clock = clock.clone();
        let outcome = poll_until(&clock, Duration::from_secs(2), Duration::from_secs(120), |_| {
            if probe_clock.elapsed() >= Duration::from_secs(40) {
                PollStep::Ready("online")
            } else {
                PollStep::Pending
            }
        });
        match outcome {
            PollOutcome::Ready { value, elapsed, attempts } => {
                assert_eq!(value, "online");
                assert_eq!(elapsed, Duration::from_secs(40));
                assert_eq!(attempts, 21);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn times_out_without_overshooting_deadline() {
        let clock = FakeClock::new();
        let outcome: PollOutcome<()> =
            poll_until(&clock, Duration::from_secs(2), Duration::from_secs(5), |_| PollStep::Pending);
        match outcome {
            PollOutcome::TimedOut { elapsed, attempts } => {
                assert_eq!(elapsed, Duration::from_secs(5));
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn abort_stops_polling_immediately() {
        let clock = FakeClock::new();
        let outcome: PollOutcome<()> =
            poll_until(&clock, Duration::from_secs(2), Duration::from_secs(120), |attempt| {
                if attempt == 3 {
                    PollStep::Abort(AppError::system("process exited", "trace"))
                } else {
                    PollStep::Pending
                }
            });
        match outcome {
            PollOutcome::Failed { error, elapsed } => {
                assert_eq!(error.error, "process exited");
                assert_eq!(elapsed, Duration::from_secs(4));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
