//! Step Tasks
//!
//! A [`StepTask`] is the unit of work the scheduler spawns for one step. It
//! runs the retry loop around the [`StepInvoker`], consults the circuit
//! breakers before every call, and reports attempt progress back to the
//! scheduler, which alone applies state transitions.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::RunId;
use super::step::{InvocationContext, Interrupted, StepInvoker, StepOutcome};
use crate::error::StepError;
use crate::policy::{CircuitBreakers, RetryDecision};
use crate::service::CallerContext;
use crate::workflow::WorkflowGraph;

/// Attempt-level progress reported while a task runs.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    AttemptStarted {
        position: usize,
        attempt: u32,
    },
    /// A failed attempt that will be retried after `retry_in`.
    AttemptFailed {
        position: usize,
        attempt: u32,
        error: StepError,
        retry_in: Duration,
    },
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded { attempt: u32, output: Value },
    /// The retry policy gave up; `error` is the final failure.
    GaveUp { attempt: u32, error: StepError },
    /// Cancelled mid-call or during backoff.
    Interrupted { attempt: u32 },
}

/// Everything one step needs to run independently of the scheduler.
pub struct StepTask {
    pub position: usize,
    pub graph: Arc<WorkflowGraph>,
    pub input: Value,
    pub invoker: StepInvoker,
    pub breakers: Arc<CircuitBreakers>,
    pub deadline: Option<Instant>,
    pub run_id: RunId,
    pub caller: Arc<CallerContext>,
    pub cancel: CancellationToken,
    pub progress: mpsc::UnboundedSender<Progress>,
}

impl StepTask {
    /// Runs attempts until success, give-up or cancellation.
    pub async fn run(self) -> (usize, TaskOutcome) {
        let outcome = self.attempts().await;
        (self.position, outcome)
    }

    async fn attempts(&self) -> TaskOutcome {
        let step = &self.graph.steps()[self.position];
        let mut failures: Vec<StepError> = Vec::new();

        loop {
            let attempt = failures.len() as u32 + 1;

            // A closed channel means the scheduler has stopped driving the run.
            if self
                .progress
                .send(Progress::AttemptStarted {
                    position: self.position,
                    attempt,
                })
                .is_err()
            {
                return TaskOutcome::Interrupted { attempt };
            }

            // The permit is held across the call; dropping it unreported,
            // including when this task is aborted, releases a trial slot.
            let error = match self.breakers.acquire(&step.endpoint) {
                None => {
                    debug!(
                        "Step '{}' attempt {} short-circuited: endpoint '{}' is open",
                        step.id, attempt, step.endpoint
                    );
                    StepError::CircuitOpen {
                        endpoint: step.endpoint.clone(),
                    }
                }
                Some(permit) => {
                    let call = InvocationContext {
                        run_id: self.run_id,
                        attempt,
                        caller: self.caller.clone(),
                        cancel: self.cancel.child_token(),
                    };

                    match self
                        .invoker
                        .invoke(step, self.input.clone(), self.deadline, call)
                        .await
                    {
                        Err(Interrupted) => return TaskOutcome::Interrupted { attempt },
                        Ok(StepOutcome::Success(output)) => {
                            permit.success();
                            return TaskOutcome::Succeeded { attempt, output };
                        }
                        Ok(StepOutcome::RemoteFailure { kind, detail }) => {
                            permit.failure();
                            StepError::Remote { kind, detail }
                        }
                        Ok(StepOutcome::Unreachable(detail)) => {
                            permit.failure();
                            StepError::Unreachable { detail }
                        }
                        Ok(StepOutcome::DeadlineExceeded(detail)) => {
                            // No time left to retry; the endpoint is not charged.
                            return TaskOutcome::GaveUp {
                                attempt,
                                error: StepError::Unreachable { detail },
                            };
                        }
                    }
                }
            };

            failures.push(error.clone());
            match step.retry.decide(&failures) {
                RetryDecision::GiveUp(error) => {
                    return TaskOutcome::GaveUp { attempt, error };
                }
                RetryDecision::Retry(delay) => {
                    info!(
                        "Step '{}' attempt {} failed ({}), retrying in {}ms",
                        step.id,
                        attempt,
                        error,
                        delay.as_millis()
                    );
                    let _ = self.progress.send(Progress::AttemptFailed {
                        position: self.position,
                        attempt,
                        error,
                        retry_in: delay,
                    });

                    tokio::select! {
                        _ = self.cancel.cancelled() => return TaskOutcome::Interrupted { attempt },
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{CircuitConfig, CircuitStatus, RetryPolicy};
    use crate::service::{service_fn, ServiceError, ServiceRegistry};
    use crate::workflow::Step;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Harness {
        task: StepTask,
        progress: mpsc::UnboundedReceiver<Progress>,
        calls: Arc<AtomicU32>,
    }

    /// Service that fails the first `failures` calls, then echoes "ok".
    fn harness(step: Step, failures: u32, breakers: Arc<CircuitBreakers>) -> Harness {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = ServiceRegistry::new()
            .with(
                "svc",
                service_fn(move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        if n <= failures {
                            Err(ServiceError::unreachable("connection refused"))
                        } else {
                            Ok(json!("ok"))
                        }
                    }
                }),
            )
            .with(
                "slow",
                service_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }),
            );

        let (tx, rx) = mpsc::unbounded_channel();
        let task = StepTask {
            position: 0,
            graph: Arc::new(WorkflowGraph::new("t", vec![step])),
            input: json!({}),
            invoker: StepInvoker::new(Arc::new(registry)),
            breakers,
            deadline: None,
            run_id: RunId::new(),
            caller: Arc::default(),
            cancel: CancellationToken::new(),
            progress: tx,
        };

        Harness {
            task,
            progress: rx,
            calls,
        }
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Progress>) -> Vec<Progress> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let mut h = harness(Step::new("s", "svc"), 0, Arc::default());
        let (position, outcome) = h.task.run().await;

        assert_eq!(position, 0);
        assert_eq!(
            outcome,
            TaskOutcome::Succeeded {
                attempt: 1,
                output: json!("ok")
            }
        );
        assert_eq!(
            drain(&mut h.progress),
            vec![Progress::AttemptStarted {
                position: 0,
                attempt: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_recovers_after_retries() {
        let step = Step::new("s", "svc").with_retry(fast_retry(3));
        let mut h = harness(step, 2, Arc::default());
        let (_, outcome) = h.task.run().await;

        assert!(matches!(outcome, TaskOutcome::Succeeded { attempt: 3, .. }));
        assert_eq!(h.calls.load(Ordering::SeqCst), 3);

        let failed = drain(&mut h.progress)
            .into_iter()
            .filter(|p| matches!(p, Progress::AttemptFailed { .. }))
            .count();
        assert_eq!(failed, 2);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let step = Step::new("s", "svc").with_retry(fast_retry(4));
        let mut h = harness(step, u32::MAX, Arc::default());
        let (_, outcome) = h.task.run().await;

        assert!(matches!(
            outcome,
            TaskOutcome::GaveUp {
                attempt: 4,
                error: StepError::Unreachable { .. }
            }
        ));
        assert_eq!(h.calls.load(Ordering::SeqCst), 4);

        let progress = drain(&mut h.progress);
        let started = progress
            .iter()
            .filter(|p| matches!(p, Progress::AttemptStarted { .. }))
            .count();
        let retried = progress
            .iter()
            .filter(|p| matches!(p, Progress::AttemptFailed { .. }))
            .count();
        assert_eq!(started, 4);
        // the final failure is reported through the outcome, not progress
        assert_eq!(retried, 3);
    }

    #[tokio::test]
    async fn test_open_circuit_makes_no_call() {
        let breakers = Arc::new(CircuitBreakers::new(CircuitConfig::default()));
        for _ in 0..5 {
            breakers.record_failure("svc");
        }
        assert_eq!(breakers.status("svc"), CircuitStatus::Open);

        let step = Step::new("s", "svc").with_retry(fast_retry(3));
        let h = harness(step, 0, breakers);
        let (_, outcome) = h.task.run().await;

        assert!(matches!(
            outcome,
            TaskOutcome::GaveUp {
                attempt: 1,
                error: StepError::CircuitOpen { .. }
            }
        ));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let retry = RetryPolicy::default()
            .with_max_attempts(5)
            .with_backoff(Duration::from_secs(10), Duration::from_secs(10));
        let h = harness(Step::new("s", "svc").with_retry(retry), u32::MAX, Arc::default());
        let token = h.task.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        });

        let started = Instant::now();
        let (_, outcome) = h.task.run().await;
        assert_eq!(outcome, TaskOutcome::Interrupted { attempt: 1 });
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_run_deadline_does_not_charge_endpoint() {
        let config = CircuitConfig {
            minimum_calls: 1,
            ..CircuitConfig::default()
        };
        let breakers = Arc::new(CircuitBreakers::new(config));
        let step = Step::new("s", "slow").with_retry(fast_retry(3));
        let mut h = harness(step, 0, breakers.clone());
        h.task.deadline = Some(Instant::now() + Duration::from_millis(30));

        let (_, outcome) = h.task.run().await;
        assert!(matches!(
            outcome,
            TaskOutcome::GaveUp {
                attempt: 1,
                error: StepError::Unreachable { .. }
            }
        ));
        assert_eq!(breakers.status("slow"), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_aborted_trial_releases_slot() {
        let config = CircuitConfig {
            cool_down_ms: 20,
            ..CircuitConfig::default()
        };
        let breakers = Arc::new(CircuitBreakers::new(config));
        for _ in 0..5 {
            breakers.record_failure("slow");
        }
        tokio::time::sleep(Duration::from_millis(40)).await;

        let h = harness(Step::new("s", "slow"), 0, breakers.clone());
        let handle = tokio::spawn(h.task.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(breakers.acquire("slow").is_none());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert_eq!(breakers.status("slow"), CircuitStatus::HalfOpen);
        let permit = breakers.acquire("slow").unwrap();
        assert!(permit.is_trial());
    }

    #[tokio::test]
    async fn test_stops_when_scheduler_gone() {
        let h = harness(Step::new("s", "svc"), 0, Arc::default());
        drop(h.progress);
        let (_, outcome) = h.task.run().await;
        assert_eq!(outcome, TaskOutcome::Interrupted { attempt: 1 });
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }
}
