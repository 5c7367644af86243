//! Individual Step Invocation
//!
//! Performs exactly one call of a step against its service endpoint:
//! - Service lookup in the registry
//! - Effective timeout (earlier of step timeout and run deadline)
//! - Cooperative cancellation through the invocation's token
//!
//! Retrying is layered on top by the step task; the invoker never retries.

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::StepError;
use crate::execution::context::RunId;
use crate::service::{CallerContext, ServiceError, ServiceRegistry, ServiceRequest};
use crate::workflow::Step;

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    /// The service answered with an error.
    RemoteFailure { kind: String, detail: String },
    /// Connection failure, step timeout, or no such endpoint.
    Unreachable(String),
    /// The run's deadline cut the call short. Says nothing about the
    /// endpoint's health.
    DeadlineExceeded(String),
}

impl StepOutcome {
    /// The error for a failed outcome, `None` on success.
    pub fn error(&self) -> Option<StepError> {
        match self {
            Self::Success(_) => None,
            Self::RemoteFailure { kind, detail } => Some(StepError::remote(kind.clone(), detail.clone())),
            Self::Unreachable(detail) | Self::DeadlineExceeded(detail) => {
                Some(StepError::unreachable(detail.clone()))
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<Result<Value, ServiceError>> for StepOutcome {
    fn from(result: Result<Value, ServiceError>) -> Self {
        match result {
            Ok(output) => Self::Success(output),
            Err(ServiceError::Remote { kind, detail }) => Self::RemoteFailure { kind, detail },
            Err(ServiceError::Unreachable(detail)) => Self::Unreachable(detail),
        }
    }
}

/// The invocation was cancelled before the service answered.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invocation interrupted by cancellation")]
pub struct Interrupted;

/// Per-call metadata passed from the scheduler.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub run_id: RunId,
    pub attempt: u32,
    pub caller: Arc<CallerContext>,
    pub cancel: CancellationToken,
}

/// Calls step endpoints through a [`ServiceRegistry`].
#[derive(Debug, Clone)]
pub struct StepInvoker {
    registry: Arc<ServiceRegistry>,
}

impl StepInvoker {
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Invokes `step` once with an already resolved `input`.
    ///
    /// Returns `Err(Interrupted)` only when `call.cancel` fires first. An
    /// elapsed step timeout is an `Unreachable` outcome; running into the
    /// run deadline is `DeadlineExceeded`.
    pub async fn invoke(
        &self,
        step: &Step,
        input: Value,
        deadline: Option<Instant>,
        call: InvocationContext,
    ) -> Result<StepOutcome, Interrupted> {
        let Some(service) = self.registry.get(&step.endpoint) else {
            warn!(
                "Step '{}' has no service registered for endpoint '{}'",
                step.id, step.endpoint
            );
            return Ok(StepOutcome::Unreachable(format!(
                "no service registered for endpoint '{}'",
                step.endpoint
            )));
        };

        let now = Instant::now();
        let step_deadline = now + step.timeout();
        let (effective, run_bound) = match deadline {
            Some(run_deadline) if run_deadline <= step_deadline => (run_deadline, true),
            _ => (step_deadline, false),
        };
        let timeout = effective.saturating_duration_since(now);

        debug!(
            "Invoking step '{}' (attempt {}) on '{}' with {}ms timeout",
            step.id,
            call.attempt,
            step.endpoint,
            timeout.as_millis()
        );

        let request = ServiceRequest {
            run_id: call.run_id,
            step_id: step.id.clone(),
            attempt: call.attempt,
            payload: input,
            caller: call.caller,
            timeout,
        };

        tokio::select! {
            biased;
            _ = call.cancel.cancelled() => {
                debug!("Step '{}' attempt {} interrupted", step.id, call.attempt);
                Err(Interrupted)
            }
            result = tokio::time::timeout_at(effective, service.call(request)) => match result {
                Ok(result) => Ok(StepOutcome::from(result)),
                Err(_) if run_bound => Ok(StepOutcome::DeadlineExceeded(format!(
                    "run deadline reached after {}ms",
                    timeout.as_millis()
                ))),
                Err(_) => Ok(StepOutcome::Unreachable(format!(
                    "timed out after {}ms",
                    timeout.as_millis()
                ))),
            },
        }
    }
}
