//! Error Types
//!
//! The engine separates three families of failure:
//!
//! - [`GraphError`]: the submitted workflow is malformed. Always fatal to the
//!   submission, never retried.
//! - [`StepError`]: one step failed. Local to that step and governed by the
//!   retry/circuit policy before it can affect the run.
//! - [`InvariantError`]: the engine broke one of its own guarantees. Never
//!   swallowed; a run that hits one finalizes as `Faulted`.
//!
//! Submission-boundary and file-loading errors wrap these.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::context::{RunId, StepState};

/// Structural problems found while validating a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GraphError {
    #[error("duplicate step id '{step_id}'")]
    DuplicateStep { step_id: String },

    #[error("step id '{step_id}' is reserved for the workflow input")]
    ReservedStepId { step_id: String },

    #[error("step '{step_id}' depends on unknown step '{missing_dep}'")]
    UnknownDependency { step_id: String, missing_dep: String },

    #[error("dependency cycle between steps: {}", members.join(" -> "))]
    Cycle { members: Vec<String> },

    #[error("step '{step_id}' reads the output of '{source_step}' without depending on it")]
    UndeclaredInput { step_id: String, source_step: String },

    #[error("merge rule references unknown step '{step_id}'")]
    UnknownMergeStep { step_id: String },
}

/// Final failure record of a single step.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepError {
    /// The service answered, but with an error.
    #[error("remote failure ({kind}): {detail}")]
    Remote { kind: String, detail: String },

    /// The service could not be reached or did not answer in time.
    #[error("service unreachable: {detail}")]
    Unreachable { detail: String },

    /// The call was rejected locally because the endpoint's circuit is open.
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },
}

impl StepError {
    pub fn remote(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Remote {
            kind: kind.into(),
            detail: detail.into(),
        }
    }

    pub fn unreachable(detail: impl Into<String>) -> Self {
        Self::Unreachable {
            detail: detail.into(),
        }
    }
}

/// Violations of the engine's own ordering and lifecycle guarantees.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantError {
    #[error("step '{step_id}' needs the output of '{dependency}', which has not succeeded")]
    UnresolvedInput { step_id: String, dependency: String },

    #[error("run {run_id} has not reached a terminal state")]
    NotTerminal { run_id: String },

    #[error("illegal transition for step '{step_id}': {from} -> {to}")]
    IllegalTransition {
        step_id: String,
        from: StepState,
        to: StepState,
    },

    #[error("unknown step '{step_id}' in execution context")]
    UnknownStep { step_id: String },

    #[error("scheduler stalled with unsettled steps: {}", step_ids.join(", "))]
    Stalled { step_ids: Vec<String> },

    #[error("step task ended abnormally: {detail}")]
    TaskAborted { detail: String },
}

/// Errors returned at the submission boundary.
///
/// Run-level failures are never reported here; they come back as a
/// [`WorkflowResult`](crate::execution::aggregator::WorkflowResult).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    Graph(#[from] GraphError),

    #[error("concurrency budget must be at least 1")]
    ZeroConcurrency,

    #[error("unknown run {0}")]
    UnknownRun(RunId),

    #[error("engine invariant violated: {0}")]
    Invariant(#[from] InvariantError),
}

/// Errors raised while loading engine configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("service '{name}': {reason}")]
    InvalidService { name: String, reason: String },
}

/// Errors raised while loading a workflow definition from disk.
#[derive(Debug, Error)]
pub enum WorkflowLoadError {
    #[error("failed to read workflow '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid workflow YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Graph(#[from] GraphError),
}
