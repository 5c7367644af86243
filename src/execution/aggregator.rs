//! Result Aggregation
//!
//! Turns a finished [`ExecutionContext`] into a [`WorkflowResult`]:
//! - Step results in declaration order, not completion order
//! - Overall status from step states and the run's termination
//! - Aggregated output built with the workflow's [`MergeRule`]
//!
//! Aggregation reads nothing but the context and the graph, so running it
//! twice on the same context yields identical results.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::context::{ExecutionContext, RunId, StepState, Termination};
use crate::error::{InvariantError, StepError};
use crate::monitoring::events::StepEvent;
use crate::workflow::model::{MergeRule, WorkflowGraph};

/// Overall outcome of a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Every required step succeeded; optional steps succeeded or were skipped.
    Succeeded,
    /// Every required step that ran succeeded, but some output is missing.
    PartialSuccess,
    /// A required step gave up.
    Failed,
    Cancelled,
    TimedOut,
    /// The engine broke one of its own invariants.
    Faulted,
}

impl WorkflowStatus {
    /// Whether the aggregated output can be used.
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded | Self::PartialSuccess)
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Succeeded => "succeeded",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Final state of one step.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub id: String,
    pub endpoint: String,
    pub status: StepState,
    pub optional: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl StepResult {
    /// Only succeeded steps carry an output consumers can rely on.
    pub fn is_trustworthy(&self) -> bool {
        self.status == StepState::Succeeded
    }
}

/// Everything a caller learns about a finished run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowResult {
    pub run_id: RunId,
    pub workflow_id: String,
    pub version: String,
    pub status: WorkflowStatus,
    pub steps: Vec<StepResult>,
    /// Merged output; `null` unless the run succeeded at least partially.
    pub output: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<InvariantError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub events: Vec<StepEvent>,
}

impl WorkflowResult {
    pub fn step(&self, id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Ids of steps whose outputs can be relied on.
    pub fn trustworthy(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.is_trustworthy())
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Ids of steps that produced no output.
    pub fn missing(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| !s.is_trustworthy())
            .map(|s| s.id.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

fn duration_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    Some((end? - start?).num_milliseconds())
}

fn completed_status(ctx: &ExecutionContext, graph: &WorkflowGraph) -> WorkflowStatus {
    let mut degraded = false;

    for step in graph.steps() {
        let state = ctx.state(&step.id).unwrap_or(StepState::Pending);
        match (step.optional, state) {
            // a required step only ends Cancelled after some required failure
            (false, StepState::Failed | StepState::Cancelled) => return WorkflowStatus::Failed,
            (false, StepState::Skipped) => degraded = true,
            (true, StepState::Failed | StepState::Cancelled) => degraded = true,
            _ => {}
        }
    }

    if degraded {
        WorkflowStatus::PartialSuccess
    } else {
        WorkflowStatus::Succeeded
    }
}

fn merge(rule: &MergeRule, ctx: &ExecutionContext, graph: &WorkflowGraph) -> Value {
    let outputs = ctx.outputs();
    match rule {
        MergeRule::LastStep => graph
            .steps()
            .last()
            .and_then(|step| outputs.get(&step.id))
            .cloned()
            .unwrap_or(Value::Null),
        MergeRule::Step { id } => outputs.get(id).cloned().unwrap_or(Value::Null),
        MergeRule::Steps { ids } => {
            let merged: Map<String, Value> = ids
                .iter()
                .filter_map(|id| outputs.get(id).map(|v| (id.clone(), v.clone())))
                .collect();
            Value::Object(merged)
        }
    }
}

/// Builds the result of a finished run.
///
/// Fails with [`InvariantError::NotTerminal`] if the run is still going.
pub fn aggregate(ctx: &ExecutionContext, graph: &WorkflowGraph) -> Result<WorkflowResult, InvariantError> {
    let termination = ctx.termination().ok_or_else(|| InvariantError::NotTerminal {
        run_id: ctx.run_id().to_string(),
    })?;

    let (status, fault) = match termination {
        Termination::Faulted(fault) => (WorkflowStatus::Faulted, Some(fault.clone())),
        Termination::TimedOut => (WorkflowStatus::TimedOut, None),
        Termination::Cancelled => (WorkflowStatus::Cancelled, None),
        Termination::Completed => (completed_status(ctx, graph), None),
    };

    let steps = graph
        .steps()
        .iter()
        .map(|step| {
            let record = ctx.record(&step.id);
            let started_at = record.and_then(|r| r.started_at);
            let finished_at = record.and_then(|r| r.finished_at);
            StepResult {
                id: step.id.clone(),
                endpoint: step.endpoint.clone(),
                status: record.map_or(StepState::Pending, |r| r.state),
                optional: step.optional,
                attempts: record.map_or(0, |r| r.attempts),
                output: ctx.outputs().get(&step.id).cloned(),
                error: ctx.errors().get(&step.id).cloned(),
                started_at,
                finished_at,
                duration_ms: duration_ms(started_at, finished_at),
            }
        })
        .collect();

    let output = if status.is_success() {
        merge(graph.merge(), ctx, graph)
    } else {
        Value::Null
    };

    Ok(WorkflowResult {
        run_id: ctx.run_id(),
        workflow_id: graph.id().to_string(),
        version: graph.version().to_string(),
        status,
        steps,
        output,
        fault,
        started_at: ctx.started_at(),
        finished_at: ctx.finished_at(),
        duration_ms: duration_ms(Some(ctx.started_at()), ctx.finished_at()),
        events: ctx.events().to_vec(),
    })
}
