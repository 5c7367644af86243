//! Execution Context
//!
//! Per-run mutable state: step states, outputs, errors, the cancellation
//! signal and the event log. Exactly one scheduler owns a context for the
//! lifetime of its run; other parties only ever see [`RunSnapshot`]s.
//!
//! Step states form a lattice:
//!
//! ```text
//! Pending -> Running -> Succeeded
//!    |          |  \--> Failed --(retry)--> Running
//!    |          \-----> Cancelled
//!    \--> Skipped | Cancelled
//! ```
//!
//! A step is *settled* once it reaches a terminal state with no retry
//! pending; settled steps never change again.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{InvariantError, StepError};
use crate::monitoring::events::StepEvent;
use crate::service::CallerContext;
use crate::workflow::WorkflowGraph;

/// Identifier of one workflow run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a single step within a run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Whether the lattice permits moving from `self` to `next`.
    ///
    /// `Failed -> Running` is only legal for a step whose failed attempt is
    /// being retried; the context enforces that through the settled flag.
    pub fn can_transition_to(self, next: StepState) -> bool {
        use StepState::*;
        matches!(
            (self, next),
            (Pending, Running | Skipped | Cancelled)
                | (Running, Succeeded | Failed | Cancelled)
                | (Failed, Running | Cancelled)
        )
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Why the scheduler stopped driving a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Every step settled on its own.
    Completed,
    /// The run deadline elapsed first.
    TimedOut,
    /// The caller cancelled the run.
    Cancelled,
    /// The engine detected a violation of its own invariants.
    Faulted(InvariantError),
}

/// Bookkeeping for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    pub state: StepState,
    pub attempts: u32,
    pub settled: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    fn new() -> Self {
        Self {
            state: StepState::Pending,
            attempts: 0,
            settled: false,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Point-in-time view of one step, for status queries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSnapshot {
    pub id: String,
    pub state: StepState,
    pub attempts: u32,
    pub settled: bool,
}

/// Point-in-time view of a run, safe to hand to other tasks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub workflow_id: String,
    pub steps: Vec<StepSnapshot>,
    pub finished: bool,
    pub taken_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn state_of(&self, step_id: &str) -> Option<StepState> {
        self.steps.iter().find(|s| s.id == step_id).map(|s| s.state)
    }

    /// Number of steps currently in `state`.
    pub fn count(&self, state: StepState) -> usize {
        self.steps.iter().filter(|s| s.state == state).count()
    }
}

/// Mutable state of a single workflow run.
#[derive(Debug)]
pub struct ExecutionContext {
    run_id: RunId,
    workflow_id: String,
    input: Value,
    caller: Arc<CallerContext>,
    records: IndexMap<String, StepRecord>,
    outputs: HashMap<String, Value>,
    errors: HashMap<String, StepError>,
    events: Vec<StepEvent>,
    cancellation: CancellationToken,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    termination: Option<Termination>,
}

impl ExecutionContext {
    /// Creates a context with every step of `graph` Pending.
    pub fn new(
        run_id: RunId,
        graph: &WorkflowGraph,
        input: Value,
        caller: Arc<CallerContext>,
    ) -> Self {
        let records = graph
            .steps()
            .iter()
            .map(|step| (step.id.clone(), StepRecord::new()))
            .collect();

        Self {
            run_id,
            workflow_id: graph.id().to_string(),
            input,
            caller,
            records,
            outputs: HashMap::new(),
            errors: HashMap::new(),
            events: Vec::new(),
            cancellation: CancellationToken::new(),
            started_at: Utc::now(),
            finished_at: None,
            termination: None,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The original workflow input.
    pub fn input(&self) -> &Value {
        &self.input
    }

    pub fn caller(&self) -> &Arc<CallerContext> {
        &self.caller
    }

    /// Outputs of steps that succeeded.
    pub fn outputs(&self) -> &HashMap<String, Value> {
        &self.outputs
    }

    pub fn errors(&self) -> &HashMap<String, StepError> {
        &self.errors
    }

    pub fn events(&self) -> &[StepEvent] {
        &self.events
    }

    pub fn record(&self, step_id: &str) -> Option<&StepRecord> {
        self.records.get(step_id)
    }

    /// Record at the graph's arena position.
    pub fn record_at(&self, position: usize) -> Option<(&str, &StepRecord)> {
        self.records
            .get_index(position)
            .map(|(id, record)| (id.as_str(), record))
    }

    pub fn state(&self, step_id: &str) -> Option<StepState> {
        self.records.get(step_id).map(|r| r.state)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn termination(&self) -> Option<&Termination> {
        self.termination.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.termination.is_some()
    }

    /// Run-wide cancellation signal; invocations listen on child tokens.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_aborted(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Raises the abort flag, signalling every in-flight invocation.
    pub fn abort(&mut self) {
        self.cancellation.cancel();
    }

    /// Ids of steps that have not settled yet, in declaration order.
    pub fn unsettled(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|(_, r)| !r.settled)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn transition(
        &mut self,
        step_id: &str,
        to: StepState,
        attempt: Option<u32>,
        settle: bool,
    ) -> Result<StepEvent, InvariantError> {
        let record = self
            .records
            .get_mut(step_id)
            .ok_or_else(|| InvariantError::UnknownStep {
                step_id: step_id.to_string(),
            })?;

        let from = record.state;
        if record.settled || !from.can_transition_to(to) {
            return Err(InvariantError::IllegalTransition {
                step_id: step_id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        if let Some(attempt) = attempt {
            record.attempts = attempt;
        }
        if to == StepState::Running && record.started_at.is_none() {
            record.started_at = Some(now);
        }
        if settle {
            record.settled = true;
            record.finished_at = Some(now);
        }
        record.state = to;

        let event = StepEvent {
            seq: self.events.len() as u64 + 1,
            run_id: self.run_id,
            step_id: step_id.to_string(),
            from,
            to,
            attempt: record.attempts,
            timestamp: now,
        };
        self.events.push(event.clone());
        Ok(event)
    }

    /// Moves a step to Running for `attempt` (first launch or retry).
    pub fn start_attempt(&mut self, step_id: &str, attempt: u32) -> Result<StepEvent, InvariantError> {
        self.transition(step_id, StepState::Running, Some(attempt), false)
    }

    /// Records a failed attempt. With `retrying` the step stays unsettled.
    pub fn fail_attempt(
        &mut self,
        step_id: &str,
        error: StepError,
        retrying: bool,
    ) -> Result<StepEvent, InvariantError> {
        let event = self.transition(step_id, StepState::Failed, None, !retrying)?;
        self.errors.insert(step_id.to_string(), error);
        Ok(event)
    }

    /// Publishes a step's output. Only a Running, unsettled step may succeed.
    pub fn succeed(&mut self, step_id: &str, output: Value) -> Result<StepEvent, InvariantError> {
        let event = self.transition(step_id, StepState::Succeeded, None, true)?;
        self.errors.remove(step_id);
        self.outputs.insert(step_id.to_string(), output);
        Ok(event)
    }

    pub fn skip(&mut self, step_id: &str) -> Result<StepEvent, InvariantError> {
        self.transition(step_id, StepState::Skipped, None, true)
    }

    /// Cancels a step unless it has already settled.
    pub fn cancel(&mut self, step_id: &str) -> Option<StepEvent> {
        match self.records.get(step_id) {
            Some(record) if !record.settled => {
                self.transition(step_id, StepState::Cancelled, None, true).ok()
            }
            _ => None,
        }
    }

    /// Marks the run terminal. The first termination wins.
    pub fn finish(&mut self, termination: Termination) {
        if self.termination.is_none() {
            self.termination = Some(termination);
            self.finished_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
            steps: self
                .records
                .iter()
                .map(|(id, record)| StepSnapshot {
                    id: id.clone(),
                    state: record.state,
                    attempts: record.attempts,
                    settled: record.settled,
                })
                .collect(),
            finished: self.is_finished(),
            taken_at: Utc::now(),
        }
    }
}
