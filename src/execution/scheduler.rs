//! Run Scheduler
//!
//! The single owner of a run's [`ExecutionContext`]. Each scheduling tick:
//! - Walks Pending steps in dependency order, skipping or cancelling those
//!   doomed by upstream outcomes
//! - Launches ready steps as [`StepTask`]s up to the concurrency budget
//! - Waits for the next attempt report, task completion, deadline or
//!   external cancellation
//!
//! Step tasks never touch the context; every transition is applied here.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::{ExecutionContext, RunSnapshot, StepState, Termination};
use super::step::StepInvoker;
use super::task::{Progress, StepTask, TaskOutcome};
use crate::error::InvariantError;
use crate::monitoring::events::{EventSink, StepEvent};
use crate::policy::CircuitBreakers;
use crate::workflow::mapping::ResolveScope;
use crate::workflow::model::FailurePolicy;
use crate::workflow::planner::{ExecutionPlanner, Readiness};
use crate::workflow::WorkflowGraph;

/// Drives one run from all-Pending to a termination.
pub struct Scheduler {
    planner: ExecutionPlanner,
    invoker: StepInvoker,
    breakers: Arc<CircuitBreakers>,
    sink: Arc<dyn EventSink>,
    max_concurrency: usize,
    deadline: Option<Instant>,
    snapshots: Option<watch::Sender<RunSnapshot>>,
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Scheduler {
    pub fn new(
        planner: ExecutionPlanner,
        invoker: StepInvoker,
        breakers: Arc<CircuitBreakers>,
        sink: Arc<dyn EventSink>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            planner,
            invoker,
            breakers,
            sink,
            max_concurrency: max_concurrency.max(1),
            deadline: None,
            snapshots: None,
        }
    }

    /// Run-level deadline; on expiry the run ends TimedOut.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Publishes a snapshot after every state change.
    pub fn with_snapshots(mut self, snapshots: watch::Sender<RunSnapshot>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    fn graph(&self) -> &Arc<WorkflowGraph> {
        self.planner.graph()
    }

    fn emit(&self, event: StepEvent) {
        debug!(
            "Step '{}': {} -> {} (attempt {})",
            event.step_id, event.from, event.to, event.attempt
        );
        self.sink.emit(&event);
    }

    fn publish(&self, ctx: &ExecutionContext) {
        if let Some(snapshots) = &self.snapshots {
            snapshots.send_replace(ctx.snapshot());
        }
    }

    /// Runs until every step settles, the deadline elapses, `external`
    /// fires, or an invariant breaks. Returns the finished context.
    pub async fn run(self, mut ctx: ExecutionContext, external: CancellationToken) -> ExecutionContext {
        let started = Instant::now();
        info!(
            "Starting run {} of workflow '{}' ({} steps, budget {})",
            ctx.run_id(),
            ctx.workflow_id(),
            self.graph().len(),
            self.max_concurrency
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut tasks: JoinSet<(usize, TaskOutcome)> = JoinSet::new();
        self.publish(&ctx);

        let termination = loop {
            if let Err(fault) = self.schedule(&mut ctx, &mut tasks, &progress_tx) {
                break Termination::Faulted(fault);
            }
            self.publish(&ctx);

            if ctx.unsettled().is_empty() {
                break Termination::Completed;
            }
            if tasks.is_empty() {
                break Termination::Faulted(InvariantError::Stalled {
                    step_ids: ctx.unsettled(),
                });
            }

            tokio::select! {
                biased;
                _ = deadline_elapsed(self.deadline) => break Termination::TimedOut,
                _ = external.cancelled() => break Termination::Cancelled,
                Some(progress) = progress_rx.recv() => {
                    if let Err(fault) = self.apply_progress(&mut ctx, progress) {
                        break Termination::Faulted(fault);
                    }
                }
                Some(joined) = tasks.join_next() => {
                    // Attempt reports precede the task's completion.
                    let mut fault = None;
                    while let Ok(progress) = progress_rx.try_recv() {
                        if let Err(e) = self.apply_progress(&mut ctx, progress) {
                            fault = Some(e);
                            break;
                        }
                    }
                    if let Some(fault) = fault {
                        break Termination::Faulted(fault);
                    }

                    match joined {
                        Ok((position, outcome)) => {
                            if let Err(fault) = self.apply_outcome(&mut ctx, position, outcome, &mut tasks) {
                                break Termination::Faulted(fault);
                            }
                        }
                        Err(e) if e.is_cancelled() => debug!("Step task aborted: {}", e),
                        Err(e) => {
                            break Termination::Faulted(InvariantError::TaskAborted {
                                detail: e.to_string(),
                            });
                        }
                    }
                }
            }
            self.publish(&ctx);
        };

        match &termination {
            Termination::Completed => {}
            Termination::TimedOut => warn!("Run {} exceeded its deadline", ctx.run_id()),
            Termination::Cancelled => info!("Run {} cancelled by caller", ctx.run_id()),
            Termination::Faulted(fault) => {
                error!("Run {} faulted: {}", ctx.run_id(), fault);
            }
        }

        ctx.abort();
        for step_id in ctx.unsettled() {
            if let Some(event) = ctx.cancel(&step_id) {
                self.emit(event);
            }
        }
        tasks.shutdown().await;

        ctx.finish(termination);
        self.publish(&ctx);

        info!(
            "Run {} finished in {}ms",
            ctx.run_id(),
            started.elapsed().as_millis()
        );
        ctx
    }

    /// Applies skip/cancel propagation and launches ready steps.
    fn schedule(
        &self,
        ctx: &mut ExecutionContext,
        tasks: &mut JoinSet<(usize, TaskOutcome)>,
        progress: &mpsc::UnboundedSender<Progress>,
    ) -> Result<(), InvariantError> {
        let graph = self.graph().clone();

        for &position in self.planner.order() {
            let step = &graph.steps()[position];
            if ctx.record_at(position).map(|(_, r)| r.state) != Some(StepState::Pending) {
                continue;
            }

            match self.planner.readiness(position, ctx) {
                Readiness::Waiting => {}
                Readiness::Skip(reason) => {
                    info!("Skipping step '{}': {}", step.id, reason);
                    let event = ctx.skip(&step.id)?;
                    self.emit(event);
                }
                Readiness::Cancel(reason) => {
                    info!("Cancelling step '{}': {}", step.id, reason);
                    if let Some(event) = ctx.cancel(&step.id) {
                        self.emit(event);
                    }
                }
                Readiness::Ready => {
                    if tasks.len() >= self.max_concurrency {
                        continue;
                    }

                    let input = step.input.resolve(
                        &step.id,
                        &ResolveScope {
                            graph: &graph,
                            workflow_input: ctx.input(),
                            outputs: ctx.outputs(),
                        },
                    )?;

                    let event = ctx.start_attempt(&step.id, 1)?;
                    self.emit(event);

                    let task = StepTask {
                        position,
                        graph: graph.clone(),
                        input,
                        invoker: self.invoker.clone(),
                        breakers: self.breakers.clone(),
                        deadline: self.deadline,
                        run_id: ctx.run_id(),
                        caller: ctx.caller().clone(),
                        cancel: ctx.cancellation().child_token(),
                        progress: progress.clone(),
                    };
                    debug!("Launching step '{}' ({} in flight)", step.id, tasks.len() + 1);
                    tasks.spawn(task.run());
                }
            }
        }

        Ok(())
    }

    fn apply_progress(&self, ctx: &mut ExecutionContext, progress: Progress) -> Result<(), InvariantError> {
        match progress {
            Progress::AttemptStarted { position, attempt } => {
                let Some((step_id, record)) = ctx.record_at(position) else {
                    return Ok(());
                };
                // The first attempt is marked Running at launch.
                if record.settled || (record.state == StepState::Running && record.attempts == attempt) {
                    return Ok(());
                }
                let step_id = step_id.to_string();
                let event = ctx.start_attempt(&step_id, attempt)?;
                self.emit(event);
            }
            Progress::AttemptFailed {
                position,
                attempt,
                error,
                retry_in,
            } => {
                let Some((step_id, record)) = ctx.record_at(position) else {
                    return Ok(());
                };
                if record.settled {
                    return Ok(());
                }
                let step_id = step_id.to_string();
                debug!(
                    "Step '{}' attempt {} failed, retry in {}ms",
                    step_id,
                    attempt,
                    retry_in.as_millis()
                );
                let event = ctx.fail_attempt(&step_id, error, true)?;
                self.emit(event);
            }
        }
        Ok(())
    }

    fn apply_outcome(
        &self,
        ctx: &mut ExecutionContext,
        position: usize,
        outcome: TaskOutcome,
        tasks: &mut JoinSet<(usize, TaskOutcome)>,
    ) -> Result<(), InvariantError> {
        let graph = self.graph().clone();
        let step = &graph.steps()[position];

        if ctx.record(&step.id).map_or(true, |r| r.settled) {
            debug!("Discarding late result for settled step '{}'", step.id);
            return Ok(());
        }

        match outcome {
            TaskOutcome::Succeeded { attempt, output } => {
                info!("Step '{}' succeeded on attempt {}", step.id, attempt);
                let event = ctx.succeed(&step.id, output)?;
                self.emit(event);
            }
            TaskOutcome::Interrupted { .. } => {
                if let Some(event) = ctx.cancel(&step.id) {
                    self.emit(event);
                }
            }
            TaskOutcome::GaveUp { attempt, error } => {
                let event = ctx.fail_attempt(&step.id, error.clone(), false)?;
                self.emit(event);

                if step.optional {
                    warn!(
                        "Optional step '{}' failed after {} attempt(s): {}",
                        step.id, attempt, error
                    );
                    return Ok(());
                }

                error!(
                    "Step '{}' failed after {} attempt(s): {}",
                    step.id, attempt, error
                );
                self.on_required_failure(ctx, position, tasks);
            }
        }
        Ok(())
    }

    fn on_required_failure(
        &self,
        ctx: &mut ExecutionContext,
        position: usize,
        tasks: &mut JoinSet<(usize, TaskOutcome)>,
    ) {
        match self.graph().failure_policy() {
            FailurePolicy::CancelRun => {
                ctx.abort();
                for step_id in ctx.unsettled() {
                    if let Some(event) = ctx.cancel(&step_id) {
                        self.emit(event);
                    }
                }
                tasks.abort_all();
            }
            FailurePolicy::CancelDescendants => {
                let graph = self.graph().clone();
                for descendant in self.planner.descendants(position) {
                    let step_id = &graph.steps()[descendant].id;
                    if let Some(event) = ctx.cancel(step_id) {
                        self.emit(event);
                    }
                }
            }
        }
    }
}
