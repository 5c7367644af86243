//! Workflow Execution Engine
//!
//! The entry point for running workflows. The engine owns everything shared
//! between runs:
//! - The service registry
//! - Per-endpoint circuit breakers
//! - Engine configuration and the event sink
//! - The table of submitted runs
//!
//! Each run gets its own scheduler task and execution context; runs share
//! nothing mutable except the circuit breakers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use log::{debug, error, info};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::aggregator::{aggregate, WorkflowResult};
use super::context::{ExecutionContext, RunId, RunSnapshot};
use super::scheduler::Scheduler;
use super::step::StepInvoker;
use crate::config::EngineConfig;
use crate::error::{ConfigError, EngineError, InvariantError};
use crate::monitoring::events::{EventSink, LogEventSink};
use crate::policy::CircuitBreakers;
use crate::service::{CallerContext, ServiceRegistry};
use crate::workflow::planner::ExecutionPlanner;
use crate::workflow::validator::validate;
use crate::workflow::WorkflowGraph;

type RunOutcome = Option<Result<WorkflowResult, InvariantError>>;

/// Per-run overrides of the engine configuration.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Run deadline measured from submission.
    pub deadline: Option<Duration>,
    pub max_concurrency: Option<usize>,
    pub caller: CallerContext,
}

impl RunOptions {
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }

    pub fn with_caller(mut self, caller: CallerContext) -> Self {
        self.caller = caller;
        self
    }
}

struct RunHandle {
    /// Submission order, used to evict the oldest finished runs.
    seq: u64,
    workflow_id: String,
    cancel: CancellationToken,
    snapshots: watch::Receiver<RunSnapshot>,
    outcome: watch::Receiver<RunOutcome>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.outcome.borrow().is_some()
    }
}

/// Workflow execution engine.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use conductor::execution::{Engine, RunOptions};
/// use conductor::load_workflow;
/// use conductor::service::ServiceRegistry;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let graph = Arc::new(load_workflow("outfit.yaml")?);
///     let mut engine = Engine::new(ServiceRegistry::new());
///     engine.set_max_concurrency(8);
///
///     let result = engine
///         .run(graph, serde_json::json!({"image_url": "s3://x.jpg"}), RunOptions::default())
///         .await?;
///     println!("{}", result.status);
///     Ok(())
/// }
/// ```
pub struct Engine {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakers>,
    config: EngineConfig,
    sink: Arc<dyn EventSink>,
    runs: Arc<RwLock<HashMap<RunId, RunHandle>>>,
    submissions: AtomicU64,
}

/// Drops the oldest finished runs until at most `keep` remain.
fn evict_finished(runs: &mut HashMap<RunId, RunHandle>, keep: usize) {
    let mut finished: Vec<(u64, RunId)> = runs
        .iter()
        .filter(|(_, handle)| handle.is_finished())
        .map(|(id, handle)| (handle.seq, *id))
        .collect();
    if finished.len() <= keep {
        return;
    }

    finished.sort_unstable();
    let excess = finished.len() - keep;
    for (_, run_id) in finished.into_iter().take(excess) {
        runs.remove(&run_id);
    }
    debug!("Evicted {} finished runs", excess);
}

impl Engine {
    /// Creates an engine with the default configuration.
    pub fn new(registry: ServiceRegistry) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    pub fn with_config(registry: ServiceRegistry, config: EngineConfig) -> Self {
        Self {
            registry: Arc::new(registry),
            breakers: Arc::new(CircuitBreakers::new(config.circuit.clone())),
            config,
            sink: Arc::new(LogEventSink),
            runs: Arc::new(RwLock::new(HashMap::new())),
            submissions: AtomicU64::new(0),
        }
    }

    /// Builds the registry from the configured services.
    pub fn from_config(config: EngineConfig) -> Result<Self, ConfigError> {
        let registry = ServiceRegistry::from_config(&config.services)?;
        Ok(Self::with_config(registry, config))
    }

    /// Sets the default concurrency budget for new runs.
    pub fn set_max_concurrency(&mut self, max: usize) {
        self.config.max_concurrency = max;
    }

    /// Sets the default run deadline; `None` disables it.
    pub fn set_default_deadline(&mut self, deadline: Option<Duration>) {
        self.config = self.config.clone().with_default_deadline(deadline);
    }

    /// Replaces the sink receiving step events.
    pub fn set_event_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sink = sink;
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    fn read_runs(&self) -> RwLockReadGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_runs(&self) -> RwLockWriteGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs a workflow to completion and returns its result.
    ///
    /// Run-level failures (a failed step, a timeout) come back as the
    /// result's status; only submission problems are errors.
    pub async fn run(
        &self,
        graph: Arc<WorkflowGraph>,
        input: Value,
        options: RunOptions,
    ) -> Result<WorkflowResult, EngineError> {
        let run_id = self.submit(graph, input, options)?;
        let result = self.wait(run_id).await;
        self.forget(run_id);
        result
    }

    /// Starts a workflow in the background and returns its id immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        graph: Arc<WorkflowGraph>,
        input: Value,
        options: RunOptions,
    ) -> Result<RunId, EngineError> {
        validate(&graph)?;

        let budget = options.max_concurrency.unwrap_or(self.config.max_concurrency);
        if budget == 0 {
            return Err(EngineError::ZeroConcurrency);
        }

        let run_id = RunId::new();
        let deadline = options
            .deadline
            .or_else(|| self.config.default_deadline())
            .map(|d| Instant::now() + d);
        let ctx = ExecutionContext::new(run_id, &graph, input, Arc::new(options.caller));

        let (snapshot_tx, snapshot_rx) = watch::channel(ctx.snapshot());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let cancel = CancellationToken::new();

        let scheduler = Scheduler::new(
            ExecutionPlanner::new(graph.clone()),
            StepInvoker::new(self.registry.clone()),
            self.breakers.clone(),
            self.sink.clone(),
            budget,
        )
        .with_deadline(deadline)
        .with_snapshots(snapshot_tx);

        let seq = self.submissions.fetch_add(1, Ordering::Relaxed);
        let mut runs = self.write_runs();
        evict_finished(&mut runs, self.config.retained_runs);
        runs.insert(
            run_id,
            RunHandle {
                seq,
                workflow_id: graph.id().to_string(),
                cancel: cancel.clone(),
                snapshots: snapshot_rx,
                outcome: outcome_rx,
            },
        );
        drop(runs);
        info!("Submitted run {} of workflow '{}'", run_id, graph.id());

        tokio::spawn(async move {
            let ctx = scheduler.run(ctx, cancel).await;
            let outcome = aggregate(&ctx, &graph);
            match &outcome {
                Ok(result) => info!("Run {} finished: {}", run_id, result.status),
                Err(e) => error!("Run {} could not be aggregated: {}", run_id, e),
            }
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(run_id)
    }

    /// Waits for a run to finish and returns its result.
    pub async fn wait(&self, run_id: RunId) -> Result<WorkflowResult, EngineError> {
        let mut outcome = self
            .read_runs()
            .get(&run_id)
            .map(|handle| handle.outcome.clone())
            .ok_or(EngineError::UnknownRun(run_id))?;

        let finished = outcome.wait_for(Option::is_some).await.map_err(|_| {
            InvariantError::TaskAborted {
                detail: format!("run {} ended without a result", run_id),
            }
        })?;

        let result = match &*finished {
            Some(Ok(result)) => Ok(result.clone()),
            Some(Err(e)) => Err(EngineError::Invariant(e.clone())),
            None => Err(EngineError::UnknownRun(run_id)),
        };
        result
    }

    /// Latest snapshot of a run's progress.
    pub fn status(&self, run_id: RunId) -> Option<RunSnapshot> {
        self.read_runs()
            .get(&run_id)
            .map(|handle| handle.snapshots.borrow().clone())
    }

    /// The run's result if it has finished.
    pub fn result(&self, run_id: RunId) -> Option<WorkflowResult> {
        let runs = self.read_runs();
        let handle = runs.get(&run_id)?;
        let outcome = handle.outcome.borrow();
        let result = match &*outcome {
            Some(Ok(result)) => Some(result.clone()),
            _ => None,
        };
        result
    }

    /// Requests cancellation. Returns false if the run is unknown or
    /// already finished.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.read_runs().get(&run_id) {
            Some(handle) if !handle.is_finished() => {
                info!("Cancelling run {} of workflow '{}'", run_id, handle.workflow_id);
                handle.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Drops a finished run from the run table.
    ///
    /// Returns false if the run is unknown or still in progress.
    pub fn forget(&self, run_id: RunId) -> bool {
        let mut runs = self.write_runs();
        let finished = runs.get(&run_id).map_or(false, RunHandle::is_finished);
        if finished {
            runs.remove(&run_id);
            debug!("Forgot run {}", run_id);
        }
        finished
    }

    /// Ids of runs still in progress.
    pub fn active_runs(&self) -> Vec<RunId> {
        let mut active: Vec<RunId> = self
            .read_runs()
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| *id)
            .collect();
        active.sort();
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GraphError, StepError};
    use crate::execution::aggregator::WorkflowStatus;
    use crate::execution::context::StepState;
    use crate::monitoring::events::BroadcastEventSink;
    use crate::policy::{CircuitStatus, RetryPolicy};
    use crate::service::{service_fn, ServiceError, ServiceRequest};
    use crate::workflow::model::FailurePolicy;
    use crate::workflow::Step;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new()
            .with(
                "echo",
                service_fn(|req: ServiceRequest| async move {
                    Ok(json!({"step": req.step_id, "payload": req.payload}))
                }),
            )
            .with(
                "fail",
                service_fn(|_| async { Err(ServiceError::remote("http_500", "boom")) }),
            )
            .with(
                "slow",
                service_fn(|_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }),
            )
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(attempts)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
    }

    fn graph(id: &str, steps: Vec<Step>) -> Arc<WorkflowGraph> {
        Arc::new(WorkflowGraph::new(id, steps))
    }

    #[tokio::test]
    async fn test_linear_chain_succeeds() {
        let engine = Engine::new(registry());
        let workflow = graph(
            "chain",
            vec![
                Step::new("a", "echo"),
                Step::new("b", "echo").depends_on("a"),
                Step::new("c", "echo").depends_on("b"),
            ],
        );

        let result = engine
            .run(workflow, json!({"user": 1}), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        let order: Vec<_> = result.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(&result.output, result.step("c").unwrap().output.as_ref().unwrap());
        assert_eq!(result.output["step"], "c");
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_diamond_with_failed_optional_branch() {
        let engine = Engine::new(registry());
        let workflow = graph(
            "diamond",
            vec![
                Step::new("a", "echo"),
                Step::new("b", "fail")
                    .depends_on("a")
                    .optional()
                    .with_retry(RetryPolicy::no_retry()),
                Step::new("c", "echo").depends_on("a"),
                Step::new("d", "echo").depends_on("b").depends_on("c"),
            ],
        );

        let result = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::PartialSuccess);
        assert_eq!(result.step("b").unwrap().status, StepState::Failed);
        let d = result.step("d").unwrap();
        assert_eq!(d.status, StepState::Succeeded);

        let payload = &d.output.as_ref().unwrap()["payload"];
        assert!(payload.get("c").is_some());
        assert!(payload.get("b").is_none());
        assert_eq!(result.missing(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_deadline_times_out_run() {
        let engine = Engine::new(registry());
        let workflow = graph("slow", vec![Step::new("wait", "slow")]);

        let started = Instant::now();
        let result = engine
            .run(
                workflow,
                json!({}),
                RunOptions::default().with_deadline(Duration::from_millis(200)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, WorkflowStatus::TimedOut);
        let step = result.step("wait").unwrap();
        assert_eq!(step.status, StepState::Cancelled);
        assert!(step.output.is_none());
        assert_eq!(result.output, Value::Null);
        assert!(!result
            .events
            .iter()
            .any(|e| e.step_id == "wait" && e.to == StepState::Succeeded));
    }

    #[tokio::test]
    async fn test_circuit_opens_across_runs() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = ServiceRegistry::new().with(
            "down",
            service_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::unreachable("connection refused")) }
            }),
        );
        let engine = Engine::new(registry);
        let workflow = graph(
            "probe",
            vec![Step::new("call", "down").with_retry(RetryPolicy::no_retry())],
        );

        for _ in 0..5 {
            let result = engine
                .run(workflow.clone(), json!({}), RunOptions::default())
                .await
                .unwrap();
            assert_eq!(result.status, WorkflowStatus::Failed);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);

        let sixth = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(sixth.status, WorkflowStatus::Failed);
        assert!(matches!(
            sixth.step("call").unwrap().error,
            Some(StepError::CircuitOpen { .. })
        ));
    }

    #[tokio::test]
    async fn test_retry_cycles_match_max_attempts() {
        let engine = Engine::new(registry());
        let workflow = graph("retry", vec![Step::new("x", "fail").with_retry(fast_retry(4))]);

        let result = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        let step = result.step("x").unwrap();
        assert_eq!(step.attempts, 4);
        assert_eq!(step.error, Some(StepError::remote("http_500", "boom")));

        let cycles = result
            .events
            .iter()
            .filter(|e| e.from == StepState::Running && e.to == StepState::Failed)
            .count();
        assert_eq!(cycles, 4);

        let attempts: Vec<u32> = result
            .events
            .iter()
            .filter(|e| e.to == StepState::Running)
            .map(|e| e.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_budget_respected_per_run() {
        let engine = Engine::new(registry());
        let steps = (0..8).map(|i| Step::new(format!("s{}", i), "echo")).collect();
        let result = engine
            .run(
                graph("wide", steps),
                json!({}),
                RunOptions::default().with_max_concurrency(2),
            )
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Succeeded);
        let mut running = 0i32;
        for event in &result.events {
            if event.to == StepState::Running {
                running += 1;
            }
            if event.from == StepState::Running {
                running -= 1;
            }
            assert!(running <= 2);
        }
    }

    #[tokio::test]
    async fn test_cancel_descendants_keeps_independent_branch() {
        let engine = Engine::new(registry());
        let workflow = Arc::new(
            WorkflowGraph::new(
                "branches",
                vec![
                    Step::new("bad", "fail").with_retry(RetryPolicy::no_retry()),
                    Step::new("after_bad", "echo").depends_on("bad"),
                    Step::new("good", "echo"),
                    Step::new("after_good", "echo").depends_on("good"),
                ],
            )
            .with_failure_policy(FailurePolicy::CancelDescendants),
        );

        let result = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.step("after_bad").unwrap().status, StepState::Cancelled);
        assert_eq!(result.step("good").unwrap().status, StepState::Succeeded);
        assert_eq!(result.step("after_good").unwrap().status, StepState::Succeeded);
    }

    #[tokio::test]
    async fn test_cancel_run_policy_cancels_other_branches() {
        let engine = Engine::new(registry());
        let workflow = graph(
            "branches",
            vec![
                Step::new("bad", "fail").with_retry(RetryPolicy::no_retry()),
                Step::new("other", "slow"),
            ],
        );

        let result = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.step("other").unwrap().status, StepState::Cancelled);
    }

    #[tokio::test]
    async fn test_submit_status_cancel_wait() {
        let engine = Engine::new(registry());
        let workflow = graph("slow", vec![Step::new("wait", "slow")]);

        let run_id = engine
            .submit(workflow, json!({}), RunOptions::default())
            .unwrap();
        assert_eq!(engine.active_runs(), vec![run_id]);

        let mut running = false;
        for _ in 0..100 {
            let snapshot = engine.status(run_id).unwrap();
            if snapshot.state_of("wait") == Some(StepState::Running) {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(running);
        assert!(engine.result(run_id).is_none());
        assert!(!engine.forget(run_id));

        assert!(engine.cancel(run_id));
        let result = engine.wait(run_id).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.step("wait").unwrap().status, StepState::Cancelled);

        assert!(engine.status(run_id).unwrap().finished);
        assert!(engine.result(run_id).is_some());
        assert!(!engine.cancel(run_id));
        assert!(engine.active_runs().is_empty());
        assert!(engine.forget(run_id));
        assert!(engine.status(run_id).is_none());
    }

    #[tokio::test]
    async fn test_invalid_graph_rejected_at_submission() {
        let engine = Engine::new(registry());
        let workflow = graph("bad", vec![Step::new("a", "echo").depends_on("ghost")]);

        let err = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Graph(GraphError::UnknownDependency { .. })
        ));
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_zero_budget_rejected() {
        let engine = Engine::new(registry());
        let err = engine
            .submit(
                graph("g", vec![Step::new("a", "echo")]),
                json!({}),
                RunOptions::default().with_max_concurrency(0),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::ZeroConcurrency));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let engine = Engine::new(registry());
        let ghost = RunId::new();
        assert!(matches!(
            engine.wait(ghost).await,
            Err(EngineError::UnknownRun(id)) if id == ghost
        ));
        assert!(engine.status(ghost).is_none());
        assert!(!engine.cancel(ghost));
    }

    #[tokio::test]
    async fn test_caller_context_reaches_services() {
        let registry = ServiceRegistry::new().with(
            "whoami",
            service_fn(|req: ServiceRequest| async move {
                Ok(json!({
                    "principal": req.caller.principal.clone(),
                    "has_token": req.caller.bearer_token.is_some(),
                }))
            }),
        );
        let engine = Engine::new(registry);
        let options = RunOptions::default()
            .with_caller(CallerContext::new("alice").with_token("t0k"));

        let result = engine
            .run(graph("who", vec![Step::new("me", "whoami")]), json!({}), options)
            .await
            .unwrap();
        assert_eq!(result.output, json!({"principal": "alice", "has_token": true}));
    }

    #[tokio::test]
    async fn test_events_reach_sink() {
        let mut engine = Engine::new(registry());
        let sink = Arc::new(BroadcastEventSink::new(64));
        let mut rx = sink.subscribe();
        engine.set_event_sink(sink);

        let result = engine
            .run(graph("one", vec![Step::new("a", "echo")]), json!({}), RunOptions::default())
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!((first.from, first.to), (StepState::Pending, StepState::Running));
        assert_eq!((second.from, second.to), (StepState::Running, StepState::Succeeded));
        assert_eq!(first.run_id, result.run_id);
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_graph() {
        let engine = Engine::new(registry());
        let workflow = graph(
            "shared",
            vec![Step::new("a", "echo"), Step::new("b", "echo").depends_on("a")],
        );

        let ids: Vec<RunId> = (0..5)
            .map(|i| {
                engine
                    .submit(workflow.clone(), json!({"n": i}), RunOptions::default())
                    .unwrap()
            })
            .collect();

        for (i, id) in ids.into_iter().enumerate() {
            let result = engine.wait(id).await.unwrap();
            assert_eq!(result.status, WorkflowStatus::Succeeded);
            assert_eq!(result.output["payload"]["a"]["payload"]["input"]["n"], json!(i));
        }
    }

    #[tokio::test]
    async fn test_finished_runs_are_evicted() {
        let config = EngineConfig::default().with_retained_runs(2);
        let engine = Engine::with_config(registry(), config);
        let workflow = graph("one", vec![Step::new("a", "echo")]);

        let mut ids = Vec::new();
        for _ in 0..4 {
            let id = engine
                .submit(workflow.clone(), json!({}), RunOptions::default())
                .unwrap();
            engine.wait(id).await.unwrap();
            ids.push(id);
        }

        let latest = engine
            .submit(workflow, json!({}), RunOptions::default())
            .unwrap();
        assert!(engine.status(ids[0]).is_none());
        assert!(engine.status(ids[1]).is_none());
        assert!(engine.result(ids[2]).is_some());
        assert!(engine.result(ids[3]).is_some());
        assert!(matches!(
            engine.wait(ids[0]).await,
            Err(EngineError::UnknownRun(_))
        ));

        let result = engine.wait(latest).await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_running_runs_are_never_evicted() {
        let config = EngineConfig::default().with_retained_runs(0);
        let engine = Engine::with_config(registry(), config);

        let slow = engine
            .submit(
                graph("slow", vec![Step::new("wait", "slow")]),
                json!({}),
                RunOptions::default(),
            )
            .unwrap();
        let fast = engine
            .submit(
                graph("one", vec![Step::new("a", "echo")]),
                json!({}),
                RunOptions::default(),
            )
            .unwrap();

        assert!(engine.status(slow).is_some());
        assert!(engine.cancel(slow));
        assert_eq!(engine.wait(slow).await.unwrap().status, WorkflowStatus::Cancelled);
        assert_eq!(engine.wait(fast).await.unwrap().status, WorkflowStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_cancelled_trial_does_not_wedge_circuit() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let registry = ServiceRegistry::new().with(
            "flaky",
            service_fn(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    match n {
                        1..=5 => Err(ServiceError::unreachable("connection refused")),
                        6 => {
                            tokio::time::sleep(Duration::from_secs(5)).await;
                            Ok(json!("late"))
                        }
                        _ => Ok(json!("ok")),
                    }
                }
            }),
        );
        let mut config = EngineConfig::default();
        config.circuit.cool_down_ms = 50;
        let engine = Engine::with_config(registry, config);
        let workflow = graph(
            "probe",
            vec![Step::new("call", "flaky").with_retry(RetryPolicy::no_retry())],
        );

        for _ in 0..5 {
            let result = engine
                .run(workflow.clone(), json!({}), RunOptions::default())
                .await
                .unwrap();
            assert_eq!(result.status, WorkflowStatus::Failed);
        }
        assert_eq!(engine.breakers().status("flaky"), CircuitStatus::Open);
        tokio::time::sleep(Duration::from_millis(80)).await;

        let trial = engine
            .submit(workflow.clone(), json!({}), RunOptions::default())
            .unwrap();
        for _ in 0..100 {
            if calls.load(Ordering::SeqCst) == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        assert!(engine.cancel(trial));
        assert_eq!(engine.wait(trial).await.unwrap().status, WorkflowStatus::Cancelled);
        assert_eq!(engine.breakers().status("flaky"), CircuitStatus::HalfOpen);

        let next = engine
            .run(workflow, json!({}), RunOptions::default())
            .await
            .unwrap();
        assert_eq!(next.status, WorkflowStatus::Succeeded);
        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(engine.breakers().status("flaky"), CircuitStatus::Closed);
    }

    #[test]
    fn test_from_config() {
        let config = crate::config::parse_config(
            "max_concurrency: 3\nservices:\n  local:\n    kind: command\n    program: cat\n",
        )
        .unwrap();
        let engine = Engine::from_config(config).unwrap();
        assert_eq!(engine.config().max_concurrency, 3);
        assert!(engine.registry().contains("local"));
    }
}
