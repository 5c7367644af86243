//! Execution Planner
//!
//! Precomputes the dependency structure of a validated graph and answers
//! the scheduler's questions about it:
//! - Which steps are ready to launch
//! - Which steps must be skipped or cancelled because of upstream outcomes
//! - Which steps transitively depend on a given step

use std::collections::VecDeque;
use std::sync::Arc;

use log::debug;

use super::model::{OptionalDependency, WorkflowGraph};
use super::validator::topological_order;
use crate::execution::context::{ExecutionContext, StepState};

/// What the scheduler should do with a Pending step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Some dependency has not settled yet.
    Waiting,
    /// Every dependency settled in a way that lets the step run.
    Ready,
    /// The step must be skipped; the string names the cause.
    Skip(String),
    /// The step must be cancelled; the string names the cause.
    Cancel(String),
}

/// Dependency bookkeeping for one graph, shared by every run of it.
#[derive(Debug)]
pub struct ExecutionPlanner {
    graph: Arc<WorkflowGraph>,
    order: Vec<usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl ExecutionPlanner {
    /// Creates a planner for a graph that already passed validation.
    pub fn new(graph: Arc<WorkflowGraph>) -> Self {
        let count = graph.len();
        let mut dependencies = vec![Vec::new(); count];
        let mut dependents = vec![Vec::new(); count];

        for (position, step) in graph.steps().iter().enumerate() {
            for dep in &step.depends_on {
                if let Some(dep_position) = graph.index_of(dep) {
                    dependencies[position].push(dep_position);
                    dependents[dep_position].push(position);
                }
            }
        }

        let order = topological_order(&graph);
        debug!(
            "Planned workflow '{}': {} steps, order {:?}",
            graph.id(),
            count,
            order
        );

        Self {
            graph,
            order,
            dependencies,
            dependents,
        }
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    /// Arena positions in dependency order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn dependencies_of(&self, position: usize) -> &[usize] {
        self.dependencies.get(position).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, position: usize) -> &[usize] {
        self.dependents.get(position).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Decides what to do with the step at `position`.
    ///
    /// Cancellation wins over skipping, and both win over waiting: once one
    /// dependency has doomed the step there is no point waiting for others.
    pub fn readiness(&self, position: usize, ctx: &ExecutionContext) -> Readiness {
        let step = &self.graph.steps()[position];
        let mut waiting = false;
        let mut skip: Option<String> = None;

        for &dep_position in self.dependencies_of(position) {
            let dep = &self.graph.steps()[dep_position];
            let Some((_, record)) = ctx.record_at(dep_position) else {
                continue;
            };

            match record.state {
                StepState::Succeeded => {}
                StepState::Pending | StepState::Running => waiting = true,
                StepState::Failed if !record.settled => waiting = true,
                StepState::Cancelled => {
                    return Readiness::Cancel(format!("dependency '{}' was cancelled", dep.id));
                }
                StepState::Failed if !dep.optional => {
                    return Readiness::Cancel(format!("required dependency '{}' failed", dep.id));
                }
                StepState::Skipped if !dep.optional => {
                    skip.get_or_insert_with(|| {
                        format!("required dependency '{}' was skipped", dep.id)
                    });
                }
                StepState::Failed | StepState::Skipped => {
                    if step.optional_dependency == OptionalDependency::Skip {
                        skip.get_or_insert_with(|| {
                            format!("optional dependency '{}' did not succeed", dep.id)
                        });
                    }
                }
            }
        }

        if let Some(reason) = skip {
            Readiness::Skip(reason)
        } else if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Every step that transitively depends on `position`, in BFS order.
    pub fn descendants(&self, position: usize) -> Vec<usize> {
        let mut seen = vec![false; self.graph.len()];
        let mut queue: VecDeque<usize> = self.dependents_of(position).iter().copied().collect();
        let mut result = Vec::new();

        while let Some(next) = queue.pop_front() {
            if std::mem::replace(&mut seen[next], true) {
                continue;
            }
            result.push(next);
            queue.extend(self.dependents_of(next).iter().copied());
        }

        result
    }
}
