//! Workflow Validation
//!
//! Checks a graph before it is ever executed, in this order:
//! 1. No duplicate or reserved step IDs
//! 2. Every dependency refers to an existing step
//! 3. No cyclic dependencies
//! 4. Input mappings only read steps the step depends on
//! 5. The merge rule only names existing steps
//!
//! Validation is pure: a graph that passes is safe to execute repeatedly
//! and by many runs at once.

use std::collections::{HashSet, VecDeque};

use log::{debug, info};

use super::mapping::INPUT_KEY;
use super::model::WorkflowGraph;
use crate::error::GraphError;

/// Validates the workflow, failing on the first problem found.
pub fn validate(graph: &WorkflowGraph) -> Result<(), GraphError> {
    debug!(
        "Validating workflow '{}' with {} steps",
        graph.id(),
        graph.len()
    );

    check_unique_ids(graph)?;
    check_dependencies_exist(graph)?;

    if let Some(members) = find_cycle(graph) {
        return Err(GraphError::Cycle { members });
    }

    check_input_references(graph)?;
    check_merge_rule(graph)?;

    info!(
        "Workflow '{}' v{} validated: {} steps, {} endpoints",
        graph.id(),
        graph.version(),
        graph.len(),
        graph.endpoints().len()
    );
    Ok(())
}

/// Collects every problem instead of stopping at the first.
///
/// Useful for editor and CLI feedback. Cycle detection only runs once the
/// id and reference checks pass.
pub fn validate_all(graph: &WorkflowGraph) -> Vec<GraphError> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for step in graph.steps() {
        if !seen.insert(step.id.as_str()) {
            errors.push(GraphError::DuplicateStep {
                step_id: step.id.clone(),
            });
        }
        if step.id == INPUT_KEY {
            errors.push(GraphError::ReservedStepId {
                step_id: step.id.clone(),
            });
        }
        for dep in &step.depends_on {
            if graph.index_of(dep).is_none() {
                errors.push(GraphError::UnknownDependency {
                    step_id: step.id.clone(),
                    missing_dep: dep.clone(),
                });
            }
        }
        for source in step.input.referenced_steps() {
            if !step.depends_on.iter().any(|dep| dep == source) {
                errors.push(GraphError::UndeclaredInput {
                    step_id: step.id.clone(),
                    source_step: source.to_string(),
                });
            }
        }
    }

    for id in graph.merge().referenced_steps() {
        if graph.index_of(id).is_none() {
            errors.push(GraphError::UnknownMergeStep {
                step_id: id.to_string(),
            });
        }
    }

    if errors.is_empty() {
        if let Some(members) = find_cycle(graph) {
            errors.push(GraphError::Cycle { members });
        }
    }

    errors
}

fn check_unique_ids(graph: &WorkflowGraph) -> Result<(), GraphError> {
    let mut seen = HashSet::new();
    for step in graph.steps() {
        if !seen.insert(step.id.as_str()) {
            return Err(GraphError::DuplicateStep {
                step_id: step.id.clone(),
            });
        }
        if step.id == INPUT_KEY {
            return Err(GraphError::ReservedStepId {
                step_id: step.id.clone(),
            });
        }
    }
    Ok(())
}

fn check_dependencies_exist(graph: &WorkflowGraph) -> Result<(), GraphError> {
    for step in graph.steps() {
        for dep in &step.depends_on {
            if graph.index_of(dep).is_none() {
                return Err(GraphError::UnknownDependency {
                    step_id: step.id.clone(),
                    missing_dep: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_input_references(graph: &WorkflowGraph) -> Result<(), GraphError> {
    for step in graph.steps() {
        for source in step.input.referenced_steps() {
            if !step.depends_on.iter().any(|dep| dep == source) {
                return Err(GraphError::UndeclaredInput {
                    step_id: step.id.clone(),
                    source_step: source.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_merge_rule(graph: &WorkflowGraph) -> Result<(), GraphError> {
    for id in graph.merge().referenced_steps() {
        if graph.index_of(id).is_none() {
            return Err(GraphError::UnknownMergeStep {
                step_id: id.to_string(),
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

/// Depth-first search over dependency edges.
///
/// Returns the ids on the first cycle found, in dependency order starting
/// from the step the back-edge points to. Iterative so that deep chains do
/// not exhaust the call stack.
fn find_cycle(graph: &WorkflowGraph) -> Option<Vec<String>> {
    let steps = graph.steps();
    let mut marks = vec![Mark::Unvisited; steps.len()];

    for root in 0..steps.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        // (step position, next dependency to explore)
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        marks[root] = Mark::OnStack;

        while let Some(frame) = stack.last_mut() {
            let node = frame.0;
            let deps = &steps[node].depends_on;

            if frame.1 >= deps.len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }

            let dep = &deps[frame.1];
            frame.1 += 1;

            let Some(child) = graph.index_of(dep) else {
                continue;
            };

            match marks[child] {
                Mark::Unvisited => {
                    marks[child] = Mark::OnStack;
                    stack.push((child, 0));
                }
                Mark::OnStack => {
                    let start = stack.iter().position(|(n, _)| *n == child)?;
                    let members = stack[start..]
                        .iter()
                        .map(|(n, _)| steps[*n].id.clone())
                        .collect();
                    return Some(members);
                }
                Mark::Done => {}
            }
        }
    }

    None
}

/// Orders step positions so every dependency precedes its dependents.
///
/// Uses Kahn's algorithm, seeded in declaration order so the result is
/// stable. Steps caught in a cycle are left out; callers validate first.
pub fn topological_order(graph: &WorkflowGraph) -> Vec<usize> {
    let steps = graph.steps();
    let mut in_degree: Vec<usize> = vec![0; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];

    for (position, step) in steps.iter().enumerate() {
        for dep in &step.depends_on {
            if let Some(dep_position) = graph.index_of(dep) {
                in_degree[position] += 1;
                dependents[dep_position].push(position);
            }
        }
    }

    let mut queue: VecDeque<usize> = (0..steps.len()).filter(|&p| in_degree[p] == 0).collect();
    let mut order = Vec::with_capacity(steps.len());

    while let Some(current) = queue.pop_front() {
        order.push(current);
        for &next in &dependents[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    debug!(
        "Topological order: {:?}",
        order.iter().map(|&p| &steps[p].id).collect::<Vec<_>>()
    );

    order
}
