//! Workflow Data Model
//!
//! Core data structures representing workflow steps and their dependencies.
//!
//! Steps live in an arena (`Vec<Step>`) indexed by id; dependency edges are
//! plain id lists. A graph is immutable once built and is shared between
//! concurrent runs behind an `Arc`.
//!
//! # Example YAML Format
//!
//! ```yaml
//! id: outfit_recommendation
//! version: "2"
//! merge: last_step
//! steps:
//!   - id: analyze_image
//!     endpoint: image_analysis
//!     input: workflow_input
//!     timeout_ms: 8000
//!
//!   - id: build_profile
//!     endpoint: style_profile
//!     depends_on: [analyze_image]
//!     retry:
//!       max_attempts: 4
//!
//!   - id: recommend
//!     endpoint: recommendation
//!     depends_on: [build_profile]
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::mapping::InputMapping;
use crate::policy::RetryPolicy;

/// What a step does when one of its *optional* dependencies did not succeed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptionalDependency {
    /// Run anyway, without that dependency's output.
    #[default]
    Proceed,
    /// Mark this step Skipped.
    Skip,
}

/// How a required step failure affects the rest of the run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Cancel every unsettled step in the run.
    #[default]
    CancelRun,
    /// Cancel only steps that transitively depend on the failed one.
    CancelDescendants,
}

/// Which step outputs make up the workflow's aggregated output.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Output of the last declared step.
    #[default]
    LastStep,
    /// Output of a single named step.
    Step { id: String },
    /// Object keyed by step id, holding each listed step's output.
    Steps { ids: Vec<String> },
}

impl MergeRule {
    /// Step ids the rule reads from, excluding the implicit last step.
    pub fn referenced_steps(&self) -> Vec<&str> {
        match self {
            Self::LastStep => Vec::new(),
            Self::Step { id } => vec![id.as_str()],
            Self::Steps { ids } => ids.iter().map(String::as_str).collect(),
        }
    }
}

/// Represents a single step in a workflow.
///
/// A step is one call to an external service endpoint. Its request payload
/// is derived from the workflow input and prior step outputs through its
/// [`InputMapping`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier within the workflow
    pub id: String,

    /// Name of the service capability this step calls
    pub endpoint: String,

    /// IDs of steps that must settle before this step can run
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Rule deriving the request payload
    #[serde(default)]
    pub input: InputMapping,

    /// Per-attempt timeout
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    /// If true, failure of this step does not fail the workflow
    #[serde(default)]
    pub optional: bool,

    #[serde(default)]
    pub optional_dependency: OptionalDependency,
}

/// Default per-attempt timeout for steps that don't specify one
fn default_timeout_ms() -> u64 {
    10_000
}

impl Step {
    /// Creates a new step calling `endpoint`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::time::Duration;
    /// use conductor::workflow::Step;
    ///
    /// let step = Step::new("recommend", "recommendation")
    ///     .depends_on("build_profile")
    ///     .with_timeout(Duration::from_secs(5));
    /// ```
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            endpoint: endpoint.into().trim().to_string(),
            depends_on: Vec::new(),
            input: InputMapping::default(),
            timeout_ms: default_timeout_ms(),
            retry: RetryPolicy::default(),
            optional: false,
            optional_dependency: OptionalDependency::default(),
        }
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.push(step_id.into());
        self
    }

    /// Marks this step optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_mapping(mut self, mapping: InputMapping) -> Self {
        self.input = mapping;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Skip this step instead of running it when an optional dependency fails.
    pub fn skip_on_optional_failure(mut self) -> Self {
        self.optional_dependency = OptionalDependency::Skip;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Serialized shape of a workflow; the index is rebuilt on load.
#[derive(Deserialize)]
struct GraphDefinition {
    id: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    steps: Vec<Step>,
    #[serde(default)]
    merge: MergeRule,
    #[serde(default)]
    failure_policy: FailurePolicy,
}

fn default_version() -> String {
    "1".to_string()
}

impl From<GraphDefinition> for WorkflowGraph {
    fn from(def: GraphDefinition) -> Self {
        WorkflowGraph::new(def.id, def.steps)
            .with_version(def.version)
            .with_merge(def.merge)
            .with_failure_policy(def.failure_policy)
    }
}

/// An immutable workflow: ordered steps plus workflow-level settings.
///
/// Building a graph never fails; structural checks live in
/// [`validate`](super::validator::validate).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "GraphDefinition")]
pub struct WorkflowGraph {
    id: String,
    version: String,
    steps: Vec<Step>,
    merge: MergeRule,
    failure_policy: FailurePolicy,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl WorkflowGraph {
    /// Creates a graph from steps in declaration order.
    ///
    /// If ids repeat, lookups resolve to the first occurrence.
    pub fn new(id: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut index = HashMap::with_capacity(steps.len());
        for (position, step) in steps.iter().enumerate() {
            index.entry(step.id.clone()).or_insert(position);
        }

        Self {
            id: id.into(),
            version: default_version(),
            steps,
            merge: MergeRule::default(),
            failure_policy: FailurePolicy::default(),
            index,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_merge(mut self, merge: MergeRule) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn merge(&self) -> &MergeRule {
        &self.merge
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Gets a step by ID.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.index.get(id).map(|&position| &self.steps[position])
    }

    /// Arena position of a step.
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Returns steps with no dependencies (entry points).
    pub fn root_steps(&self) -> Vec<&Step> {
        self.steps.iter().filter(|s| s.depends_on.is_empty()).collect()
    }

    /// Returns steps nothing depends on (exit points).
    pub fn leaf_steps(&self) -> Vec<&Step> {
        let depended_on: BTreeSet<&str> = self
            .steps
            .iter()
            .flat_map(|s| s.depends_on.iter().map(String::as_str))
            .collect();

        self.steps
            .iter()
            .filter(|s| !depended_on.contains(s.id.as_str()))
            .collect()
    }

    /// Returns the steps that directly depend on `id`.
    pub fn dependents(&self, id: &str) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.depends_on.iter().any(|dep| dep == id))
            .collect()
    }

    /// Distinct endpoints used by the workflow, sorted.
    pub fn endpoints(&self) -> Vec<String> {
        let endpoints: BTreeSet<&str> = self.steps.iter().map(|s| s.endpoint.as_str()).collect();
        endpoints.into_iter().map(str::to_string).collect()
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
