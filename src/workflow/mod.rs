//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing, and
//! validating service workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, WorkflowGraph)
//! - [`mapping`]: Input mappings from workflow input and step outputs
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and dependency checking
//! - [`planner`]: Topological order and step readiness

pub mod mapping;
pub mod model;
pub mod parser;
pub mod planner;
pub mod validator;

pub use mapping::{InputMapping, ValueSource};
pub use model::{FailurePolicy, MergeRule, OptionalDependency, Step, WorkflowGraph};
pub use parser::{load_workflow, parse_workflow, save_workflow};
pub use planner::{ExecutionPlanner, Readiness};
pub use validator::{topological_order, validate, validate_all};
