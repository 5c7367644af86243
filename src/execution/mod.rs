//! Workflow Execution Module
//!
//! Runs validated workflow graphs against registered services.
//!
//! # Architecture
//!
//! - [`engine`]: Public entry point; submits runs and tracks them
//! - [`scheduler`]: Per-run loop that launches ready steps within budget
//! - [`task`]: One step's attempts, retries and backoff
//! - [`step`]: A single service invocation under a deadline
//! - [`context`]: Run state, step lattice and event log
//! - [`aggregator`]: Final workflow result from a finished run

pub mod aggregator;
pub mod context;
pub mod engine;
pub mod scheduler;
pub mod step;
pub mod task;

pub use aggregator::{aggregate, StepResult, WorkflowResult, WorkflowStatus};
pub use context::{ExecutionContext, RunId, RunSnapshot, StepState, Termination};
pub use engine::{Engine, RunOptions};
