//! Conductor - Workflow Orchestration Engine
//!
//! Runs workflows made of calls to remote services. A workflow is a
//! dependency graph of steps; each step calls one service endpoint with a
//! payload built from the workflow input and the outputs of earlier steps.
//! Independent steps run concurrently within a per-run budget, failures are
//! retried with backoff, and unhealthy endpoints are isolated by circuit
//! breakers shared across runs.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - [`workflow`]: Workflow graphs, input mappings, parsing and validation
//! - [`execution`]: Engine, per-run scheduler and result aggregation
//! - [`service`]: Service trait with HTTP, command and in-process transports
//! - [`policy`]: Retry policies and circuit breakers
//! - [`monitoring`]: Step events and execution timelines
//! - [`config`]: Engine configuration loaded from YAML
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conductor::execution::RunOptions;
//! use conductor::{load_config, load_workflow, Engine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load services and a workflow from YAML
//!     let engine = Engine::from_config(load_config("conductor.yaml")?)?;
//!     let workflow = Arc::new(load_workflow("outfit.yaml")?);
//!
//!     // Execute the workflow
//!     let input = serde_json::json!({"user_id": 42});
//!     let result = engine.run(workflow, input, RunOptions::default()).await?;
//!     println!("{}: {}", result.status, result.output);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod policy;
pub mod service;
pub mod workflow;

// Re-export commonly used types
pub use config::{load_config, EngineConfig};
pub use error::{EngineError, GraphError, InvariantError, StepError};
pub use execution::{Engine, RunId, RunOptions, WorkflowResult, WorkflowStatus};
pub use service::{CallerContext, Service, ServiceRegistry};
pub use workflow::model::{Step, WorkflowGraph};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "Conductor";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_version() {
        assert!(!VERSION.is_empty());
        assert!(VERSION.contains('.'));
    }

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "Conductor");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("test", "echo");
        assert_eq!(step.id, "test");
        assert_eq!(step.endpoint, "echo");
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = WorkflowGraph::new("empty", Vec::new());
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_version_format() {
        let parts: Vec<&str> = VERSION.split('.').collect();
        assert!(parts.len() >= 2, "Version should have at least major.minor");
        for part in parts {
            assert!(part.parse::<u32>().is_ok(), "Version components should be numeric");
        }
    }
}
