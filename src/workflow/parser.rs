//! Workflow Parser
//!
//! Loads workflow definitions from YAML and validates them before handing
//! them out. A graph returned from here is safe to execute.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::WorkflowGraph;
use super::validator::validate;
use crate::error::WorkflowLoadError;

/// Parses and validates a workflow from YAML text.
pub fn parse_workflow(yaml: &str) -> Result<WorkflowGraph, WorkflowLoadError> {
    debug!("YAML content loaded ({} bytes)", yaml.len());

    let graph: WorkflowGraph = serde_yaml::from_str(yaml)?;
    info!(
        "Parsed workflow '{}' v{}: {} steps, {} endpoints",
        graph.id(),
        graph.version(),
        graph.len(),
        graph.endpoints().len()
    );

    validate(&graph)?;
    Ok(graph)
}

/// Loads a workflow from a YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use conductor::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let graph = load_workflow("outfit.yaml")?;
///     println!("Loaded {} steps", graph.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<WorkflowGraph, WorkflowLoadError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| WorkflowLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_workflow(&yaml)
}

/// Saves a workflow to a YAML file.
pub fn save_workflow(graph: &WorkflowGraph, path: impl AsRef<Path>) -> Result<(), WorkflowLoadError> {
    let path = path.as_ref();
    let yaml = serde_yaml::to_string(graph)?;
    fs::write(path, yaml).map_err(|source| WorkflowLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    info!("Workflow saved to: {}", path.display());
    Ok(())
}
